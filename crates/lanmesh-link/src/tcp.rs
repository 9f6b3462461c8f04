//! Framed TCP session transport
//!
//! A [`TcpSession`] carries [`LinkFrame`]s over a TCP stream with the
//! u32-BE length-prefix framing from `lanmesh-core`. Writes go through
//! an async mutex on the write half; a background task reads frames and
//! feeds the inbox channel handed out at creation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use lanmesh_core::{
    LinkFrame, MAX_FRAME_SIZE, ProtocolError, SessionId, SessionLink, TransportError,
    encode_frame, next_session_id,
};

/// Read one length-prefixed frame from a stream
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<LinkFrame, TransportError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(map_read_err)?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        }
        .into());
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(map_read_err)?;

    postcard::from_bytes(&body)
        .map_err(|e| ProtocolError::Deserialization(e.to_string()).into())
}

/// Write one length-prefixed frame to a stream
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &LinkFrame,
) -> Result<(), TransportError> {
    let bytes = encode_frame(frame)?;
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))
}

fn map_read_err(e: std::io::Error) -> TransportError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        TransportError::ConnectionClosed
    } else {
        TransportError::ConnectionFailed(e.to_string())
    }
}

/// A direct peer session over TCP
pub struct TcpSession {
    id: SessionId,
    peer_addr: SocketAddr,
    writer: Mutex<OwnedWriteHalf>,
    open: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl TcpSession {
    /// Wrap an established stream and start its read loop
    ///
    /// Returns the session handle and the channel its inbound frames
    /// arrive on. The read loop ends, and the session closes, when the
    /// stream fails or the inbox is dropped.
    pub fn spawn(
        stream: TcpStream,
        inbox_capacity: usize,
    ) -> std::io::Result<(Arc<Self>, mpsc::Receiver<LinkFrame>)> {
        let peer_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(inbox_capacity);
        let open = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();

        let session = Arc::new(Self {
            id: next_session_id(),
            peer_addr,
            writer: Mutex::new(write_half),
            open: open.clone(),
            cancel: cancel.clone(),
        });

        tokio::spawn(read_loop(read_half, tx, open, cancel));

        Ok((session, rx))
    }

    /// Address of the remote end
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    inbox: mpsc::Sender<LinkFrame>,
    open: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = read_frame(&mut reader) => match frame {
                Ok(frame) => {
                    if inbox.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "TCP session read ended");
                    break;
                }
            }
        }
    }
    open.store(false, Ordering::Release);
    trace!("TCP session read loop ended");
}

#[async_trait]
impl SessionLink for TcpSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn send_frame(&self, frame: LinkFrame) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        let mut writer = self.writer.lock().await;
        match write_frame(&mut *writer, &frame).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.open.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanmesh_core::{LinkConfig, PeerId, TransDatagram};
    use bytes::Bytes;
    use tokio::net::TcpListener;

    fn peer(b: u8) -> PeerId {
        PeerId::from_bytes([b; 16])
    }

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dial = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (accepted, _) = listener.accept().await.unwrap();
        (dial.await.unwrap(), accepted)
    }

    #[tokio::test]
    async fn test_frames_cross_a_real_socket() {
        let (client, server) = tcp_pair().await;
        let cfg = LinkConfig::default();

        let (client_session, _client_rx) =
            TcpSession::spawn(client, cfg.inbox_capacity).unwrap();
        let (_server_session, mut server_rx) =
            TcpSession::spawn(server, cfg.inbox_capacity).unwrap();

        let datagram =
            TransDatagram::syn(3, peer(1), peer(2), Bytes::from_static(b"over tcp"));
        client_session
            .send_frame(LinkFrame::Datagram(datagram))
            .await
            .unwrap();

        match server_rx.recv().await.unwrap() {
            LinkFrame::Datagram(d) => {
                assert_eq!(d.seq, 3);
                assert_eq!(d.payload.unwrap().as_ref(), b"over tcp");
            }
            _ => panic!("Wrong frame type"),
        }
    }

    #[tokio::test]
    async fn test_remote_close_downs_the_session() {
        let (client, server) = tcp_pair().await;
        let cfg = LinkConfig::default();

        let (client_session, _client_rx) =
            TcpSession::spawn(client, cfg.inbox_capacity).unwrap();
        let (server_session, mut server_rx) =
            TcpSession::spawn(server, cfg.inbox_capacity).unwrap();

        client_session.close();
        drop(client_session);

        // The server read loop observes the close
        assert!(server_rx.recv().await.is_none());
        assert!(!server_session.is_open());
    }
}
