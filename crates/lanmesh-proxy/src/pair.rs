//! One live tunnel between a local socket and the overlay

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use lanmesh_core::{OverlaySender, PeerId, ProxyConfig, ProxyMessage, TunnelId, encode_proxy};

/// Pipes bytes of one tunnel in both directions
///
/// Socket reads become `ProxyMessage::Data` payloads addressed to the
/// remote peer; inbound tunnel data is written back to the socket. When
/// either side ends, the pair reports its tunnel on the closed channel
/// and the manager disposes it.
pub struct ProxyPair {
    tunnel: TunnelId,
    remote: PeerId,
    writer_tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

impl ProxyPair {
    /// Bind a socket to a tunnel and start both pipe tasks
    pub fn spawn(
        tunnel: TunnelId,
        remote: PeerId,
        socket: TcpStream,
        overlay: Arc<dyn OverlaySender>,
        closed: mpsc::Sender<TunnelId>,
        cfg: &ProxyConfig,
    ) -> Arc<Self> {
        let (read_half, write_half) = socket.into_split();
        let (writer_tx, writer_rx) = mpsc::channel(cfg.write_capacity);
        let cancel = CancellationToken::new();

        tokio::spawn(read_task(
            tunnel,
            remote,
            read_half,
            overlay,
            closed.clone(),
            cancel.clone(),
            cfg.read_buffer,
        ));
        tokio::spawn(write_task(tunnel, write_half, writer_rx, closed, cancel.clone()));

        Arc::new(Self {
            tunnel,
            remote,
            writer_tx,
            cancel,
        })
    }

    /// The tunnel this pair serves
    pub fn tunnel(&self) -> TunnelId {
        self.tunnel
    }

    /// The remote peer of the tunnel
    pub fn remote(&self) -> PeerId {
        self.remote
    }

    /// Queue inbound tunnel bytes for the local socket
    pub async fn write(&self, data: Bytes) {
        if self.writer_tx.send(data).await.is_err() {
            trace!(tunnel = %self.tunnel, "Write after tunnel teardown, dropping");
        }
    }

    /// Stop both pipe tasks and drop the socket
    pub fn dispose(&self) {
        self.cancel.cancel();
    }
}

async fn read_task(
    tunnel: TunnelId,
    remote: PeerId,
    mut reader: OwnedReadHalf,
    overlay: Arc<dyn OverlaySender>,
    closed: mpsc::Sender<TunnelId>,
    cancel: CancellationToken,
    buffer_size: usize,
) {
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return,
            n = reader.read(&mut buf) => n,
        };
        match n {
            Ok(0) => break,
            Ok(n) => {
                let msg = ProxyMessage::Data {
                    tunnel,
                    data: Bytes::copy_from_slice(&buf[..n]),
                };
                match encode_proxy(&msg) {
                    Ok(payload) => overlay.send_to(remote, payload).await,
                    Err(e) => warn!(tunnel = %tunnel, error = %e, "Tunnel data encode failed"),
                }
            }
            Err(e) => {
                trace!(tunnel = %tunnel, error = %e, "Tunnel socket read ended");
                break;
            }
        }
    }
    let _ = closed.send(tunnel).await;
}

async fn write_task(
    tunnel: TunnelId,
    mut writer: OwnedWriteHalf,
    mut data: mpsc::Receiver<Bytes>,
    closed: mpsc::Sender<TunnelId>,
    cancel: CancellationToken,
) {
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return,
            chunk = data.recv() => chunk,
        };
        match chunk {
            Some(chunk) => {
                if let Err(e) = writer.write_all(&chunk).await {
                    trace!(tunnel = %tunnel, error = %e, "Tunnel socket write ended");
                    break;
                }
            }
            None => break,
        }
    }
    let _ = closed.send(tunnel).await;
}
