//! Local listener of one port mapping

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use lanmesh_core::{PeerId, ProxyError};

/// A socket accepted on a mapped port, tagged with its mapping
#[derive(Debug)]
pub struct Accepted {
    /// The peer hosting the mapped service
    pub partner: PeerId,
    /// Real service port on the partner host
    pub remote_port: u16,
    /// The accepted client socket
    pub socket: TcpStream,
}

/// Listener on one mapped local port
///
/// Every accepted socket is handed upward through the sink channel; the
/// accept loop stops when the acceptor is cancelled.
pub struct Acceptor {
    partner: PeerId,
    remote_port: u16,
    local_addr: SocketAddr,
    cancel: CancellationToken,
}

impl Acceptor {
    /// Bind the mapped port and start accepting
    ///
    /// Fails when the port is already in use.
    pub async fn bind(
        local_port: u16,
        partner: PeerId,
        remote_port: u16,
        sink: mpsc::Sender<Accepted>,
        cancel: CancellationToken,
    ) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(("127.0.0.1", local_port))
            .await
            .map_err(|e| ProxyError::PortInUse {
                port: local_port,
                reason: e.to_string(),
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ProxyError::Socket(e.to_string()))?;

        tokio::spawn(accept_loop(listener, partner, remote_port, sink, cancel.clone()));

        debug!(addr = %local_addr, partner = %partner.short_id(), "Port mapping listening");
        Ok(Self {
            partner,
            remote_port,
            local_addr,
            cancel,
        })
    }

    /// The peer this mapping targets
    pub fn partner(&self) -> PeerId {
        self.partner
    }

    /// Real service port on the partner host
    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    /// Address the listener actually bound
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    partner: PeerId,
    remote_port: u16,
    sink: mpsc::Sender<Accepted>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, client)) => {
                    debug!(client = %client, partner = %partner.short_id(), "Accepted proxy client");
                    let handoff = Accepted {
                        partner,
                        remote_port,
                        socket,
                    };
                    if sink.send(handoff).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                }
            }
        }
    }
    debug!(partner = %partner.short_id(), "Accept loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn peer(b: u8) -> PeerId {
        PeerId::from_bytes([b; 16])
    }

    #[tokio::test]
    async fn test_accepted_sockets_are_emitted() {
        let (sink, mut accepted) = mpsc::channel(8);
        let acceptor = Acceptor::bind(0, peer(2), 4000, sink, CancellationToken::new())
            .await
            .unwrap();

        let mut client = TcpStream::connect(acceptor.local_addr()).await.unwrap();
        client.write_all(b"knock").await.unwrap();

        let handoff = accepted.recv().await.unwrap();
        assert_eq!(handoff.partner, peer(2));
        assert_eq!(handoff.remote_port, 4000);
    }

    #[tokio::test]
    async fn test_bound_port_fails_creation() {
        let (sink, _accepted) = mpsc::channel(8);
        let first = Acceptor::bind(0, peer(2), 4000, sink.clone(), CancellationToken::new())
            .await
            .unwrap();

        let taken = first.local_addr().port();
        let second = Acceptor::bind(taken, peer(2), 4000, sink, CancellationToken::new()).await;
        assert!(matches!(second, Err(ProxyError::PortInUse { port, .. }) if port == taken));
    }

    #[tokio::test]
    async fn test_cancelled_acceptor_stops() {
        let (sink, mut accepted) = mpsc::channel(8);
        let acceptor = Acceptor::bind(0, peer(2), 4000, sink, CancellationToken::new())
            .await
            .unwrap();
        let addr = acceptor.local_addr();

        acceptor.stop();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        // Connections after the stop are never handed upward
        let _client = TcpStream::connect(addr).await;
        let nothing =
            tokio::time::timeout(std::time::Duration::from_millis(200), accepted.recv()).await;
        assert!(matches!(nothing, Ok(None) | Err(_)));
    }
}
