//! Tunnel negotiation and ownership
//!
//! The [`ProxyManager`] owns the proxy subsystem's three keyed
//! collections: acceptors per mapping, orphan sockets waiting for a
//! tunnel-open reply, and live proxy pairs. It speaks [`ProxyMessage`]s
//! through the overlay:
//!
//! - a locally accepted socket is stashed as an orphan and a connect
//!   request goes to the partner
//! - an inbound request dials the real local service and echoes the
//!   request as a response
//! - a response pops the matching orphan and binds it to a pair
//! - data and close messages are routed to the pair they name
//!
//! At most one pair exists per tunnel id; a newcomer disposes the
//! incumbent.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use lanmesh_core::{
    OverlaySender, PeerId, ProxyConfig, ProxyConnectReq, ProxyError, ProxyMessage, TunnelId,
    decode_proxy, encode_proxy,
};

use crate::acceptor::{Accepted, Acceptor};
use crate::pair::ProxyPair;

/// Owner of the proxy subsystem
pub struct ProxyManager {
    overlay: Arc<dyn OverlaySender>,
    acceptors: DashMap<(PeerId, u16), Acceptor>,
    orphans: DashMap<TunnelId, TcpStream>,
    pairs: DashMap<TunnelId, Arc<ProxyPair>>,
    accept_tx: mpsc::Sender<Accepted>,
    closed_tx: mpsc::Sender<TunnelId>,
    cfg: ProxyConfig,
    cancel: CancellationToken,
}

impl ProxyManager {
    /// Create a manager and start its event loop
    pub fn spawn(
        overlay: Arc<dyn OverlaySender>,
        cfg: ProxyConfig,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (accept_tx, accept_rx) = mpsc::channel(cfg.accept_capacity);
        let (closed_tx, closed_rx) = mpsc::channel(cfg.accept_capacity);

        let manager = Arc::new(Self {
            overlay,
            acceptors: DashMap::new(),
            orphans: DashMap::new(),
            pairs: DashMap::new(),
            accept_tx,
            closed_tx,
            cfg,
            cancel,
        });

        tokio::spawn(manager.clone().run(accept_rx, closed_rx));
        manager
    }

    /// Map a local port onto a partner's real service port
    ///
    /// Returns the address the listener bound (useful with port 0).
    pub async fn add_mapping(
        &self,
        partner: PeerId,
        local_port: u16,
        remote_port: u16,
    ) -> Result<SocketAddr, ProxyError> {
        let key = (partner, remote_port);
        if self.acceptors.contains_key(&key) {
            return Err(ProxyError::MappingExists);
        }

        let acceptor = Acceptor::bind(
            local_port,
            partner,
            remote_port,
            self.accept_tx.clone(),
            self.cancel.child_token(),
        )
        .await?;
        let addr = acceptor.local_addr();
        self.acceptors.insert(key, acceptor);
        Ok(addr)
    }

    /// Drop a mapping and stop its listener
    pub fn remove_mapping(&self, partner: PeerId, remote_port: u16) {
        if let Some((_, acceptor)) = self.acceptors.remove(&(partner, remote_port)) {
            acceptor.stop();
        }
    }

    /// Number of live tunnels
    pub fn active_tunnels(&self) -> usize {
        self.pairs.len()
    }

    /// Whether a tunnel currently has a live pair
    pub fn has_tunnel(&self, tunnel: &TunnelId) -> bool {
        self.pairs.contains_key(tunnel)
    }

    /// Number of sockets waiting for a tunnel-open reply
    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    /// Feed one overlay delivery into the proxy subsystem
    ///
    /// `from` is the peer the routed packet originated at.
    pub async fn handle_payload(&self, from: PeerId, payload: &[u8]) {
        let msg = match decode_proxy(payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(from = %from.short_id(), error = %e, "Undecodable proxy payload, dropping");
                return;
            }
        };

        match msg {
            ProxyMessage::Connect(req) if !req.is_response => {
                self.handle_connect_request(from, req).await
            }
            ProxyMessage::Connect(req) => self.handle_connect_response(req).await,
            ProxyMessage::Data { tunnel, data } => {
                // Tunnel ids are host-local: the sender keyed by us, we
                // key by the sender
                let tunnel = TunnelId {
                    partner: from,
                    ..tunnel
                };
                let pair = self.pairs.get(&tunnel).map(|p| p.clone());
                match pair {
                    Some(pair) => pair.write(data).await,
                    None => trace!(tunnel = %tunnel, "Data for unknown tunnel, dropping"),
                }
            }
            ProxyMessage::Close { tunnel } => {
                let tunnel = TunnelId {
                    partner: from,
                    ..tunnel
                };
                if let Some((_, pair)) = self.pairs.remove(&tunnel) {
                    pair.dispose();
                    debug!(tunnel = %tunnel, "Tunnel closed by remote");
                }
            }
        }
    }

    async fn run(
        self: Arc<Self>,
        mut accepted: mpsc::Receiver<Accepted>,
        mut closed: mpsc::Receiver<TunnelId>,
    ) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(handoff) = accepted.recv() => self.handle_accepted(handoff).await,
                Some(tunnel) = closed.recv() => self.handle_pair_closed(tunnel).await,
            }
        }
    }

    /// Outbound open: stash the socket, ask the partner for a tunnel
    async fn handle_accepted(&self, handoff: Accepted) {
        let client_port = match handoff.socket.peer_addr() {
            Ok(addr) => addr.port(),
            Err(e) => {
                warn!(error = %e, "Accepted socket without peer address, dropping");
                return;
            }
        };

        let tunnel = TunnelId {
            partner: handoff.partner,
            local_port: client_port,
            remote_port: handoff.remote_port,
        };
        if self.orphans.insert(tunnel, handoff.socket).is_some() {
            warn!(tunnel = %tunnel, "Replacing a waiting socket");
        }

        let request = ProxyMessage::Connect(ProxyConnectReq {
            is_response: false,
            client: handoff.partner,
            client_port,
            server_port: handoff.remote_port,
        });
        debug!(tunnel = %tunnel, "Requesting tunnel");
        self.send_proxy(handoff.partner, &request).await;
    }

    /// Inbound open: dial the real service and echo the request back
    async fn handle_connect_request(&self, from: PeerId, req: ProxyConnectReq) {
        let tunnel = TunnelId {
            partner: from,
            local_port: req.client_port,
            remote_port: req.server_port,
        };

        match TcpStream::connect(("127.0.0.1", req.server_port)).await {
            Ok(socket) => {
                let reply = ProxyMessage::Connect(ProxyConnectReq {
                    is_response: true,
                    ..req
                });
                self.send_proxy(from, &reply).await;
                self.install_pair(tunnel, from, socket);
                debug!(tunnel = %tunnel, "Tunnel opened toward the real service");
            }
            Err(e) => {
                error!(port = req.server_port, error = %e, "Real service is unreachable");
            }
        }
    }

    /// Tunnel-open reply: bind the waiting socket to its pair
    async fn handle_connect_response(&self, req: ProxyConnectReq) {
        let key = (req.client, req.server_port);
        if !self.acceptors.contains_key(&key) {
            error!(
                partner = %req.client.short_id(),
                port = req.server_port,
                "Connect response without an acceptor, dropping"
            );
            return;
        }

        let tunnel = TunnelId {
            partner: req.client,
            local_port: req.client_port,
            remote_port: req.server_port,
        };
        let Some((_, socket)) = self.orphans.remove(&tunnel) else {
            error!(tunnel = %tunnel, "Connect response without a waiting socket, dropping");
            return;
        };

        self.install_pair(tunnel, req.client, socket);
        debug!(tunnel = %tunnel, "Tunnel established");
    }

    fn install_pair(&self, tunnel: TunnelId, remote: PeerId, socket: TcpStream) {
        let pair = ProxyPair::spawn(
            tunnel,
            remote,
            socket,
            self.overlay.clone(),
            self.closed_tx.clone(),
            &self.cfg,
        );
        if let Some(previous) = self.pairs.insert(tunnel, pair) {
            error!(tunnel = %tunnel, "Duplicate tunnel, disposing the previous pair");
            previous.dispose();
        }
    }

    /// A pipe task ended: drop the pair and tell the remote side
    async fn handle_pair_closed(&self, tunnel: TunnelId) {
        if let Some((_, pair)) = self.pairs.remove(&tunnel) {
            pair.dispose();
            let close = ProxyMessage::Close { tunnel };
            self.send_proxy(tunnel.partner, &close).await;
            debug!(tunnel = %tunnel, "Tunnel closed locally");
        }
    }

    async fn send_proxy(&self, to: PeerId, msg: &ProxyMessage) {
        match encode_proxy(msg) {
            Ok(payload) => self.overlay.send_to(to, payload).await,
            Err(e) => warn!(error = %e, "Proxy message encode failed"),
        }
    }
}
