//! Router background task
//!
//! The [`Router`] owns the overlay's control loop:
//!
//! - every sweep interval, and on every peer add or remove, it pings all
//!   direct peers concurrently, assembles the local [`LinkState`], floods
//!   it, and applies it to the [`RouteTable`]
//! - inbound link-state floods are applied and re-flooded to every
//!   direct peer except the session they arrived on (split horizon)
//! - routed packets are delivered upward at their destination or
//!   forwarded along the next hop with a decremented TTL; expiry reports
//!   exactly one [`TransmitErrorPacket`] back to the origin
//!
//! Forwarding failures are logged and never propagated to callers; a
//! packet with no route is dropped without an error reply so an
//! unreachable origin cannot start a loop.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use lanmesh_core::{
    DEFAULT_TTL, Inbound, LinkState, LinkStatePacket, OverlayMessage, OverlayPacket,
    OverlaySender, Peer, PeerEvent, PeerId, PeerRegistry, RouterConfig, RoutingError, ServerLink,
    SessionId, TransmitError, TransmitErrorPacket,
};

use crate::table::RouteTable;

/// Events the router delivers to upper layers
#[derive(Debug, Clone)]
pub enum RouterEvent {
    /// A packet addressed to this host arrived
    Delivery {
        /// The originating peer
        from: PeerId,
        /// Remaining TTL at arrival
        ttl: u8,
        /// The opaque application payload
        payload: Bytes,
    },

    /// A transmit error travelled back to this host
    TransmitError {
        /// What went wrong
        error: TransmitError,
        /// The peer that reported the failure
        reporter: PeerId,
        /// The destination the failed packet was addressed to
        original_to: PeerId,
        /// Payload of the failed packet, when echoed
        payload: Option<Bytes>,
    },
}

/// The overlay's routing task
pub struct Router {
    self_id: PeerId,
    registry: Arc<PeerRegistry>,
    table: Arc<RouteTable>,
    server: Arc<dyn ServerLink>,
    events: mpsc::Sender<RouterEvent>,
    inbound_tx: mpsc::Sender<Inbound>,
    cancel: CancellationToken,
    cfg: RouterConfig,
}

impl Router {
    /// Create a router and start its background task
    ///
    /// Returns the router handle and the channel its delivery events
    /// arrive on.
    pub fn spawn(
        registry: Arc<PeerRegistry>,
        server: Arc<dyn ServerLink>,
        cfg: RouterConfig,
        cancel: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<RouterEvent>) {
        let self_id = server.user_id();
        let (events_tx, events_rx) = mpsc::channel(cfg.event_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(cfg.inbound_capacity);

        let router = Arc::new(Self {
            self_id,
            registry,
            table: Arc::new(RouteTable::new(self_id)),
            server,
            events: events_tx,
            inbound_tx,
            cancel,
            cfg,
        });

        tokio::spawn(router.clone().run(inbound_rx));

        (router, events_rx)
    }

    /// The local peer id
    pub fn self_id(&self) -> PeerId {
        self.self_id
    }

    /// The route table the router maintains
    pub fn table(&self) -> &Arc<RouteTable> {
        &self.table
    }

    /// Send an opaque payload to a peer through the overlay
    ///
    /// Wraps the payload in a fresh packet and hands it to the
    /// forwarding path. Failures are logged, never returned.
    pub async fn send(&self, to: PeerId, payload: Bytes) {
        let packet = OverlayPacket {
            from: self.self_id,
            to,
            ttl: DEFAULT_TTL,
            payload,
        };
        self.forward(packet).await;
    }

    /// Run one packet through the forwarding path
    pub async fn forward(&self, mut packet: OverlayPacket) {
        if packet.to == self.self_id {
            let event = RouterEvent::Delivery {
                from: packet.from,
                ttl: packet.ttl,
                payload: packet.payload,
            };
            if self.events.send(event).await.is_err() {
                debug!("Delivery channel closed, dropping packet");
            }
            return;
        }

        if packet.ttl <= 1 {
            debug!(
                to = %packet.to.short_id(),
                from = %packet.from.short_id(),
                error = %RoutingError::TtlExpired,
                "Reporting to origin"
            );
            let report = TransmitErrorPacket {
                error: TransmitError::Expired,
                from: self.self_id,
                to: packet.from,
                original_to: packet.to,
                payload: Some(packet.payload),
                ttl: DEFAULT_TTL,
            };
            self.route_error(report).await;
            return;
        }
        packet.ttl -= 1;

        let dest = packet.to;
        if let Err(e) = self.forward_to(dest, &OverlayMessage::Packet(packet)).await {
            debug!(dest = %dest.short_id(), error = %e, "Dropping packet");
        }
    }

    fn check_rendezvous(&self) -> Result<(), RoutingError> {
        if self.server.is_connected() && self.server.is_signed_in() {
            Ok(())
        } else {
            Err(RoutingError::NotSignedIn)
        }
    }

    async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<Inbound>) {
        if let Err(e) = self.check_rendezvous() {
            info!(error = %e, "Router exiting");
            return;
        }

        let mut peer_events = self.registry.subscribe();
        for peer in self.registry.snapshot() {
            self.attach(&peer);
        }

        let mut sweep = tokio::time::interval(self.cfg.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sweep.tick() => self.link_sweep().await,
                event = peer_events.recv() => match event {
                    Ok(PeerEvent::Added(peer)) => {
                        self.attach(&peer);
                        self.link_sweep().await;
                    }
                    Ok(PeerEvent::Removed(peer)) => self.handle_peer_removed(&peer).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Peer event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                message = inbound.recv() => match message {
                    Some(inbound) => self.handle_inbound(inbound).await,
                    None => break,
                },
            }
        }
        info!("Router task ended");
    }

    fn attach(&self, peer: &Peer) {
        peer.link.install_sink(self.inbound_tx.clone());
        if self.table.forward_interface(&peer.id).is_none() {
            self.table.force_add(peer.id, peer.id);
        }
        debug!(peer = %peer.id.short_id(), "Peer attached to router");
    }

    async fn handle_peer_removed(&self, peer: &Peer) {
        peer.link.clear_sink();
        self.table.remove_seed(&peer.id);
        if let Some(mut state) = self.table.self_link_state() {
            if state.set_cost(&peer.id, lanmesh_core::COST_UNREACHABLE) {
                state.timestamp = now_millis();
                self.table.update(state);
            }
        }
        debug!(peer = %peer.id.short_id(), "Peer detached from router");
        self.link_sweep().await;
    }

    /// One round of probe, assemble, flood, apply
    async fn link_sweep(&self) {
        let peers = self.registry.snapshot();

        let probes = peers.iter().map(|peer| {
            let link = peer.link.clone();
            let id = peer.id;
            async move { (id, link.check_ping().await) }
        });
        let results = futures::future::join_all(probes).await;

        let mut interfaces = Vec::with_capacity(results.len());
        let mut costs = Vec::with_capacity(results.len());
        for (id, cost) in results {
            interfaces.push(id);
            costs.push(cost);
        }

        let state = LinkState {
            source: self.self_id,
            timestamp: now_millis(),
            interfaces,
            costs,
        };
        trace!(peers = peers.len(), "Link sweep complete");

        let flood = OverlayMessage::LinkState(LinkStatePacket {
            state: state.clone(),
            ttl: DEFAULT_TTL,
        });
        for peer in &peers {
            if let Err(e) = peer.link.send(&flood).await {
                debug!(peer = %peer.id.short_id(), error = %e, "Link-state broadcast skipped");
            }
        }

        self.table.update(state);
    }

    async fn handle_inbound(&self, inbound: Inbound) {
        match inbound.message {
            OverlayMessage::Packet(packet) => self.forward(packet).await,
            OverlayMessage::LinkState(packet) => {
                self.handle_link_state(inbound.session, packet).await
            }
            OverlayMessage::TransmitError(report) => self.handle_error_packet(report).await,
            OverlayMessage::PingReq { .. } | OverlayMessage::PingResp { .. } => {
                trace!("Link-local message reached the router, ignoring");
            }
        }
    }

    async fn handle_link_state(&self, arrival: SessionId, mut packet: LinkStatePacket) {
        if packet.state.source == self.self_id {
            return;
        }

        if packet.ttl <= 1 {
            // Expired link-state reports carry no payload back
            let report = TransmitErrorPacket {
                error: TransmitError::Expired,
                from: self.self_id,
                to: packet.state.source,
                original_to: packet.state.source,
                payload: None,
                ttl: DEFAULT_TTL,
            };
            self.route_error(report).await;
            return;
        }
        packet.ttl -= 1;

        self.table.update(packet.state.clone());

        // Split-horizon flood, best effort
        let flood = OverlayMessage::LinkState(packet);
        for peer in self.registry.snapshot() {
            if peer.link.session_id() == Some(arrival) {
                continue;
            }
            if let Err(e) = peer.link.send(&flood).await {
                trace!(peer = %peer.id.short_id(), error = %e, "Flood skipped");
            }
        }
    }

    async fn handle_error_packet(&self, mut report: TransmitErrorPacket) {
        if report.to == self.self_id {
            self.route_error(report).await;
            return;
        }
        if report.ttl <= 1 {
            debug!(error = %RoutingError::TtlExpired, "Dropping transmit error report");
            return;
        }
        report.ttl -= 1;
        self.route_error(report).await;
    }

    /// Deliver a transmit error locally or send it toward its origin
    async fn route_error(&self, report: TransmitErrorPacket) {
        if report.to == self.self_id {
            warn!(
                original_to = %report.original_to.short_id(),
                error = ?report.error,
                "Transmit error reported"
            );
            let event = RouterEvent::TransmitError {
                error: report.error,
                reporter: report.from,
                original_to: report.original_to,
                payload: report.payload,
            };
            let _ = self.events.send(event).await;
            return;
        }

        let dest = report.to;
        if let Err(e) = self
            .forward_to(dest, &OverlayMessage::TransmitError(report))
            .await
        {
            debug!(dest = %dest.short_id(), error = %e, "Dropping transmit error");
        }
    }

    /// Send a message toward a destination via the next hop, falling
    /// back to the destination's own direct link
    async fn forward_to(&self, dest: PeerId, msg: &OverlayMessage) -> Result<(), RoutingError> {
        if let Some(hop) = self.table.forward_interface(&dest) {
            if let Some(peer) = self.registry.get(&hop) {
                match peer.link.send(msg).await {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        debug!(hop = %hop.short_id(), error = %e, "Next-hop send failed")
                    }
                }
            }
        }

        if let Some(peer) = self.registry.get(&dest) {
            match peer.link.send(msg).await {
                Ok(()) => return Ok(()),
                Err(e) => debug!(dest = %dest.short_id(), error = %e, "Direct send failed"),
            }
        }

        Err(RoutingError::NoRoute)
    }
}

#[async_trait]
impl OverlaySender for Router {
    async fn send_to(&self, to: PeerId, payload: Bytes) {
        self.send(to, payload).await;
    }
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
