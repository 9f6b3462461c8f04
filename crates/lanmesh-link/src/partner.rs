//! Per-peer link supervision
//!
//! One [`Partner`] wraps each remote peer's link. Its loop reconnects a
//! downed link, probes an established one, and publishes up/down edges
//! on a broadcast channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use lanmesh_core::{LinkStatus, PartnerConfig, PeerId, PeerLink};

/// Link lifecycle edges a partner publishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartnerEvent {
    /// The link came up
    Connected(PeerId),
    /// The link went down
    Disconnected(PeerId),
}

/// Supervisor of one remote peer's link
pub struct Partner {
    peer: PeerId,
    link: Arc<dyn PeerLink>,
    latency_ms: AtomicU32,
    events: broadcast::Sender<PartnerEvent>,
    cancel: CancellationToken,
    cfg: PartnerConfig,
}

impl Partner {
    /// Wrap a link and start the supervision loop
    pub fn spawn(
        link: Arc<dyn PeerLink>,
        cfg: PartnerConfig,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        let partner = Arc::new(Self {
            peer: link.peer(),
            link,
            latency_ms: AtomicU32::new(u32::MAX),
            events,
            cancel,
            cfg,
        });
        tokio::spawn(partner.clone().run());
        partner
    }

    /// The supervised peer
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// The supervised link
    pub fn link(&self) -> &Arc<dyn PeerLink> {
        &self.link
    }

    /// Most recent round-trip measurement, if the link has answered one
    pub fn latency_ms(&self) -> Option<u32> {
        let latency = self.latency_ms.load(Ordering::Acquire);
        (latency != u32::MAX).then_some(latency)
    }

    /// Subscribe to up/down edges
    pub fn subscribe(&self) -> broadcast::Receiver<PartnerEvent> {
        self.events.subscribe()
    }

    /// Stop the supervision loop
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    async fn run(self: Arc<Self>) {
        let mut was_connected = self.link.status() == LinkStatus::Connected;
        let mut ticker = tokio::time::interval(self.cfg.reconnect_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if self.link.status() != LinkStatus::Connected {
                if was_connected {
                    was_connected = false;
                    self.latency_ms.store(u32::MAX, Ordering::Release);
                    info!(peer = %self.peer.short_id(), "Partner link went down");
                    let _ = self.events.send(PartnerEvent::Disconnected(self.peer));
                }
                if self.link.connect().await {
                    was_connected = true;
                    info!(peer = %self.peer.short_id(), "Partner link came up");
                    let _ = self.events.send(PartnerEvent::Connected(self.peer));
                } else {
                    debug!(peer = %self.peer.short_id(), "Partner reconnect attempt failed");
                }
            } else {
                if !was_connected {
                    // The responder side comes up without calling connect
                    was_connected = true;
                    let _ = self.events.send(PartnerEvent::Connected(self.peer));
                }
                let rtt = self.link.check_ping().await;
                if rtt != u32::MAX {
                    self.latency_ms.store(rtt, Ordering::Release);
                    self.link.record_rtt(rtt);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use lanmesh_core::{LinkConfig, memory_pair};
    use std::time::Duration;

    fn peer(b: u8) -> PeerId {
        PeerId::from_bytes([b; 16])
    }

    fn fast_config() -> PartnerConfig {
        PartnerConfig {
            reconnect_interval: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_partner_connects_and_measures() {
        let (a, b) = memory_pair(64);
        let conn_a = Connection::spawn(peer(1), peer(2), a.session, a.inbox, LinkConfig::default());
        let _conn_b = Connection::spawn(peer(2), peer(1), b.session, b.inbox, LinkConfig::default());

        let partner = Partner::spawn(conn_a, fast_config(), CancellationToken::new());
        let mut events = partner.subscribe();

        match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Ok(PartnerEvent::Connected(id))) => assert_eq!(id, peer(2)),
            other => panic!("Expected Connected, got {:?}", other),
        }

        // A later tick probes the link
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if partner.latency_ms().is_some() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("no latency sample recorded");
    }

    #[tokio::test]
    async fn test_partner_reports_down_edge_once() {
        let (a, b) = memory_pair(64);
        let conn_a = Connection::spawn(peer(1), peer(2), a.session, a.inbox, LinkConfig::default());
        let conn_b = Connection::spawn(peer(2), peer(1), b.session, b.inbox, LinkConfig::default());

        let partner = Partner::spawn(conn_a.clone(), fast_config(), CancellationToken::new());
        let mut events = partner.subscribe();

        match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Ok(PartnerEvent::Connected(_))) => {}
            other => panic!("Expected Connected, got {:?}", other),
        }

        conn_b.shutdown().await;

        match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Ok(PartnerEvent::Disconnected(id))) => assert_eq!(id, peer(2)),
            other => panic!("Expected Disconnected, got {:?}", other),
        }
        assert!(partner.latency_ms().is_none());

        partner.stop();
    }
}
