//! Peers and the peer registry
//!
//! A [`Peer`] ties a remote host's identity to its direct link. The
//! [`PeerRegistry`] owns the live peer set under a single mutex and
//! publishes add/remove events on a broadcast channel, replacing the
//! source design's multicast delegates.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::debug;

use crate::peer_id::PeerId;
use crate::traits::{LinkStatus, PeerLink};

/// A known remote host and its direct link
pub struct Peer {
    /// Identity assigned by the rendezvous server
    pub id: PeerId,
    /// Address the link was established to
    pub remote_address: SocketAddr,
    /// The reliable link to this peer
    pub link: Arc<dyn PeerLink>,
}

impl Peer {
    /// Create a peer record
    pub fn new(id: PeerId, remote_address: SocketAddr, link: Arc<dyn PeerLink>) -> Self {
        Self {
            id,
            remote_address,
            link,
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id.short_id())
            .field("remote_address", &self.remote_address)
            .field("status", &self.link.status())
            .finish()
    }
}

/// Membership changes of the peer set
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A peer joined the set
    Added(Arc<Peer>),
    /// A peer left the set
    Removed(Arc<Peer>),
}

/// Owner of the live peer set
///
/// Exactly one live [`Peer`] exists per id; inserting a second replaces
/// the first. All access goes through one mutex so the router can take a
/// consistent snapshot before fanning out concurrent pings.
pub struct PeerRegistry {
    peers: Mutex<HashMap<PeerId, Arc<Peer>>>,
    events: broadcast::Sender<PeerEvent>,
}

impl PeerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            peers: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Insert a peer, returning the replaced record if the id was live
    pub fn insert(&self, peer: Peer) -> Option<Arc<Peer>> {
        let peer = Arc::new(peer);
        let previous = {
            let mut peers = self.peers.lock().expect("peer registry poisoned");
            peers.insert(peer.id, peer.clone())
        };
        if let Some(old) = &previous {
            debug!(peer = %old.id.short_id(), "Replacing live peer");
            let _ = self.events.send(PeerEvent::Removed(old.clone()));
        }
        let _ = self.events.send(PeerEvent::Added(peer));
        previous
    }

    /// Remove a peer by id
    pub fn remove(&self, id: &PeerId) -> Option<Arc<Peer>> {
        let removed = {
            let mut peers = self.peers.lock().expect("peer registry poisoned");
            peers.remove(id)
        };
        if let Some(peer) = &removed {
            let _ = self.events.send(PeerEvent::Removed(peer.clone()));
        }
        removed
    }

    /// Get a peer by id
    pub fn get(&self, id: &PeerId) -> Option<Arc<Peer>> {
        self.peers
            .lock()
            .expect("peer registry poisoned")
            .get(id)
            .cloned()
    }

    /// Snapshot the live peer set under the registry lock
    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers
            .lock()
            .expect("peer registry poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Whether a peer is present with an established link
    pub fn has_link(&self, id: &PeerId) -> bool {
        self.get(id)
            .map(|p| p.link.status() == LinkStatus::Connected)
            .unwrap_or(false)
    }

    /// Number of live peers
    pub fn len(&self) -> usize {
        self.peers.lock().expect("peer registry poisoned").len()
    }

    /// Whether the peer set is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to membership events
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::protocol::OverlayMessage;
    use crate::session::SessionId;
    use crate::traits::Inbound;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    /// Link double with a fixed status
    struct FixedLink {
        peer: PeerId,
        status: LinkStatus,
    }

    #[async_trait]
    impl PeerLink for FixedLink {
        fn peer(&self) -> PeerId {
            self.peer
        }

        fn status(&self) -> LinkStatus {
            self.status
        }

        fn session_id(&self) -> Option<SessionId> {
            None
        }

        async fn connect(&self) -> bool {
            false
        }

        async fn disconnect(&self) {}

        async fn send(&self, _msg: &OverlayMessage) -> Result<(), TransportError> {
            Err(TransportError::LinkNotReady)
        }

        fn install_sink(&self, _sink: mpsc::Sender<Inbound>) {}

        fn clear_sink(&self) {}

        async fn check_ping(&self) -> u32 {
            u32::MAX
        }

        fn record_rtt(&self, _ms: u32) {}
    }

    fn make_peer(b: u8, status: LinkStatus) -> Peer {
        let id = PeerId::from_bytes([b; 16]);
        Peer::new(
            id,
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(FixedLink { peer: id, status }),
        )
    }

    #[test]
    fn test_insert_get_remove() {
        let registry = PeerRegistry::new();
        let id = PeerId::from_bytes([1; 16]);

        assert!(registry.insert(make_peer(1, LinkStatus::Connected)).is_none());
        assert!(registry.get(&id).is_some());
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(&id).is_some());
        assert!(registry.get(&id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_one_live_peer_per_id() {
        let registry = PeerRegistry::new();

        registry.insert(make_peer(1, LinkStatus::Connected));
        let replaced = registry.insert(make_peer(1, LinkStatus::Disconnected));

        assert!(replaced.is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_has_link_requires_connected() {
        let registry = PeerRegistry::new();
        let up = PeerId::from_bytes([1; 16]);
        let down = PeerId::from_bytes([2; 16]);

        registry.insert(make_peer(1, LinkStatus::Connected));
        registry.insert(make_peer(2, LinkStatus::Disconnected));

        assert!(registry.has_link(&up));
        assert!(!registry.has_link(&down));
        assert!(!registry.has_link(&PeerId::from_bytes([9; 16])));
    }

    #[tokio::test]
    async fn test_membership_events() {
        let registry = PeerRegistry::new();
        let mut events = registry.subscribe();
        let id = PeerId::from_bytes([1; 16]);

        registry.insert(make_peer(1, LinkStatus::Connected));
        match events.recv().await.unwrap() {
            PeerEvent::Added(p) => assert_eq!(p.id, id),
            other => panic!("Expected Added, got {:?}", other),
        }

        registry.remove(&id);
        match events.recv().await.unwrap() {
            PeerEvent::Removed(p) => assert_eq!(p.id, id),
            other => panic!("Expected Removed, got {:?}", other),
        }
    }

    #[test]
    fn test_snapshot_is_complete() {
        let registry = PeerRegistry::new();
        registry.insert(make_peer(1, LinkStatus::Connected));
        registry.insert(make_peer(2, LinkStatus::Connected));
        registry.insert(make_peer(3, LinkStatus::Disconnected));

        assert_eq!(registry.snapshot().len(), 3);
    }
}
