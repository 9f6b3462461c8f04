//! Trait seams between the overlay's subsystems
//!
//! The router, partner supervisors, and the proxy manager are wired
//! through these traits rather than concrete types, so each layer can be
//! exercised against in-memory doubles.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::peer_id::PeerId;
use crate::protocol::OverlayMessage;
use crate::session::SessionId;

/// Lifecycle state of a reliable connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// No usable session
    Disconnected,
    /// Handshake in flight
    Handshaking,
    /// Stream established
    Connected,
}

/// One message received from a peer link, tagged with the session it
/// arrived on so the router can apply split-horizon flooding
#[derive(Debug)]
pub struct Inbound {
    /// The remote peer of the link that received the message
    pub peer: PeerId,
    /// Identity of the underlying session
    pub session: SessionId,
    /// The decoded message
    pub message: OverlayMessage,
}

/// One reliable message link to a remote peer
///
/// Implemented by the direct connection (over a peer TCP session) and by
/// the relay connection (over a pooled relay session).
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// The remote peer this link targets
    fn peer(&self) -> PeerId;

    /// Current lifecycle state
    fn status(&self) -> LinkStatus;

    /// Identity of the current underlying session, if any
    fn session_id(&self) -> Option<SessionId>;

    /// Bring the link up; returns whether the stream is established
    async fn connect(&self) -> bool;

    /// Tear the link down and release its session
    async fn disconnect(&self);

    /// Send one message over the reliable stream
    async fn send(&self, msg: &OverlayMessage) -> Result<(), TransportError>;

    /// Install the upward sink for received messages
    ///
    /// Installing the same sink again is a no-op in effect; installing a
    /// different sink replaces the previous one.
    fn install_sink(&self, sink: mpsc::Sender<Inbound>);

    /// Remove the upward sink; subsequent messages are dropped
    fn clear_sink(&self);

    /// Probe the round trip, returning elapsed milliseconds or
    /// `u32::MAX` on timeout
    async fn check_ping(&self) -> u32;

    /// Feed a round-trip sample into the link's retransmit bound
    fn record_rtt(&self, ms: u32);
}

/// Routed send surface the upper layers consume
///
/// Implemented by the router; the proxy manager uses it to address
/// payloads to a peer without knowing the path.
#[async_trait]
pub trait OverlaySender: Send + Sync {
    /// Send an opaque payload to a peer through the overlay
    ///
    /// Best-effort: forwarding failures are logged by the router and
    /// never surface here.
    async fn send_to(&self, to: PeerId, payload: Bytes);
}
