//! Rendezvous-side collaborator interfaces
//!
//! The rendezvous server (sign-in, peer introduction, room placement) is
//! external to this stack. These traits are the slice of it the overlay
//! consumes; the hosting application provides the live implementations.

use std::fmt::{self, Display};
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::peer_id::PeerId;

/// Identifier of the room a peer was placed in at sign-in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomId(Uuid);

impl RoomId {
    /// Create a room id from raw bytes
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Generate a fresh random room id
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// State of the link to the rendezvous server
pub trait ServerLink: Send + Sync {
    /// Whether the rendezvous connection is up
    fn is_connected(&self) -> bool;

    /// Whether sign-in completed
    fn is_signed_in(&self) -> bool;

    /// The peer id the server assigned at sign-in
    fn user_id(&self) -> PeerId;
}

/// The room placement the rendezvous server reported
pub trait RoomInfo: Send + Sync {
    /// The current room
    fn room_id(&self) -> RoomId;
}

/// Fixed [`ServerLink`] for tests and early startup
pub struct StaticServerLink {
    user_id: PeerId,
    connected: AtomicBool,
    signed_in: AtomicBool,
}

impl StaticServerLink {
    /// Create a server link in the signed-in state
    pub fn signed_in(user_id: PeerId) -> Self {
        Self {
            user_id,
            connected: AtomicBool::new(true),
            signed_in: AtomicBool::new(true),
        }
    }

    /// Create a server link that never signed in
    pub fn offline(user_id: PeerId) -> Self {
        Self {
            user_id,
            connected: AtomicBool::new(false),
            signed_in: AtomicBool::new(false),
        }
    }

    /// Flip the connected flag
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    /// Flip the signed-in flag
    pub fn set_signed_in(&self, signed_in: bool) {
        self.signed_in.store(signed_in, Ordering::Release);
    }
}

impl ServerLink for StaticServerLink {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn is_signed_in(&self) -> bool {
        self.signed_in.load(Ordering::Acquire)
    }

    fn user_id(&self) -> PeerId {
        self.user_id
    }
}

/// Fixed [`RoomInfo`] for tests
pub struct StaticRoomInfo {
    room_id: RoomId,
}

impl StaticRoomInfo {
    /// Create room info for a fixed room
    pub fn new(room_id: RoomId) -> Self {
        Self { room_id }
    }
}

impl RoomInfo for StaticRoomInfo {
    fn room_id(&self) -> RoomId {
        self.room_id
    }
}
