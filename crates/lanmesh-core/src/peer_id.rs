//! Peer identifiers
//!
//! Every host in the overlay is named by an opaque 128-bit [`PeerId`]
//! assigned by the rendezvous server at sign-in. Ids are globally unique
//! and totally ordered; the ordering is used to break routing ties
//! deterministically.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque 128-bit peer identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(Uuid);

impl PeerId {
    /// Create a peer id from raw bytes
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Generate a fresh random peer id
    ///
    /// In production ids come from the rendezvous server; this is used by
    /// tests and by hosts that have not signed in yet.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the raw bytes
    pub const fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Short display form for logging
    pub fn short_id(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl From<Uuid> for PeerId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}
