//! # lanmesh-core
//!
//! Core types, wire protocol, and traits for the lanmesh overlay stack.
//!
//! lanmesh is the client-side core of a peer-to-peer overlay that lets
//! hosts behind NATs exchange application traffic as if they shared a
//! LAN. This crate provides the foundations the other crates build on:
//!
//! ## Key Types
//!
//! - [`PeerId`]: opaque 128-bit peer identifier assigned at sign-in
//! - [`TransDatagram`]: the SYN/ACK sliding-window datagram
//! - [`OverlayPacket`] / [`LinkStatePacket`]: hop-by-hop routed envelopes
//! - [`TunnelId`]: name of one proxied byte stream
//!
//! ## Key Traits
//!
//! - [`SessionLink`]: a raw framed stream a connection runs over
//! - [`PeerLink`]: one reliable message link to a remote peer
//! - [`ServerLink`] / [`RoomInfo`]: the rendezvous-side collaborators
//! - [`OverlaySender`]: the routed send surface upper layers consume

pub mod config;
pub mod error;
pub mod peer;
pub mod peer_id;
pub mod protocol;
pub mod rendezvous;
pub mod session;
pub mod traits;

// Re-export main types
pub use config::*;
pub use error::*;
pub use peer::*;
pub use peer_id::*;
pub use protocol::*;
pub use rendezvous::*;
pub use session::*;
pub use traits::*;
