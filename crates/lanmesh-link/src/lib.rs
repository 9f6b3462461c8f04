//! # lanmesh-link
//!
//! The connection layer of the lanmesh overlay: one reliable, in-order
//! stream of application messages per remote peer, running over either a
//! direct peer TCP session or a pooled relay session.
//!
//! ## Key Types
//!
//! - [`Connection`]: the reliable SYN/ACK sliding-window stream; used
//!   directly over a direct peer session
//! - [`RelayConnection`]: the same stream over a shared, reference-counted
//!   relay session drawn from the [`RelayPool`]
//! - [`Partner`]: per-peer supervisor that keeps a link alive and
//!   measures its latency
//! - [`TcpSession`]: length-prefixed frame transport over a TCP stream

pub mod connection;
pub mod partner;
pub mod ping;
pub mod relay;
pub mod tcp;
pub mod window;

pub use connection::*;
pub use partner::*;
pub use ping::*;
pub use relay::*;
pub use tcp::*;
pub use window::*;
