//! # lanmesh-routing
//!
//! The control plane of the lanmesh overlay: a distance-vector /
//! link-state hybrid that discovers the minimum-latency next hop to
//! every known peer and forwards datagrams hop-by-hop with a TTL.
//!
//! ## Key Types
//!
//! - [`RouteTable`]: newest link-state per source plus the next-hop map
//!   computed from them
//! - [`Router`]: the background task that sweeps direct links, floods
//!   link state, and forwards packets

pub mod router;
pub mod table;

pub use router::*;
pub use table::*;
