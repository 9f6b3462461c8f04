//! Error types for the lanmesh overlay
//!
//! One enum per concern; each crate returns the enums for the layers it
//! touches.

use thiserror::Error;

/// Errors in wire encoding and decoding
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

/// Errors in session and link transport
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Link not ready")]
    LinkNotReady,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Errors in relay session management
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Relay dial failed: {0}")]
    DialFailed(String),

    #[error("Relay rejected the link request")]
    Rejected,

    #[error("Relay handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Errors in route computation and forwarding
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("No route available to destination")]
    NoRoute,

    #[error("TTL expired for packet")]
    TtlExpired,

    #[error("Router is not signed in to the rendezvous server")]
    NotSignedIn,
}

/// Errors in the proxy subsystem
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Port {port} is already in use: {reason}")]
    PortInUse { port: u16, reason: String },

    #[error("Mapping already exists for this partner and port")]
    MappingExists,

    #[error("Socket error: {0}")]
    Socket(String),
}
