//! Wire protocol for the lanmesh overlay
//!
//! Three layers of messages travel through the system:
//!
//! - [`LinkFrame`]: what an underlying session (direct TCP or shared
//!   relay) carries — windowed datagrams, heartbeats, and the relay
//!   handshake. Frames are postcard-encoded with a u32 length prefix.
//! - [`OverlayMessage`]: what rides inside a SYN datagram payload —
//!   pings, routed packets, link-state floods, and transmit errors.
//! - [`ProxyMessage`]: what the proxy subsystem puts inside routed
//!   packet payloads — tunnel negotiation, tunnel bytes, tunnel close.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::peer_id::PeerId;
use crate::rendezvous::RoomId;

/// Maximum encoded frame size (1 MB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Cost value that marks a link as down
pub const COST_UNREACHABLE: u32 = u32::MAX;

// ============================================================================
// Datagram layer
// ============================================================================

/// Flag bits of a [`TransDatagram`]
///
/// Flags combine as a bitmask (for example `SYN | ACK`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatagramFlags(u8);

impl DatagramFlags {
    /// Payload-bearing datagram that expects an acknowledgment
    pub const SYN: Self = Self(0x01);
    /// Acknowledgment of the sequence number in `seq`
    pub const ACK: Self = Self(0x02);
    /// Handshake opener sent by the initiating side
    pub const FIRST_HANDSHAKE: Self = Self(0x04);
    /// Handshake reply sent by the responding side
    pub const SECOND_HANDSHAKE: Self = Self(0x08);

    /// Get the raw bits
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Check whether all bits of `other` are set
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for DatagramFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// One datagram of the sliding-window stream protocol
///
/// `seq` indexes a ring of `BUFFER_LENGTH` slots on the sending side.
/// `relay_from` is stamped by a relay when it forwards the datagram, so
/// that connections sharing one relay session can tell senders apart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransDatagram {
    /// Flag bitmask
    pub flags: DatagramFlags,
    /// Window sequence number
    pub seq: u16,
    /// Originating peer
    pub source: PeerId,
    /// Target peer
    pub destination: PeerId,
    /// Set by a relay to the peer it received the datagram from
    pub relay_from: Option<PeerId>,
    /// Encoded [`OverlayMessage`], present on SYN datagrams
    pub payload: Option<Bytes>,
}

impl TransDatagram {
    /// Create a payload-bearing SYN datagram
    pub fn syn(seq: u16, source: PeerId, destination: PeerId, payload: Bytes) -> Self {
        Self {
            flags: DatagramFlags::SYN,
            seq,
            source,
            destination,
            relay_from: None,
            payload: Some(payload),
        }
    }

    /// Create an acknowledgment for `seq`
    pub fn ack(seq: u16, source: PeerId, destination: PeerId) -> Self {
        Self {
            flags: DatagramFlags::ACK,
            seq,
            source,
            destination,
            relay_from: None,
            payload: None,
        }
    }

    /// Create the handshake opener
    pub fn first_handshake(source: PeerId, destination: PeerId) -> Self {
        Self {
            flags: DatagramFlags::FIRST_HANDSHAKE,
            seq: 0,
            source,
            destination,
            relay_from: None,
            payload: None,
        }
    }

    /// Create the handshake reply
    pub fn second_handshake(source: PeerId, destination: PeerId) -> Self {
        Self {
            flags: DatagramFlags::SECOND_HANDSHAKE,
            seq: 0,
            source,
            destination,
            relay_from: None,
            payload: None,
        }
    }
}

/// Frames carried by an underlying session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LinkFrame {
    /// A windowed datagram
    Datagram(TransDatagram),

    /// Relay keepalive, sent every heartbeat interval
    HeartBeat,

    /// Relay link request, first message on a fresh relay session
    CreateRelayLink {
        /// The connecting peer
        user_id: PeerId,
        /// The room the peer was placed in at sign-in
        room_id: RoomId,
    },

    /// Relay link response
    RelayLinkCreated {
        /// Whether the relay accepted the link
        accepted: bool,
    },
}

// ============================================================================
// Overlay layer
// ============================================================================

/// Messages carried inside SYN datagram payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OverlayMessage {
    /// Round-trip probe; answered link-locally with [`OverlayMessage::PingResp`]
    PingReq {
        /// Correlates the response with the probe
        token: u32,
    },

    /// Answer to a probe with the same token
    PingResp {
        /// Token of the probe being answered
        token: u32,
    },

    /// A routed packet travelling hop-by-hop to its destination
    Packet(OverlayPacket),

    /// A flooded link-state advertisement
    LinkState(LinkStatePacket),

    /// Delivery failure report travelling back to a packet origin
    TransmitError(TransmitErrorPacket),
}

/// Hop-by-hop envelope around application data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayPacket {
    /// Originating peer
    pub from: PeerId,
    /// Final destination
    pub to: PeerId,
    /// Remaining hops before the packet is dropped
    pub ttl: u8,
    /// Opaque application payload
    pub payload: Bytes,
}

/// One peer's view of its direct links
///
/// Invariant: `interfaces` and `costs` have the same length. A cost of
/// [`COST_UNREACHABLE`] marks the link as down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkState {
    /// The peer this advertisement describes
    pub source: PeerId,
    /// Source-local unix milliseconds; newer advertisements replace older
    pub timestamp: i64,
    /// Direct peers of `source`
    pub interfaces: Vec<PeerId>,
    /// Round-trip cost in milliseconds per interface
    pub costs: Vec<u32>,
}

impl LinkState {
    /// Get the advertised cost to a direct peer, if listed
    pub fn cost_to(&self, peer: &PeerId) -> Option<u32> {
        self.interfaces
            .iter()
            .position(|p| p == peer)
            .map(|i| self.costs[i])
    }

    /// Overwrite the cost of one interface, returning whether it was listed
    pub fn set_cost(&mut self, peer: &PeerId, cost: u32) -> bool {
        match self.interfaces.iter().position(|p| p == peer) {
            Some(i) => {
                self.costs[i] = cost;
                true
            }
            None => false,
        }
    }
}

/// Flooding envelope around a [`LinkState`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkStatePacket {
    /// The advertisement being flooded
    pub state: LinkState,
    /// Remaining flood hops
    pub ttl: u8,
}

/// Why a packet could not be delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransmitError {
    /// The packet's TTL reached zero in transit
    Expired,
    /// No forwarding interface was known for the destination
    ///
    /// Reserved on the wire; the router logs and drops unroutable packets
    /// without replying, so that an unreachable origin cannot loop.
    NoRoute,
}

/// Report sent back to a packet origin when forwarding fails
///
/// Expired overlay packets echo their payload back to the origin;
/// expired link-state floods do not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransmitErrorPacket {
    /// What went wrong
    pub error: TransmitError,
    /// Peer reporting the failure
    pub from: PeerId,
    /// Origin the report travels back to
    pub to: PeerId,
    /// Destination the failed packet was addressed to
    pub original_to: PeerId,
    /// Payload of the failed packet, when applicable
    pub payload: Option<Bytes>,
    /// Remaining hops for the report itself
    pub ttl: u8,
}

// ============================================================================
// Proxy layer
// ============================================================================

/// Name of one proxied byte stream on this host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TunnelId {
    /// The remote peer of the tunnel
    pub partner: PeerId,
    /// Ephemeral port of the local client socket
    pub local_port: u16,
    /// Real service port on the remote host
    pub remote_port: u16,
}

impl std::fmt::Display for TunnelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}->{}",
            self.partner.short_id(),
            self.local_port,
            self.remote_port
        )
    }
}

/// Tunnel negotiation request and response
///
/// The responder echoes the request fields with `is_response` set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConnectReq {
    /// Whether this is the responder's echo
    pub is_response: bool,
    /// The peer hosting the mapped service (the request's target)
    pub client: PeerId,
    /// Ephemeral port of the accepted client socket
    pub client_port: u16,
    /// Real service port on the target host
    pub server_port: u16,
}

/// Messages the proxy subsystem routes inside overlay packet payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProxyMessage {
    /// Tunnel negotiation
    Connect(ProxyConnectReq),

    /// Bytes flowing through an established tunnel
    Data {
        /// The tunnel the bytes belong to
        tunnel: TunnelId,
        /// The bytes
        data: Bytes,
    },

    /// One side of a tunnel closed its socket
    Close {
        /// The tunnel being torn down
        tunnel: TunnelId,
    },
}

// ============================================================================
// Codec
// ============================================================================

/// Encode a link frame for wire transmission (u32-BE length prefix)
pub fn encode_frame(frame: &LinkFrame) -> Result<Bytes, ProtocolError> {
    let serialized =
        postcard::to_allocvec(frame).map_err(|e| ProtocolError::Serialization(e.to_string()))?;

    if serialized.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: serialized.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let len = serialized.len() as u32;
    let mut framed = Vec::with_capacity(4 + serialized.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&serialized);

    Ok(Bytes::from(framed))
}

/// Parse a length-prefixed link frame
pub fn decode_frame(data: &[u8]) -> Result<LinkFrame, ProtocolError> {
    if data.len() < 4 {
        return Err(ProtocolError::Truncated {
            needed: 4,
            available: data.len(),
        });
    }

    let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    if data.len() < 4 + len {
        return Err(ProtocolError::Truncated {
            needed: 4 + len,
            available: data.len(),
        });
    }

    postcard::from_bytes(&data[4..4 + len])
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))
}

/// Encode an overlay message for a datagram payload
pub fn encode_overlay(msg: &OverlayMessage) -> Result<Bytes, ProtocolError> {
    postcard::to_allocvec(msg)
        .map(Bytes::from)
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

/// Decode an overlay message from a datagram payload
pub fn decode_overlay(data: &[u8]) -> Result<OverlayMessage, ProtocolError> {
    postcard::from_bytes(data).map_err(|e| ProtocolError::Deserialization(e.to_string()))
}

/// Encode a proxy message for an overlay packet payload
pub fn encode_proxy(msg: &ProxyMessage) -> Result<Bytes, ProtocolError> {
    postcard::to_allocvec(msg)
        .map(Bytes::from)
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

/// Decode a proxy message from an overlay packet payload
pub fn decode_proxy(data: &[u8]) -> Result<ProxyMessage, ProtocolError> {
    postcard::from_bytes(data).map_err(|e| ProtocolError::Deserialization(e.to_string()))
}
