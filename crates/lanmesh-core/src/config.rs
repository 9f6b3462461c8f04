//! Protocol constants and subsystem configuration
//!
//! Every timeout and interval the overlay uses has its default here, in
//! one place. Tests shorten the intervals through the config structs.

use std::time::Duration;

/// Initial TTL of routed packets and link-state floods
pub const DEFAULT_TTL: u8 = 32;

/// Slots in a connection's send ring
///
/// Must be a power of two so sequence masking is a bitwise and.
pub const BUFFER_LENGTH: usize = 1024;

/// Mask that maps a sequence counter onto a ring slot
pub const SEQ_MASK: u16 = (BUFFER_LENGTH - 1) as u16;

/// Configuration of one reliable connection
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// How long to wait for the handshake reply
    pub handshake_timeout: Duration,
    /// How long a ping probe waits for its response
    pub ping_timeout: Duration,
    /// Cadence of the retransmit sweep
    pub retransmit_interval: Duration,
    /// Age before an unacked datagram is retransmitted, until an RTT
    /// sample is available
    pub initial_retransmit_age: Duration,
    /// Lower bound of the RTT-derived retransmit age
    pub retransmit_age_floor: Duration,
    /// Upper bound of the RTT-derived retransmit age
    pub retransmit_age_ceiling: Duration,
    /// Capacity of the inbound datagram channel
    pub inbox_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            ping_timeout: Duration::from_secs(5),
            retransmit_interval: Duration::from_millis(500),
            initial_retransmit_age: Duration::from_secs(1),
            retransmit_age_floor: Duration::from_millis(250),
            retransmit_age_ceiling: Duration::from_secs(5),
            inbox_capacity: 256,
        }
    }
}

/// Configuration of the shared relay pool
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// How often a heartbeat is written to a relay session
    pub heartbeat_interval: Duration,
    /// Silence threshold after which a relay session is torn down
    pub liveness_timeout: Duration,
    /// Lower bound of the random dial delay, milliseconds
    pub jitter_min_ms: u64,
    /// Upper bound of the random dial delay, milliseconds
    pub jitter_max_ms: u64,
    /// TCP dial timeout
    pub dial_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            liveness_timeout: Duration::from_secs(15),
            jitter_min_ms: 100,
            jitter_max_ms: 1000,
            dial_timeout: Duration::from_secs(10),
        }
    }
}

/// Configuration of the router task
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Interval between link-state sweeps
    pub sweep_interval: Duration,
    /// Capacity of the inbound message channel
    pub inbound_capacity: usize,
    /// Capacity of the delivery event channel
    pub event_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            inbound_capacity: 1024,
            event_capacity: 256,
        }
    }
}

/// Configuration of a partner supervisor
#[derive(Debug, Clone)]
pub struct PartnerConfig {
    /// Interval of the reconnect-and-probe loop
    pub reconnect_interval: Duration,
}

impl Default for PartnerConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(10),
        }
    }
}

/// Configuration of the proxy subsystem
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Size of the socket read buffer per tunnel
    pub read_buffer: usize,
    /// Capacity of the accepted-socket channel
    pub accept_capacity: usize,
    /// Capacity of a tunnel's outbound write channel
    pub write_capacity: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            read_buffer: 8192,
            accept_capacity: 64,
            write_capacity: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_length_is_power_of_two() {
        assert!(BUFFER_LENGTH.is_power_of_two());
        assert_eq!(SEQ_MASK as usize, BUFFER_LENGTH - 1);
    }

    #[test]
    fn test_default_timeouts() {
        let link = LinkConfig::default();
        assert_eq!(link.ping_timeout, Duration::from_secs(5));

        let relay = RelayConfig::default();
        assert_eq!(relay.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(relay.liveness_timeout, Duration::from_secs(15));
        assert_eq!(relay.jitter_min_ms, 100);
        assert_eq!(relay.jitter_max_ms, 1000);

        let router = RouterConfig::default();
        assert_eq!(router.sweep_interval, Duration::from_secs(30));

        let partner = PartnerConfig::default();
        assert_eq!(partner.reconnect_interval, Duration::from_secs(10));

        assert_eq!(DEFAULT_TTL, 32);
        assert_eq!(BUFFER_LENGTH, 1024);
    }
}
