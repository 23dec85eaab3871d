//! Protocol constants and forwarder defaults
//!
//! This module contains the wire-protocol constants of the hybrid transport
//! and the default tuning values used throughout the forwarder.

/// Protocol magic: the ASCII bytes `HTRP` read as a little-endian u32
pub const PROTOCOL_MAGIC: u32 = u32::from_le_bytes(*b"HTRP");

/// Supported protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed packet header size on the wire
pub const HEADER_SIZE: usize = 32;

/// Maximum payload carried by a single packet
pub const MAX_PAYLOAD_SIZE: usize = 1350;

/// Maximum on-wire packet size; keeps IPv4 UDP datagrams under a 1500-byte MTU
pub const MAX_PACKET_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD_SIZE;

/// Default send/receive window advertised in packet headers
pub const DEFAULT_WINDOW_SIZE: u16 = 64;

/// Default retransmission timeout in milliseconds
pub const DEFAULT_RETRANSMIT_TIMEOUT_MS: u64 = 100;

/// Default maximum retransmission attempts per packet
pub const DEFAULT_MAX_RETRANSMITS: u32 = 3;

/// Default fraction of data packets steered to the datagram channel
pub const DEFAULT_UDP_PREFERENCE: f32 = 0.8;

/// Default heartbeat interval in milliseconds
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1000;

/// Endpoint idle timeout: no activity for this long marks it not connected
pub const IDLE_TIMEOUT_MS: u64 = 30_000;

/// Standard RDP port, used as the default for both listening and forwarding
pub const DEFAULT_RDP_PORT: u16 = 3389;

/// Default scratch buffer size for socket-to-socket forwarding
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Default bound on concurrently active connection pairs
pub const DEFAULT_MAX_CLIENTS: usize = 10;

/// Default idle timeout for a connection pair, in seconds
pub const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 300;

/// Default spacing between successive target reconnect attempts, in seconds
pub const DEFAULT_RECONNECT_INTERVAL_SECS: u64 = 5;

/// Default send/receive timeout applied to tuned TCP sockets, in seconds
pub const DEFAULT_SOCKET_TIMEOUT_SECS: u64 = 30;

/// Default interval between periodic statistics reports, in seconds
pub const DEFAULT_STATS_INTERVAL_SECS: u64 = 60;

/// Default delay before the first target reconnect attempt, in milliseconds
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 100;

/// Default cap on target reconnect attempts before a pair is closed
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Default number of warm disconnected pairs retained for fast reconnect
pub const DEFAULT_CONNECTION_POOL_SIZE: usize = 2;

/// Default minimum pair age before a client drop qualifies for fast
/// reconnect; younger drops are treated as failed RDP handshakes
pub const DEFAULT_FAST_RECONNECT_MIN_AGE_SECS: u64 = 5;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/htrelay.conf";

/// Readiness-wait timeout per event-loop iteration, in milliseconds
pub const POLL_INTERVAL_MS: u16 = 100;

/// Pause before retrying a would-block write while draining a buffer
pub const WRITE_RETRY_DELAY_MS: u64 = 1;

/// Validate that the protocol constants are consistent with each other
pub fn validate_constants() -> Result<(), &'static str> {
    if MAX_PACKET_SIZE != HEADER_SIZE + MAX_PAYLOAD_SIZE {
        return Err("MAX_PACKET_SIZE must equal HEADER_SIZE + MAX_PAYLOAD_SIZE");
    }

    // 1500-byte Ethernet MTU minus IPv4 (20) and UDP (8) headers
    if MAX_PACKET_SIZE > 1472 {
        return Err("MAX_PACKET_SIZE must fit an unfragmented IPv4 UDP datagram");
    }

    if MAX_PAYLOAD_SIZE > (u16::MAX as usize) {
        return Err("MAX_PAYLOAD_SIZE must fit the u16 payload_size field");
    }

    if !(0.0..=1.0).contains(&DEFAULT_UDP_PREFERENCE) {
        return Err("DEFAULT_UDP_PREFERENCE must be within [0, 1]");
    }

    if DEFAULT_WINDOW_SIZE == 0 {
        return Err("DEFAULT_WINDOW_SIZE must be greater than 0");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants_validation() {
        assert!(validate_constants().is_ok());
    }

    #[test]
    fn test_magic_spells_htrp_on_the_wire() {
        assert_eq!(&PROTOCOL_MAGIC.to_le_bytes(), b"HTRP");
        assert_eq!(PROTOCOL_MAGIC, 0x5052_5448);
    }

    #[test]
    fn test_packet_fits_mtu() {
        assert_eq!(MAX_PACKET_SIZE, 1382);
        assert!(MAX_PACKET_SIZE + 20 + 8 <= 1500);
    }
}
