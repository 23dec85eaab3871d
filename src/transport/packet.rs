//! Packet codec for the hybrid transport wire format
//!
//! Every packet starts with a fixed 32-byte header followed by up to
//! [`MAX_PAYLOAD_SIZE`] payload bytes. All integer fields are little-endian
//! and written in declaration order with no padding; the checksum covers the
//! header plus payload with the checksum field zeroed.

use crate::constants::{
    HEADER_SIZE, MAX_PACKET_SIZE, MAX_PAYLOAD_SIZE, PROTOCOL_MAGIC, PROTOCOL_VERSION,
};
use crate::error::{HtrError, Result};
use crate::utils::checksum::rotating_checksum;
use crate::utils::time::timestamp_ms;

use static_assertions::const_assert;

// Wire layout: magic(4) version(1) type(1) flags(2) sequence(4)
// ack_sequence(4) window_size(2) payload_size(2) timestamp(4) checksum(4)
// reserved(4)
const_assert!(HEADER_SIZE == 32);
const_assert!(MAX_PACKET_SIZE == HEADER_SIZE + MAX_PAYLOAD_SIZE);

/// Offset of the checksum field within the header
const CHECKSUM_OFFSET: usize = 24;

/// Flags bit 0: the sender is closing the session
pub const FLAG_CLOSE: u16 = 0x0001;

/// Packet types carried in the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Data = 1,
    Ack = 2,
    Nack = 3,
    Heartbeat = 4,
    Control = 5,
    RetransmitRequest = 6,
}

impl TryFrom<u8> for PacketType {
    type Error = ();

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Data),
            2 => Ok(PacketType::Ack),
            3 => Ok(PacketType::Nack),
            4 => Ok(PacketType::Heartbeat),
            5 => Ok(PacketType::Control),
            6 => Ok(PacketType::RetransmitRequest),
            _ => Err(()),
        }
    }
}

/// Decoded packet header
///
/// Magic and version are validated on decode and written as constants on
/// encode, so they do not appear here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_type: PacketType,
    pub flags: u16,
    pub sequence: u32,
    /// For Ack packets, the sequence being acknowledged; for Data packets,
    /// the last sequence this side acknowledged
    pub ack_sequence: u32,
    pub window_size: u16,
    pub payload_size: u16,
    /// Millisecond wall clock at send time, informational only
    pub timestamp: u32,
    pub checksum: u32,
}

impl PacketHeader {
    /// Header for a Data packet carrying `payload_size` bytes
    pub fn data(sequence: u32, ack_sequence: u32, window_size: u16, payload_size: u16) -> Self {
        Self {
            packet_type: PacketType::Data,
            flags: 0,
            sequence,
            ack_sequence,
            window_size,
            payload_size,
            timestamp: timestamp_ms(),
            checksum: 0,
        }
    }

    /// Header acknowledging receipt of `acked_sequence`
    pub fn ack(sequence: u32, acked_sequence: u32) -> Self {
        Self {
            packet_type: PacketType::Ack,
            flags: 0,
            sequence,
            ack_sequence: acked_sequence,
            window_size: 0,
            payload_size: 0,
            timestamp: timestamp_ms(),
            checksum: 0,
        }
    }

    /// Header for a keep-alive heartbeat
    pub fn heartbeat(sequence: u32) -> Self {
        Self {
            packet_type: PacketType::Heartbeat,
            flags: 0,
            sequence,
            ack_sequence: 0,
            window_size: 0,
            payload_size: 0,
            timestamp: timestamp_ms(),
            checksum: 0,
        }
    }

    /// Header for a Control packet announcing session close
    pub fn control_close(sequence: u32) -> Self {
        Self {
            packet_type: PacketType::Control,
            flags: FLAG_CLOSE,
            sequence,
            ack_sequence: 0,
            window_size: 0,
            payload_size: 0,
            timestamp: timestamp_ms(),
            checksum: 0,
        }
    }

    /// True when the close flag is set
    pub fn is_close(&self) -> bool {
        self.flags & FLAG_CLOSE != 0
    }
}

/// Serialize a header and payload into wire bytes.
///
/// The header's `payload_size` and `checksum` fields are derived from the
/// actual payload; whatever the caller left in them is overwritten.
pub fn encode(header: &PacketHeader, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(HtrError::invalid_input(format!(
            "payload of {} bytes exceeds the {} byte limit",
            payload.len(),
            MAX_PAYLOAD_SIZE
        )));
    }

    let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len());
    bytes.extend_from_slice(&PROTOCOL_MAGIC.to_le_bytes());
    bytes.push(PROTOCOL_VERSION);
    bytes.push(header.packet_type as u8);
    bytes.extend_from_slice(&header.flags.to_le_bytes());
    bytes.extend_from_slice(&header.sequence.to_le_bytes());
    bytes.extend_from_slice(&header.ack_sequence.to_le_bytes());
    bytes.extend_from_slice(&header.window_size.to_le_bytes());
    bytes.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    bytes.extend_from_slice(&header.timestamp.to_le_bytes());
    bytes.extend_from_slice(&0u32.to_le_bytes());
    bytes.extend_from_slice(&[0u8; 4]);
    debug_assert_eq!(bytes.len(), HEADER_SIZE);
    bytes.extend_from_slice(payload);

    let checksum = rotating_checksum(&bytes);
    bytes[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&checksum.to_le_bytes());

    Ok(bytes)
}

/// Parse and validate wire bytes into a header and its payload.
///
/// Rejects short input, magic or version mismatches, oversized or truncated
/// payloads, unknown packet types, and checksum failures. On success the
/// returned header carries the checksum as received.
pub fn decode(bytes: &[u8]) -> Result<(PacketHeader, &[u8])> {
    if bytes.len() < HEADER_SIZE {
        return Err(HtrError::invalid_packet("shorter than the fixed header"));
    }

    let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if magic != PROTOCOL_MAGIC {
        return Err(HtrError::invalid_packet("magic mismatch"));
    }

    let version = bytes[4];
    if version != PROTOCOL_VERSION {
        return Err(HtrError::invalid_packet(format!("unsupported version {}", version)));
    }

    let packet_type = PacketType::try_from(bytes[5])
        .map_err(|_| HtrError::invalid_packet(format!("unknown packet type {}", bytes[5])))?;

    let payload_size = u16::from_le_bytes([bytes[18], bytes[19]]);
    if payload_size as usize > MAX_PAYLOAD_SIZE {
        return Err(HtrError::invalid_packet("declared payload exceeds the limit"));
    }
    let total = HEADER_SIZE + payload_size as usize;
    if bytes.len() < total {
        return Err(HtrError::invalid_packet("truncated payload"));
    }

    let received_checksum =
        u32::from_le_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]);

    // Recompute with the checksum field zeroed; the zeroing is local to
    // verification only.
    let mut scratch = [0u8; MAX_PACKET_SIZE];
    scratch[..total].copy_from_slice(&bytes[..total]);
    scratch[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].fill(0);
    if rotating_checksum(&scratch[..total]) != received_checksum {
        return Err(HtrError::invalid_packet("checksum mismatch"));
    }

    let header = PacketHeader {
        packet_type,
        flags: u16::from_le_bytes([bytes[6], bytes[7]]),
        sequence: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        ack_sequence: u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
        window_size: u16::from_le_bytes([bytes[16], bytes[17]]),
        payload_size,
        timestamp: u32::from_le_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]),
        checksum: received_checksum,
    };

    Ok((header, &bytes[HEADER_SIZE..total]))
}
