//! Error types and handling for the htrelay crate

use thiserror::Error;

/// Result type alias for htrelay operations
pub type Result<T> = std::result::Result<T, HtrError>;

/// Main error type for the htrelay crate
#[derive(Error, Debug)]
pub enum HtrError {
    /// I/O errors from network operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors from OS-level calls (polling, socket options, signals)
    #[error("system call failed: {0}")]
    Sys(#[from] nix::Error),

    /// Invalid user-supplied input (bad address, bad config value)
    #[error("invalid input: {message}")]
    InvalidInput {
        /// Description of the rejected input
        message: String,
    },

    /// Socket setup or channel errors (create, bind, connect, channel gone)
    #[error("socket error: {message}")]
    Socket {
        /// Description of the socket failure
        message: String,
    },

    /// A received packet failed validation and was discarded
    #[error("invalid packet: {reason}")]
    InvalidPacket {
        /// Which validation step rejected the packet
        reason: String,
    },

    /// The unacknowledged-send buffer is at its window capacity
    #[error("send buffer is full")]
    BufferFull,

    /// The endpoint is no longer connected (idle timeout or close received)
    #[error("endpoint closed")]
    EndpointClosed,

    /// The connection pool already holds `max_clients` pairs
    #[error("connection pool exhausted")]
    PoolExhausted,
}

impl HtrError {
    /// Create a new invalid-input error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create a new socket error
    pub fn socket(message: impl Into<String>) -> Self {
        Self::Socket {
            message: message.into(),
        }
    }

    /// Create a new invalid-packet error
    pub fn invalid_packet(reason: impl Into<String>) -> Self {
        Self::InvalidPacket {
            reason: reason.into(),
        }
    }

    /// Check if this error is recoverable by retrying later
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::BufferFull | Self::PoolExhausted | Self::InvalidPacket { .. } => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::WouldBlock,
            _ => false,
        }
    }

    /// Check if this error is related to network operations
    pub fn is_network_error(&self) -> bool {
        matches!(self, Self::Socket { .. } | Self::Io(_) | Self::EndpointClosed)
    }

    /// True for a would-block condition that should yield back to the loop
    pub fn is_would_block(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::WouldBlock)
    }
}

/// Convenience macro for creating invalid-input errors
#[macro_export]
macro_rules! invalid_input_error {
    ($($arg:tt)*) => {
        $crate::error::HtrError::invalid_input(format!($($arg)*))
    };
}

/// Convenience macro for creating socket errors
#[macro_export]
macro_rules! socket_error {
    ($($arg:tt)*) => {
        $crate::error::HtrError::socket(format!($($arg)*))
    };
}
