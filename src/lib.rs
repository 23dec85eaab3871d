//! htrelay - Transparent RDP forwarder with a hybrid UDP/TCP transport

pub mod constants;
pub mod error;
pub mod forwarder;
pub mod transport;
pub mod utils;

// Re-export main components
pub use error::{HtrError, Result};
pub use forwarder::{ConnectionPair, Forwarder, ForwarderConfig, ForwarderStats, PairState};
pub use transport::{
    EndpointStats, HtpConfig, HtpEndpoint, HtpRuntime, TransportMode,
    packet::{PacketHeader, PacketType},
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
