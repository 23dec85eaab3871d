//! Wall-clock helpers for packet timestamps

use std::time::{SystemTime, UNIX_EPOCH};

/// Get current time in milliseconds since Unix epoch
pub fn get_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Millisecond clock truncated to the 32-bit packet timestamp field.
///
/// The field wraps roughly every 49 days; it is informational and never
/// used for arithmetic across the wrap.
pub fn timestamp_ms() -> u32 {
    get_millis() as u32
}
