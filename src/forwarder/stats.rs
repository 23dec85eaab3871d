//! Process-wide forwarder statistics and the periodic report

use std::time::{Duration, Instant};

use tracing::info;

use crate::forwarder::pair::ConnectionPair;

/// Totals across the forwarder's lifetime plus report bookkeeping.
///
/// Byte counters from closed pairs are folded in at cleanup so totals
/// survive pool compaction; live pairs are summed at report time.
#[derive(Debug)]
pub struct ForwarderStats {
    pub total_connections: u64,
    retired_bytes_sent: u64,
    retired_bytes_received: u64,
    started_at: Instant,
    last_report: Instant,
}

impl ForwarderStats {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            total_connections: 0,
            retired_bytes_sent: 0,
            retired_bytes_received: 0,
            started_at: now,
            last_report: now,
        }
    }

    /// Count a newly established pair
    pub fn record_connection(&mut self) {
        self.total_connections += 1;
    }

    /// Fold a closed pair's byte counters into the lifetime totals
    pub fn absorb_pair(&mut self, pair: &ConnectionPair) {
        self.retired_bytes_sent += pair.bytes_sent;
        self.retired_bytes_received += pair.bytes_received;
    }

    /// Whether the periodic report is due
    pub fn due(&self, interval: Duration) -> bool {
        self.last_report.elapsed() >= interval
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Lifetime bytes forwarded client → target, including live pairs
    pub fn total_bytes_sent(&self, pairs: &[ConnectionPair]) -> u64 {
        self.retired_bytes_sent + pairs.iter().map(|p| p.bytes_sent).sum::<u64>()
    }

    /// Lifetime bytes forwarded target → client, including live pairs
    pub fn total_bytes_received(&self, pairs: &[ConnectionPair]) -> u64 {
        self.retired_bytes_received + pairs.iter().map(|p| p.bytes_received).sum::<u64>()
    }

    /// Emit the periodic statistics block, plus per-pair status lines when
    /// verbose logging is on
    pub fn report(&mut self, pairs: &[ConnectionPair], verbose: bool) {
        let uptime = self.uptime().as_secs();
        let sent = self.total_bytes_sent(pairs);
        let received = self.total_bytes_received(pairs);
        let throughput_kb_per_sec = if uptime > 0 {
            (sent + received) as f64 / 1024.0 / uptime as f64
        } else {
            0.0
        };

        info!("=== forwarder statistics ===");
        info!("uptime: {} seconds", uptime);
        info!("total connections: {}", self.total_connections);
        info!("active connections: {}", pairs.len());
        info!("total bytes sent: {}", sent);
        info!("total bytes received: {}", received);
        info!("average throughput: {:.2} KB/s", throughput_kb_per_sec);

        if verbose && !pairs.is_empty() {
            info!("=== connection status report ===");
            for (index, pair) in pairs.iter().enumerate() {
                pair.log_status(index);
            }
        }

        self.last_report = Instant::now();
    }
}

impl Default for ForwarderStats {
    fn default() -> Self {
        Self::new()
    }
}
