//! Connection statistics for a hybrid transport endpoint

/// Cumulative counters and path-quality estimates for one endpoint.
///
/// RTT is tracked as running min/max plus an exponentially-weighted moving
/// average with 7/8 weight on history.
#[derive(Debug, Clone)]
pub struct EndpointStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub packets_retransmitted: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub rtt_min_ms: u32,
    pub rtt_max_ms: u32,
    pub rtt_avg_ms: u32,
    /// Packets sent over the datagram channel
    pub datagram_packets: u64,
    /// Packets sent over the stream channel
    pub stream_packets: u64,
}

impl Default for EndpointStats {
    fn default() -> Self {
        Self {
            packets_sent: 0,
            packets_received: 0,
            packets_lost: 0,
            packets_retransmitted: 0,
            bytes_sent: 0,
            bytes_received: 0,
            rtt_min_ms: u32::MAX,
            rtt_max_ms: 0,
            rtt_avg_ms: 0,
            datagram_packets: 0,
            stream_packets: 0,
        }
    }
}

impl EndpointStats {
    /// Feed one round-trip sample in milliseconds
    pub fn record_rtt(&mut self, sample_ms: u32) {
        if sample_ms < self.rtt_min_ms {
            self.rtt_min_ms = sample_ms;
        }
        if sample_ms > self.rtt_max_ms {
            self.rtt_max_ms = sample_ms;
        }
        if self.rtt_avg_ms == 0 {
            self.rtt_avg_ms = sample_ms;
        } else {
            self.rtt_avg_ms = ((7 * self.rtt_avg_ms as u64 + sample_ms as u64) / 8) as u32;
        }
    }

    /// Fraction of sent packets declared lost
    pub fn loss_rate(&self) -> f32 {
        if self.packets_sent == 0 {
            return 0.0;
        }
        self.packets_lost as f32 / self.packets_sent as f32
    }

    /// Fraction of sends that used the datagram channel
    pub fn udp_ratio(&self) -> f32 {
        let total = self.datagram_packets + self.stream_packets;
        if total == 0 {
            return 0.0;
        }
        self.datagram_packets as f32 / total as f32
    }

    /// Fraction of sends that used the stream channel
    pub fn tcp_ratio(&self) -> f32 {
        let total = self.datagram_packets + self.stream_packets;
        if total == 0 {
            return 0.0;
        }
        self.stream_packets as f32 / total as f32
    }

    /// Zero every counter and estimate
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
