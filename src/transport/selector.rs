//! Per-packet channel selection between the datagram and stream channels
//!
//! Fresh Data packets lean toward the datagram channel to keep head-of-line
//! blocking low; the bias shifts to the stream channel as observed loss and
//! latency grow.

use crate::transport::stats::EndpointStats;
use crate::transport::TransportMode;

/// Loss rate above which the stream channel gains extra weight
const LOSS_RATE_THRESHOLD: f32 = 0.05;

/// Average RTT (ms) above which the stream channel gains extra weight
const RTT_THRESHOLD_MS: u32 = 200;

/// Decide whether the next Data packet should go over the stream channel.
///
/// Single-channel modes are fixed; Hybrid and Auto draw against a
/// probability of `1 - udp_preference`, raised by 0.3 when the loss rate
/// exceeds 5% and by 0.2 when the RTT average exceeds 200 ms, clamped to
/// [0, 1].
pub fn should_use_stream_channel(
    mode: TransportMode,
    udp_preference: f32,
    stats: &EndpointStats,
    rng: &mut fastrand::Rng,
) -> bool {
    match mode {
        TransportMode::UdpOnly => false,
        TransportMode::TcpOnly => true,
        TransportMode::Hybrid | TransportMode::Auto => {
            let mut probability = 1.0 - udp_preference;
            if stats.loss_rate() > LOSS_RATE_THRESHOLD {
                probability += 0.3;
            }
            if stats.rtt_avg_ms > RTT_THRESHOLD_MS {
                probability += 0.2;
            }
            rng.f32() < probability.clamp(0.0, 1.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_fraction(udp_preference: f32, stats: &EndpointStats, trials: u32) -> f32 {
        let mut rng = fastrand::Rng::with_seed(0x5452_5448);
        let mut stream = 0u32;
        for _ in 0..trials {
            if should_use_stream_channel(TransportMode::Hybrid, udp_preference, stats, &mut rng) {
                stream += 1;
            }
        }
        stream as f32 / trials as f32
    }

    #[test]
    fn test_single_channel_modes_are_fixed() {
        let stats = EndpointStats::default();
        let mut rng = fastrand::Rng::with_seed(1);
        for _ in 0..100 {
            assert!(!should_use_stream_channel(TransportMode::UdpOnly, 0.0, &stats, &mut rng));
            assert!(should_use_stream_channel(TransportMode::TcpOnly, 1.0, &stats, &mut rng));
        }
    }

    #[test]
    fn test_healthy_path_follows_preference() {
        let stats = EndpointStats::default();
        let fraction = stream_fraction(0.8, &stats, 10_000);
        assert!((fraction - 0.2).abs() < 0.05, "stream fraction {} far from 0.2", fraction);
    }

    #[test]
    fn test_degraded_path_shifts_to_stream() {
        // 10% observed loss and 250 ms average RTT:
        // 1 - 0.8 + 0.3 + 0.2 = 0.7
        let mut stats = EndpointStats::default();
        stats.packets_sent = 100;
        stats.packets_lost = 10;
        stats.rtt_avg_ms = 250;

        let fraction = stream_fraction(0.8, &stats, 10_000);
        assert!((fraction - 0.7).abs() < 0.05, "stream fraction {} far from 0.7", fraction);
    }

    #[test]
    fn test_probability_clamps() {
        // Zero preference plus both penalties would exceed 1.
        let mut stats = EndpointStats::default();
        stats.packets_sent = 100;
        stats.packets_lost = 50;
        stats.rtt_avg_ms = 500;

        let mut rng = fastrand::Rng::with_seed(7);
        for _ in 0..100 {
            assert!(should_use_stream_channel(TransportMode::Hybrid, 0.0, &stats, &mut rng));
        }
    }

    #[test]
    fn test_full_preference_never_streams_when_healthy() {
        let stats = EndpointStats::default();
        let mut rng = fastrand::Rng::with_seed(7);
        for _ in 0..100 {
            assert!(!should_use_stream_channel(TransportMode::Hybrid, 1.0, &stats, &mut rng));
        }
    }
}
