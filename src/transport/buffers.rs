//! Send and receive buffers for the hybrid transport
//!
//! The send side keeps every Data packet until it is acknowledged or its
//! retransmissions are exhausted. The receive side holds out-of-order
//! arrivals until the in-order cursor reaches them. Both are keyed by
//! sequence number for O(1) acknowledgment lookup.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::{HtrError, Result};

/// A sent Data packet awaiting acknowledgment
#[derive(Debug, Clone)]
pub struct SentEntry {
    pub sequence: u32,
    /// Encoded wire bytes, resent verbatim on retransmission
    pub bytes: Vec<u8>,
    /// First transmission time; the RTT sample base
    pub first_send_time: Instant,
    /// Most recent transmission time; drives the retransmit age check
    pub send_time: Instant,
    pub retransmit_count: u32,
}

/// Outcome of one retransmission sweep
#[derive(Debug, Default)]
pub struct SweepOutcome {
    /// Sequence and wire bytes of every entry due for retransmission
    pub retransmits: Vec<(u32, Vec<u8>)>,
    /// Entries that exhausted their retransmissions and were dropped
    pub lost: u64,
}

/// Unacknowledged-sent list, capped at the send window
#[derive(Debug)]
pub struct SendBuffer {
    entries: HashMap<u32, SentEntry>,
    capacity: usize,
}

impl SendBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True once the window is full; callers must stop producing Data
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Track a freshly sent Data packet
    pub fn push(&mut self, sequence: u32, bytes: Vec<u8>) -> Result<()> {
        if self.is_full() {
            return Err(HtrError::BufferFull);
        }
        let now = Instant::now();
        self.entries.insert(
            sequence,
            SentEntry {
                sequence,
                bytes,
                first_send_time: now,
                send_time: now,
                retransmit_count: 0,
            },
        );
        Ok(())
    }

    /// Remove the entry acknowledged by `sequence`, if still present.
    ///
    /// Duplicate acknowledgments find nothing and are no-ops.
    pub fn ack(&mut self, sequence: u32) -> Option<SentEntry> {
        self.entries.remove(&sequence)
    }

    /// Age out entries: those past `timeout` are either handed back for
    /// retransmission (count bumped, send time reset) or, once
    /// `max_retransmits` is spent, dropped and counted as lost.
    pub fn sweep(&mut self, timeout: Duration, max_retransmits: u32) -> SweepOutcome {
        let now = Instant::now();
        let mut outcome = SweepOutcome::default();
        let mut exhausted = Vec::new();

        for entry in self.entries.values_mut() {
            if now.duration_since(entry.send_time) <= timeout {
                continue;
            }
            if entry.retransmit_count < max_retransmits {
                entry.retransmit_count += 1;
                entry.send_time = now;
                outcome.retransmits.push((entry.sequence, entry.bytes.clone()));
            } else {
                exhausted.push(entry.sequence);
            }
        }

        for sequence in exhausted {
            self.entries.remove(&sequence);
            outcome.lost += 1;
        }

        outcome
    }

    #[cfg(test)]
    pub fn contains(&self, sequence: u32) -> bool {
        self.entries.contains_key(&sequence)
    }
}

/// An out-of-order Data arrival waiting for the cursor
#[derive(Debug, Clone)]
pub struct RecvEntry {
    pub payload: Vec<u8>,
    pub recv_time: Instant,
}

/// Received-packet list with the in-order delivery cursor
#[derive(Debug)]
pub struct RecvBuffer {
    entries: HashMap<u32, RecvEntry>,
    /// Next sequence expected by the application
    cursor: u32,
}

impl RecvBuffer {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            cursor: 0,
        }
    }

    /// The next in-order sequence expected
    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Buffer an arrived Data payload.
    ///
    /// Sequences behind the cursor were already delivered and are
    /// discarded; a pending duplicate is replaced by the later arrival.
    /// Returns whether the payload was kept.
    pub fn insert(&mut self, sequence: u32, payload: Vec<u8>) -> bool {
        if Self::is_behind(sequence, self.cursor) {
            return false;
        }
        self.entries.insert(
            sequence,
            RecvEntry {
                payload,
                recv_time: Instant::now(),
            },
        );
        true
    }

    /// Copy in-order payloads into `out`, advancing the cursor, until the
    /// first gap or a full output buffer. Oversized payloads are truncated
    /// to the remaining space.
    pub fn drain(&mut self, out: &mut [u8]) -> usize {
        let mut written = 0;
        while written < out.len() {
            let Some(entry) = self.entries.remove(&self.cursor) else {
                break;
            };
            let take = entry.payload.len().min(out.len() - written);
            out[written..written + take].copy_from_slice(&entry.payload[..take]);
            written += take;
            self.cursor = self.cursor.wrapping_add(1);
        }
        written
    }

    /// Wrapping "already delivered" test against the cursor
    fn is_behind(sequence: u32, cursor: u32) -> bool {
        sequence.wrapping_sub(cursor) > u32::MAX / 2
    }
}

impl Default for RecvBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::thread::sleep;

    #[test]
    fn test_ack_removes_exactly_once() {
        let mut buf = SendBuffer::new(8);
        buf.push(10, vec![1]).unwrap();
        buf.push(11, vec![2]).unwrap();

        assert!(buf.ack(10).is_some());
        assert!(buf.ack(10).is_none(), "duplicate ack must be a no-op");
        assert!(buf.contains(11));
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn test_window_cap() {
        let mut buf = SendBuffer::new(2);
        buf.push(0, vec![]).unwrap();
        buf.push(1, vec![]).unwrap();
        assert!(buf.is_full());
        assert!(matches!(buf.push(2, vec![]), Err(HtrError::BufferFull)));
        buf.ack(0);
        assert!(buf.push(2, vec![]).is_ok());
    }

    #[test]
    fn test_sweep_retransmits_then_drops() {
        let mut buf = SendBuffer::new(8);
        buf.push(5, vec![0xAB]).unwrap();
        let timeout = Duration::from_millis(10);

        // Fresh entry is left alone.
        let outcome = buf.sweep(timeout, 2);
        assert!(outcome.retransmits.is_empty());
        assert_eq!(outcome.lost, 0);

        sleep(Duration::from_millis(15));
        let outcome = buf.sweep(timeout, 2);
        assert_eq!(outcome.retransmits.len(), 1);
        assert_eq!(outcome.retransmits[0].0, 5);

        sleep(Duration::from_millis(15));
        let outcome = buf.sweep(timeout, 2);
        assert_eq!(outcome.retransmits.len(), 1);

        // Third expiry exceeds max_retransmits = 2.
        sleep(Duration::from_millis(15));
        let outcome = buf.sweep(timeout, 2);
        assert!(outcome.retransmits.is_empty());
        assert_eq!(outcome.lost, 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_sweep_resets_age() {
        let mut buf = SendBuffer::new(8);
        buf.push(1, vec![]).unwrap();
        sleep(Duration::from_millis(15));
        assert_eq!(buf.sweep(Duration::from_millis(10), 3).retransmits.len(), 1);
        // Just retransmitted, so nothing is due yet.
        assert!(buf.sweep(Duration::from_millis(10), 3).retransmits.is_empty());
    }

    #[test]
    fn test_drain_in_order_until_gap() {
        let mut buf = RecvBuffer::new();
        // Sequences 0..4 arrive out of order, 2 is missing.
        buf.insert(1, b"bb".to_vec());
        buf.insert(0, b"aa".to_vec());
        buf.insert(3, b"dd".to_vec());

        let mut out = [0u8; 64];
        let n = buf.drain(&mut out);
        assert_eq!(&out[..n], b"aabb");
        assert_eq!(buf.cursor(), 2);

        // The gap fills, delivery resumes in order.
        buf.insert(2, b"cc".to_vec());
        let n = buf.drain(&mut out);
        assert_eq!(&out[..n], b"ccdd");
        assert_eq!(buf.cursor(), 4);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_drain_truncates_to_output_space() {
        let mut buf = RecvBuffer::new();
        buf.insert(0, b"abcdef".to_vec());

        let mut out = [0u8; 4];
        let n = buf.drain(&mut out);
        assert_eq!(&out[..n], b"abcd");
        // The entry is consumed even though its tail was truncated.
        assert_eq!(buf.cursor(), 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_duplicate_pending_is_replaced() {
        let mut buf = RecvBuffer::new();
        buf.insert(0, b"old".to_vec());
        assert!(buf.insert(0, b"new".to_vec()));

        let mut out = [0u8; 8];
        let n = buf.drain(&mut out);
        assert_eq!(&out[..n], b"new");
    }

    #[test]
    fn test_duplicate_delivered_is_discarded() {
        let mut buf = RecvBuffer::new();
        buf.insert(0, b"x".to_vec());
        let mut out = [0u8; 8];
        buf.drain(&mut out);
        assert_eq!(buf.cursor(), 1);

        // A late retransmission of sequence 0 must not be buffered again.
        assert!(!buf.insert(0, b"x".to_vec()));
        assert!(buf.is_empty());
        assert_eq!(buf.drain(&mut out), 0);
    }

    #[test]
    fn test_cursor_wraps() {
        let mut buf = RecvBuffer::new();
        buf.cursor = u32::MAX;
        buf.insert(u32::MAX, b"a".to_vec());
        buf.insert(0, b"b".to_vec());
        let mut out = [0u8; 8];
        let n = buf.drain(&mut out);
        assert_eq!(&out[..n], b"ab");
        assert_eq!(buf.cursor(), 1);
        // Both sequences are now behind the wrapped cursor.
        assert!(!buf.insert(u32::MAX, b"a".to_vec()));
        assert!(!buf.insert(0, b"b".to_vec()));
    }

    proptest! {
        // Any permutation of a contiguous run drains back in sequence order.
        #[test]
        fn prop_drain_orders_any_permutation(seed in any::<u64>(), count in 1usize..20) {
            let mut order: Vec<u32> = (0..count as u32).collect();
            let mut rng = fastrand::Rng::with_seed(seed);
            rng.shuffle(&mut order);

            let mut buf = RecvBuffer::new();
            for seq in order {
                buf.insert(seq, vec![seq as u8]);
            }

            let mut out = vec![0u8; count];
            let n = buf.drain(&mut out);
            prop_assert_eq!(n, count);
            let expected: Vec<u8> = (0..count as u8).collect();
            prop_assert_eq!(out, expected);
        }

        // Membership equals sent minus acked minus retransmit-exhausted.
        #[test]
        fn prop_ack_set_difference(
            acks in proptest::collection::vec(0u32..32, 0..64),
        ) {
            let sent: Vec<u32> = (0..32).collect();
            let mut buf = SendBuffer::new(64);
            for &seq in &sent {
                buf.push(seq, vec![]).unwrap();
            }

            let mut acked = HashSet::new();
            for seq in acks {
                let removed = buf.ack(seq).is_some();
                prop_assert_eq!(removed, acked.insert(seq));
            }

            for &seq in &sent {
                prop_assert_eq!(buf.contains(seq), !acked.contains(&seq));
            }
            prop_assert_eq!(buf.len(), sent.len() - acked.len());
        }
    }
}
