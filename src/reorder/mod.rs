//! Bounded, timeout-driven reorder queue keyed on a 16-bit sequence number.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropStrategy {
    Begin,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Uninitialized,
    Running,
}

struct Slot<T> {
    occupied: bool,
    seq: u16,
    deadline: Instant,
    value: Option<T>,
}

impl<T> Slot<T> {
    fn empty() -> Self {
        Self {
            occupied: false,
            seq: 0,
            deadline: Instant::now(),
            value: None,
        }
    }
}

/// `seq_a` is strictly older than `seq_b` under signed 16-bit wraparound comparison.
fn is_older(seq_a: u16, seq_b: u16) -> bool {
    (seq_a.wrapping_sub(seq_b) as i16) < 0
}

pub struct ReorderQueue<T> {
    ring: Vec<Slot<T>>,
    next_expected_seq: Option<u16>,
    size_min: usize,
    size_max: usize,
    timeout: Duration,
    drop_strategy: DropStrategy,
    bytes_in_flight: usize,
    recent_drops: Vec<Instant>,
    recent_timeouts: Vec<Instant>,
}

pub enum PushOutcome {
    Buffered,
    DroppedLate,
    DroppedEvicted,
}

impl<T> ReorderQueue<T> {
    pub fn new(size_min: usize, size_max: usize, timeout: Duration, drop_strategy: DropStrategy) -> Self {
        let mut ring = Vec::with_capacity(size_min);
        ring.resize_with(size_min, Slot::empty);
        Self {
            ring,
            next_expected_seq: None,
            size_min,
            size_max,
            timeout,
            drop_strategy,
            bytes_in_flight: 0,
            recent_drops: Vec::new(),
            recent_timeouts: Vec::new(),
        }
    }

    pub fn state(&self) -> QueueState {
        match self.next_expected_seq {
            Some(_) => QueueState::Running,
            None => QueueState::Uninitialized,
        }
    }

    fn ring_len(&self) -> usize {
        self.ring.len()
    }

    fn grow_if_saturated(&mut self) {
        let occupied = self.ring.iter().filter(|s| s.occupied).count();
        if occupied * 2 >= self.ring_len() && self.ring_len() < self.size_max {
            let new_len = (self.ring_len() * 2).min(self.size_max);
            // Rebuild the ring since the modulus changes: re-place every
            // occupied slot at its new index.
            let mut new_ring = Vec::with_capacity(new_len);
            new_ring.resize_with(new_len, Slot::empty);
            for slot in self.ring.drain(..) {
                if slot.occupied {
                    let idx = (slot.seq as usize) % new_len;
                    new_ring[idx] = slot;
                }
            }
            self.ring = new_ring;
        }
    }

    /// Push a new packet with payload `value` and sequence `seq`.
    pub fn push(&mut self, seq: u16, value: T, on_drop: impl FnOnce(T)) -> PushOutcome {
        if self.next_expected_seq.is_none() {
            self.next_expected_seq = Some(seq);
        }
        let next_expected = self.next_expected_seq.unwrap();

        if is_older(seq, next_expected) {
            self.record_drop();
            on_drop(value);
            return PushOutcome::DroppedLate;
        }

        self.grow_if_saturated();
        let len = self.ring_len();
        let idx = (seq as usize) % len;

        if self.ring[idx].occupied {
            match self.drop_strategy {
                DropStrategy::End => {
                    self.record_drop();
                    on_drop(value);
                    return PushOutcome::DroppedEvicted;
                }
                DropStrategy::Begin => {
                    if let Some(old_value) = self.ring[idx].value.take() {
                        on_drop(old_value);
                    }
                    self.record_drop();
                }
            }
        }

        self.ring[idx] = Slot {
            occupied: true,
            seq,
            deadline: Instant::now() + self.timeout,
            value: Some(value),
        };
        PushOutcome::Buffered
    }

    fn record_drop(&mut self) {
        let now = Instant::now();
        self.recent_drops.push(now);
        self.recent_drops.retain(|t| now.duration_since(*t) < Duration::from_secs(2));
    }

    fn record_timeout(&mut self) {
        let now = Instant::now();
        self.recent_timeouts.push(now);
        self.recent_timeouts.retain(|t| now.duration_since(*t) < Duration::from_secs(8));
    }

    /// Drops within the last second, per the backpressure thresholds in §4.G.
    pub fn drops_in_last_second(&self) -> usize {
        let now = Instant::now();
        self.recent_drops.iter().filter(|t| now.duration_since(**t) < Duration::from_secs(1)).count()
    }

    pub fn drops_in_last_two_seconds(&self) -> usize {
        self.recent_drops.len()
    }

    pub fn consecutive_timeouts_in_window(&self) -> usize {
        self.recent_timeouts.len()
    }

    /// Advance delivery as far as possible; calls `on_deliver` for each
    /// in-order packet and `on_timeout` for each skipped, expired head slot.
    pub fn flush(&mut self, mut on_deliver: impl FnMut(u16, T), mut on_timeout: impl FnMut(u16)) {
        let Some(mut next_expected) = self.next_expected_seq else {
            return;
        };
        let now = Instant::now();
        loop {
            let len = self.ring_len();
            let idx = (next_expected as usize) % len;
            if !self.ring[idx].occupied || self.ring[idx].seq != next_expected {
                break;
            }
            if self.ring[idx].deadline < now {
                let slot = std::mem::replace(&mut self.ring[idx], Slot::empty());
                on_timeout(slot.seq);
                self.record_timeout();
                next_expected = next_expected.wrapping_add(1);
                continue;
            }
            let slot = std::mem::replace(&mut self.ring[idx], Slot::empty());
            if let Some(value) = slot.value {
                on_deliver(slot.seq, value);
            }
            next_expected = next_expected.wrapping_add(1);
        }
        self.next_expected_seq = Some(next_expected);
    }

    pub fn reset(&mut self) {
        for slot in self.ring.iter_mut() {
            *slot = Slot::empty();
        }
        self.next_expected_seq = None;
        self.bytes_in_flight = 0;
        self.recent_drops.clear();
        self.recent_timeouts.clear();
    }

    pub fn size_current(&self) -> usize {
        self.ring_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> ReorderQueue<u16> {
        ReorderQueue::new(8, 64, Duration::from_millis(200), DropStrategy::Begin)
    }

    #[test]
    fn delivers_in_order_after_reorder() {
        let mut q = queue();
        let mut delivered = Vec::new();
        for seq in [10u16, 12, 11] {
            q.push(seq, seq, |_| {});
        }
        q.flush(|seq, _| delivered.push(seq), |_| {});
        assert_eq!(delivered, vec![10, 11, 12]);
    }

    #[test]
    fn late_packets_are_dropped_not_leaked() {
        let mut q = queue();
        let mut delivered = Vec::new();
        q.push(10, 10, |_| {});
        q.flush(|seq, _| delivered.push(seq), |_| {});
        assert_eq!(delivered, vec![10]);

        let mut dropped = Vec::new();
        let outcome = q.push(5, 5, |v| dropped.push(v));
        assert!(matches!(outcome, PushOutcome::DroppedLate));
        assert_eq!(dropped, vec![5]);
    }

    #[test]
    fn timeout_skips_head_after_deadline() {
        let mut q = ReorderQueue::new(8, 64, Duration::from_millis(10), DropStrategy::Begin);
        q.push(10, 10, |_| {});
        q.push(12, 12, |_| {});
        std::thread::sleep(Duration::from_millis(20));
        q.push(13, 13, |_| {});

        let mut delivered = Vec::new();
        let mut timed_out = Vec::new();
        q.flush(|seq, _| delivered.push(seq), |seq| timed_out.push(seq));
        assert_eq!(timed_out, vec![10]);
        assert_eq!(delivered, vec![12]);
    }

    #[test]
    fn reset_clears_state_and_returns_to_uninitialized() {
        let mut q = queue();
        q.push(10, 10, |_| {});
        assert_eq!(q.state(), QueueState::Running);
        q.reset();
        assert_eq!(q.state(), QueueState::Uninitialized);
    }

    #[test]
    fn is_older_handles_wraparound() {
        assert!(is_older(65534, 2));
        assert!(!is_older(2, 65534));
        assert!(is_older(5, 10));
    }
}
