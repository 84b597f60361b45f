//! Audio receiver: explodes each AV packet into per-unit audio frames and
//! orders them through a sequence-wrap-aware jitter buffer.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::codec::AvPacket;

const BUFFER_MIN: usize = 6;
const BUFFER_MAX: usize = 256;
const MAX_OUTPUT_PER_FLUSH: usize = 10;
const EXTREME_JUMP_BATCH: usize = 50;
const STARTUP_FRAME_COUNT: u32 = 10;
const OSCILLATION_WINDOW: Duration = Duration::from_millis(100);
const OSCILLATION_TRIM_KEEP: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapClass {
    Duplicate,
    Normal { gap: u32 },
    Extreme { gap: u32 },
    WrapAround,
}

/// Classify the forward distance from `prev` to `next` under 16-bit wrap.
///
/// `next.wrapping_sub(prev)` already normalizes genuine sequence rollovers
/// (e.g. `65534 -> 1` lands on the small forward distance `3`); only a gap
/// that stays large after that normalization is treated as a true
/// discontinuity requiring a baseline reset.
pub fn classify_gap(prev: u16, next: u16) -> GapClass {
    let gap = next.wrapping_sub(prev) as u32;
    if gap == 0 {
        GapClass::Duplicate
    } else if gap <= 20 {
        GapClass::Normal { gap }
    } else if gap < 30000 {
        GapClass::Extreme { gap }
    } else {
        GapClass::WrapAround
    }
}

pub struct AudioFrame {
    pub seq: u16,
    pub data: Vec<u8>,
}

pub struct AudioReceiver {
    buffer: BTreeMap<u16, Vec<u8>>,
    next_expected: Option<u16>,
    frames_seen: u32,
    last_jump_targets: Option<(u16, u16, Instant)>,
}

impl AudioReceiver {
    pub fn new() -> Self {
        Self {
            buffer: BTreeMap::new(),
            next_expected: None,
            frames_seen: 0,
            last_jump_targets: None,
        }
    }

    /// Explode one AV packet into its constituent audio frames and buffer
    /// them, keyed by sequence. `frame_index` is the wire sequence used for
    /// jitter-buffer ordering; source units count up from it, FEC units
    /// count backward.
    pub fn on_packet(&mut self, pkt: &AvPacket) {
        let unit_size = pkt.audio_unit_size as usize;
        if unit_size == 0 {
            return;
        }
        for i in 0..pkt.units_src {
            let start = (i as usize) * unit_size;
            let end = start + unit_size;
            if end > pkt.data.len() {
                break;
            }
            let seq = pkt.frame_index.wrapping_add(i as u16);
            self.insert(seq, pkt.data[start..end].to_vec());
        }
        for fec_index in 0..pkt.units_fec {
            let src_count = pkt.units_src;
            let start = ((src_count + fec_index) as usize) * unit_size;
            let end = start + unit_size;
            if end > pkt.data.len() {
                break;
            }
            let seq = pkt
                .frame_index
                .wrapping_sub(pkt.units_fec as u16)
                .wrapping_add(fec_index as u16);
            if self.frames_seen < STARTUP_FRAME_COUNT && self.before_start(seq) {
                continue;
            }
            self.insert(seq, pkt.data[start..end].to_vec());
        }
        self.frames_seen += 1;
    }

    /// True if `seq` sits strictly before the current baseline, under signed
    /// 16-bit wraparound comparison.
    fn before_start(&self, seq: u16) -> bool {
        match self.next_expected {
            Some(start) => (seq.wrapping_sub(start) as i16) < 0,
            None => false,
        }
    }

    fn insert(&mut self, seq: u16, data: Vec<u8>) {
        if self.next_expected.is_none() {
            self.next_expected = Some(seq);
        }
        self.buffer.insert(seq, data);
        if self.buffer.len() > BUFFER_MAX {
            // Oldest-first eviction; BTreeMap's natural key order doesn't
            // respect wraparound, but eviction only needs to bound memory.
            if let Some((&oldest, _)) = self.buffer.iter().next() {
                self.buffer.remove(&oldest);
            }
        }
    }

    /// Drain in-order frames, invoking `on_frame` for each, and `on_loss`
    /// whenever a gap classification fires (duplicate frames are silently
    /// dropped from the buffer without a callback).
    pub fn flush(
        &mut self,
        mut on_frame: impl FnMut(AudioFrame),
        mut on_loss: impl FnMut(GapClass),
    ) {
        let Some(mut expected) = self.next_expected else {
            return;
        };
        let mut emitted = 0;

        while emitted < MAX_OUTPUT_PER_FLUSH {
            if let Some(data) = self.buffer.remove(&expected) {
                on_frame(AudioFrame { seq: expected, data });
                expected = expected.wrapping_add(1);
                emitted += 1;
                continue;
            }

            // No exact match at `expected`; find the nearest buffered
            // sequence ahead of it to classify the gap.
            let Some(&next_seq) = self.buffer.keys().find(|&&k| classify_gap(expected, k) != GapClass::Duplicate || k == expected) else {
                break;
            };

            let class = classify_gap(expected, next_seq);
            match class {
                GapClass::Duplicate => {
                    expected = expected.wrapping_add(1);
                }
                GapClass::Normal { gap } => {
                    on_loss(GapClass::Normal { gap });
                    expected = next_seq;
                }
                GapClass::Extreme { .. } => {
                    self.detect_oscillation(expected, next_seq);
                    on_loss(class);
                    // Emit any intermediate frames already buffered, capped
                    // to avoid one flush dumping an unbounded backlog.
                    let mut batch = 0;
                    let mut cursor = expected;
                    while cursor != next_seq && batch < EXTREME_JUMP_BATCH {
                        if let Some(data) = self.buffer.remove(&cursor) {
                            on_frame(AudioFrame { seq: cursor, data });
                            batch += 1;
                        }
                        cursor = cursor.wrapping_add(1);
                    }
                    expected = next_seq;
                }
                GapClass::WrapAround => {
                    on_loss(class);
                    expected = next_seq;
                }
            }
        }

        self.next_expected = Some(expected);
    }

    fn detect_oscillation(&mut self, from: u16, to: u16) {
        let now = Instant::now();
        if let Some((prev_from, prev_to, at)) = self.last_jump_targets {
            if prev_from == to && prev_to == from && now.duration_since(at) < OSCILLATION_WINDOW {
                self.trim_to_recent(to);
            }
        }
        self.last_jump_targets = Some((from, to, now));
    }

    fn trim_to_recent(&mut self, around: u16) {
        let mut keys: Vec<u16> = self.buffer.keys().copied().collect();
        keys.sort_by_key(|&k| (k.wrapping_sub(around) as i16).unsigned_abs());
        for k in keys.into_iter().skip(OSCILLATION_TRIM_KEEP) {
            self.buffer.remove(&k);
        }
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len().max(BUFFER_MIN).min(BUFFER_MAX)
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.next_expected = None;
        self.frames_seen = 0;
        self.last_jump_targets = None;
    }
}

impl Default for AudioReceiver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraparound_sequence_reports_normalized_small_gap() {
        assert_eq!(classify_gap(65534, 1), GapClass::Normal { gap: 3 });
    }

    #[test]
    fn far_backward_jump_is_flagged_as_wraparound() {
        assert_eq!(classify_gap(100, 5), GapClass::WrapAround);
    }

    #[test]
    fn classifies_extreme_jump_of_20000() {
        match classify_gap(10000, 30000) {
            GapClass::Extreme { gap } => assert_eq!(gap, 20000),
            other => panic!("expected Extreme, got {:?}", other),
        }
    }

    #[test]
    fn duplicate_gap_is_zero() {
        assert_eq!(classify_gap(100, 100), GapClass::Duplicate);
    }

    #[test]
    fn normal_gap_within_small_window() {
        assert_eq!(classify_gap(100, 103), GapClass::Normal { gap: 3 });
    }

    #[test]
    fn emits_frames_in_order_after_buffering_out_of_order() {
        let mut recv = AudioReceiver::new();
        recv.buffer.insert(12, vec![2]);
        recv.buffer.insert(10, vec![0]);
        recv.buffer.insert(11, vec![1]);
        recv.next_expected = Some(10);

        let mut out = Vec::new();
        recv.flush(|f| out.push(f.seq), |_| {});
        assert_eq!(out, vec![10, 11, 12]);
    }
}
