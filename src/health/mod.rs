//! Stream health supervision: rolling frame-event window, freeze detection,
//! and a cooldown-gated keyframe-request callback.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;

const WINDOW: Duration = Duration::from_secs(10);
const FREEZE_NO_FRAMES: Duration = Duration::from_secs(3);
const KEYFRAME_COOLDOWN_DEFAULT: Duration = Duration::from_secs(8);
const HEALTH_CHECK_COOLDOWN: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Success,
    Recovered,
    FecSuccess,
    FecFailed,
    Frozen,
    Dropped,
}

struct FrameEvent {
    at: Instant,
    status: FrameStatus,
    frame_index: u32,
    bytes: usize,
}

pub struct StreamHealthEvent {
    pub frame_index: u32,
    pub status: FrameStatus,
    pub consecutive_failures: u32,
    pub reason: Option<String>,
    pub reused_last_frame: bool,
    pub recovered_by_fec: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamHealthSnapshot {
    pub total_frames: u64,
    pub total_bytes: u64,
    pub delta_frames: u64,
    pub delta_bytes: u64,
    pub recent_success: usize,
    pub recent_recovered: usize,
    pub recent_failed: usize,
    pub recent_fps: f64,
    pub average_interval_ms: f64,
    pub last_frame_unix_ms: Option<u64>,
    pub bitrate_mbps: f64,
    pub frames_lost_delta: u64,
    pub previous_frame_index: Option<u32>,
    pub frozen: bool,
}

pub struct HealthSupervisor {
    events: VecDeque<FrameEvent>,
    total_frames: u64,
    total_bytes: u64,
    since_last_reset_frames: u64,
    since_last_reset_bytes: u64,
    consecutive_failures: u32,
    previous_frame_index: Option<u32>,
    frames_lost: u64,
    keyframe_cooldown: Duration,
    last_keyframe_request: Option<Instant>,
    last_health_check: Option<Instant>,
    start_unix_ms: u64,
    process_start: Instant,
}

impl HealthSupervisor {
    pub fn new(keyframe_cooldown_ms: u64) -> Self {
        let start_unix_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            events: VecDeque::new(),
            total_frames: 0,
            total_bytes: 0,
            since_last_reset_frames: 0,
            since_last_reset_bytes: 0,
            consecutive_failures: 0,
            previous_frame_index: None,
            frames_lost: 0,
            keyframe_cooldown: Duration::from_millis(keyframe_cooldown_ms),
            last_keyframe_request: None,
            last_health_check: None,
            start_unix_ms,
            process_start: Instant::now(),
        }
    }

    fn now_unix_ms(&self) -> u64 {
        self.start_unix_ms + self.process_start.elapsed().as_millis() as u64
    }

    fn prune(&mut self) {
        let now = Instant::now();
        while let Some(front) = self.events.front() {
            if now.duration_since(front.at) > WINDOW {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn record_frame(&mut self, frame_index: u32, bytes: usize, status: FrameStatus) -> StreamHealthEvent {
        let now = Instant::now();
        self.prune();

        let success = matches!(status, FrameStatus::Success | FrameStatus::Recovered | FrameStatus::FecSuccess);
        if success {
            self.consecutive_failures = 0;
            self.total_frames += 1;
            self.total_bytes += bytes as u64;
            self.since_last_reset_frames += 1;
            self.since_last_reset_bytes += bytes as u64;
        } else {
            self.consecutive_failures += 1;
        }

        if let Some(prev) = self.previous_frame_index {
            let gap = frame_index.wrapping_sub(prev);
            if gap > 1 {
                self.frames_lost += (gap - 1) as u64;
            }
        }
        let reused_last_frame = self.previous_frame_index == Some(frame_index);
        self.previous_frame_index = Some(frame_index);

        self.events.push_back(FrameEvent { at: now, status, frame_index, bytes });

        StreamHealthEvent {
            frame_index,
            status,
            consecutive_failures: self.consecutive_failures,
            reason: None,
            reused_last_frame,
            recovered_by_fec: matches!(status, FrameStatus::FecSuccess),
        }
    }

    fn is_frozen(&self) -> bool {
        let now = Instant::now();
        match self.events.back() {
            None => false,
            Some(last) => {
                if now.duration_since(last.at) > FREEZE_NO_FRAMES {
                    return true;
                }
                let fps = self.recent_fps();
                if fps < 1.0 && !self.events.is_empty() {
                    return true;
                }
                let successes = self.events.iter().filter(|e| matches!(e.status, FrameStatus::Success | FrameStatus::Recovered | FrameStatus::FecSuccess)).count();
                if successes == 0 && self.events.len() > 10 {
                    return true;
                }
                if fps > 0.0 && fps < 5.0 {
                    let unchanged = self.events.iter().rev().take_while(|e| e.frame_index == last.frame_index).last();
                    if let Some(oldest_unchanged) = unchanged {
                        if now.duration_since(oldest_unchanged.at) > Duration::from_secs(2) {
                            return true;
                        }
                    }
                }
                false
            }
        }
    }

    fn recent_fps(&self) -> f64 {
        if self.events.len() < 2 {
            return if self.events.is_empty() { 0.0 } else { 1.0 };
        }
        let span = self.events.back().unwrap().at.duration_since(self.events.front().unwrap().at);
        if span.as_secs_f64() <= 0.0 {
            return 0.0;
        }
        self.events.len() as f64 / span.as_secs_f64()
    }

    fn average_interval_ms(&self) -> f64 {
        if self.events.len() < 2 {
            return 0.0;
        }
        let mut total = Duration::ZERO;
        let mut prev: Option<Instant> = None;
        for e in &self.events {
            if let Some(p) = prev {
                total += e.at.duration_since(p);
            }
            prev = Some(e.at);
        }
        total.as_secs_f64() * 1000.0 / (self.events.len() - 1) as f64
    }

    pub fn snapshot(&mut self, reset_deltas: bool) -> StreamHealthSnapshot {
        self.prune();
        let frozen = self.is_frozen();
        let fps = self.recent_fps();

        let recent_success = self.events.iter().filter(|e| matches!(e.status, FrameStatus::Success)).count();
        let recent_recovered = self.events.iter().filter(|e| matches!(e.status, FrameStatus::Recovered | FrameStatus::FecSuccess)).count();
        let recent_failed = self.events.iter().filter(|e| matches!(e.status, FrameStatus::FecFailed | FrameStatus::Dropped | FrameStatus::Frozen)).count();

        let bitrate_mbps = if self.since_last_reset_frames > 0 && fps > 0.0 {
            (self.since_last_reset_bytes as f64 * 8.0 * fps) / self.since_last_reset_frames as f64 / 1e6
        } else {
            0.0
        };

        let snapshot = StreamHealthSnapshot {
            total_frames: self.total_frames,
            total_bytes: self.total_bytes,
            delta_frames: self.since_last_reset_frames,
            delta_bytes: self.since_last_reset_bytes,
            recent_success,
            recent_recovered,
            recent_failed,
            recent_fps: fps,
            average_interval_ms: self.average_interval_ms(),
            last_frame_unix_ms: self.events.back().map(|_| self.now_unix_ms()),
            bitrate_mbps,
            frames_lost_delta: self.frames_lost,
            previous_frame_index: self.previous_frame_index,
            frozen,
        };

        if reset_deltas {
            self.since_last_reset_frames = 0;
            self.since_last_reset_bytes = 0;
            self.frames_lost = 0;
        }

        snapshot
    }

    /// Returns true if a keyframe request should actually be sent (cooldown
    /// not currently active); marks the cooldown as started when it returns
    /// true.
    pub fn try_request_keyframe(&mut self) -> bool {
        let now = Instant::now();
        if let Some(last) = self.last_keyframe_request {
            if now.duration_since(last) < self.keyframe_cooldown {
                return false;
            }
        }
        self.last_keyframe_request = Some(now);
        true
    }

    pub fn try_health_check(&mut self) -> bool {
        let now = Instant::now();
        if let Some(last) = self.last_health_check {
            if now.duration_since(last) < HEALTH_CHECK_COOLDOWN {
                return false;
            }
        }
        self.last_health_check = Some(now);
        true
    }
}

impl Default for HealthSupervisor {
    fn default() -> Self {
        Self::new(KEYFRAME_COOLDOWN_DEFAULT.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyframe_request_respects_cooldown() {
        let mut health = HealthSupervisor::new(8000);
        assert!(health.try_request_keyframe());
        assert!(!health.try_request_keyframe());
    }

    #[test]
    fn consecutive_failures_reset_on_success() {
        let mut health = HealthSupervisor::new(8000);
        health.record_frame(1, 100, FrameStatus::FecFailed);
        health.record_frame(2, 100, FrameStatus::FecFailed);
        let evt = health.record_frame(3, 100, FrameStatus::Success);
        assert_eq!(evt.consecutive_failures, 0);
    }

    #[test]
    fn frames_lost_counts_index_gaps() {
        let mut health = HealthSupervisor::new(8000);
        health.record_frame(1, 100, FrameStatus::Success);
        health.record_frame(5, 100, FrameStatus::Success);
        let snap = health.snapshot(false);
        assert_eq!(snap.frames_lost_delta, 3);
    }

    #[test]
    fn snapshot_without_any_frames_is_not_frozen() {
        let mut health = HealthSupervisor::new(8000);
        let snap = health.snapshot(false);
        assert!(!snap.frozen);
    }
}
