//! AV handler: owns the reorder queue, per-type receivers, the cipher, and
//! the worker task that drains a bounded dispatch queue.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::audio::{AudioReceiver, GapClass};
use crate::cipher::SessionCipher;
use crate::codec::{self, AvPacket, Codec, HostType, PacketType};
use crate::health::{FrameStatus, HealthSupervisor};
use crate::reorder::{DropStrategy, PushOutcome, QueueState, ReorderQueue};
use crate::video::{VideoProfile, VideoReceiver};

/// Bridge into the downstream WebRTC media sender. Mirrors the console-side
/// `IAVReceiver` contract: header/codec announcements plus per-packet
/// delivery, with a priority path for IDR frames.
pub trait AvReceiver: Send + Sync {
    fn on_stream_info(&self, video_header: &[u8], audio_header: &[u8]);
    fn set_video_codec(&self, name: &str);
    fn set_audio_codec(&self, name: &str);
    fn on_video_packet(&self, bytes: &[u8]);
    fn on_video_packet_priority(&self, bytes: &[u8]);
    fn on_audio_packet(&self, bytes: &[u8]);
    fn reset_audio_decoder(&self, lost_frames: u32);
}

fn codec_name(codec: Codec) -> &'static str {
    match codec {
        Codec::H264 => "h264",
        Codec::H265 => "h265",
        Codec::Opus => "opus",
        Codec::Aac => "aac",
        Codec::Unknown(_) => "unknown",
    }
}

const DISPATCH_CAPACITY: usize = 150;
const DISPATCH_DROP_THRESHOLD: usize = 100;
const DISPATCH_DIRECT_THRESHOLD: usize = 10;
const DISPATCH_TRIM_TARGET: usize = 120;
const WORKER_BATCH: usize = 50;
const TIMEOUT_SCAN_INTERVAL: Duration = Duration::from_millis(200);

const DROP_WINDOW_TRIGGER: usize = 20;
const SUSTAINED_DROP_WINDOW_SECS: u64 = 2;
const SUSTAINED_DROP_TRIGGER: usize = 10;
const TIMEOUT_TRIGGER_COUNT: usize = 3;

pub struct AvHandlerConfig {
    pub host_type: HostType,
    pub reorder_timeout: Duration,
    pub reorder_size_min: usize,
    pub reorder_size_max: usize,
    pub keyframe_cooldown_ms: u64,
}

enum QueuedPacket {
    Video(AvPacket),
}

struct Inner {
    reorder: ReorderQueue<AvPacket>,
    video: VideoReceiver,
    audio: AudioReceiver,
    health: HealthSupervisor,
    cipher: Option<SessionCipher>,
    host_type: HostType,
    dispatch: VecDeque<QueuedPacket>,
    keyframe_requested_tx: Option<mpsc::UnboundedSender<()>>,
    receiver: Option<Arc<dyn AvReceiver>>,
    profile_switch_callback: Option<Arc<dyn Fn(VideoProfile) + Send + Sync>>,
    announced_video_codec: Option<Codec>,
    announced_audio_codec: Option<Codec>,
}

/// Owns the video/audio receive path for one session. The worker task
/// (spawned by `spawn_worker`) is the only consumer of the dispatch queue;
/// `add_packet` may be called from any I/O task.
pub struct AvHandler {
    inner: Arc<Mutex<Inner>>,
}

impl AvHandler {
    pub fn new(cfg: AvHandlerConfig) -> (Self, mpsc::UnboundedReceiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Inner {
            reorder: ReorderQueue::new(cfg.reorder_size_min, cfg.reorder_size_max, cfg.reorder_timeout, DropStrategy::Begin),
            video: VideoReceiver::new(),
            audio: AudioReceiver::new(),
            health: HealthSupervisor::new(cfg.keyframe_cooldown_ms),
            cipher: None,
            host_type: cfg.host_type,
            dispatch: VecDeque::new(),
            keyframe_requested_tx: Some(tx),
            receiver: None,
            profile_switch_callback: None,
            announced_video_codec: None,
            announced_audio_codec: None,
        };
        (Self { inner: Arc::new(Mutex::new(inner)) }, rx)
    }

    pub fn set_cipher(&self, cipher: SessionCipher) {
        self.inner.lock().cipher = Some(cipher);
    }

    /// Attach the downstream WebRTC media sender. Frames completed before
    /// this is called are simply not forwarded.
    pub fn set_receiver(&self, receiver: Arc<dyn AvReceiver>) {
        self.inner.lock().receiver = Some(receiver);
    }

    /// Publish the console's stream headers and advertised video profiles;
    /// forwarded to the receiver as `on_stream_info` and to the video
    /// receiver's profile table.
    pub fn set_headers(&self, video_header: Vec<u8>, audio_header: Vec<u8>, profiles: Vec<VideoProfile>) {
        let receiver = {
            let mut guard = self.inner.lock();
            guard.video.set_profiles(profiles);
            guard.receiver.clone()
        };
        if let Some(receiver) = receiver {
            receiver.on_stream_info(&video_header, &audio_header);
        }
    }

    /// Called whenever the video receiver switches its active profile.
    pub fn set_profile_switch_callback(&self, callback: impl Fn(VideoProfile) + Send + Sync + 'static) {
        self.inner.lock().profile_switch_callback = Some(Arc::new(callback));
    }

    /// Parse and enqueue one wire packet. Audio bypasses the reorder queue;
    /// video is placed in it and only dispatched once in order.
    pub fn add_packet(&self, bytes: &[u8]) {
        let host_type = {
            let guard = self.inner.lock();
            guard.host_type
        };
        let pkt = match codec::parse(bytes, host_type) {
            Ok(p) => p,
            Err(_) => return,
        };

        match pkt.kind {
            PacketType::Audio => self.dispatch_now(pkt),
            PacketType::Video => {
                let mut guard = self.inner.lock();
                let outcome = guard.reorder.push(pkt.seq, pkt, |_dropped| {});
                drop(guard);
                self.maybe_request_keyframe_on_drop(matches!(outcome, PushOutcome::DroppedLate | PushOutcome::DroppedEvicted));
                self.drain_reorder_queue();
            }
        }
    }

    fn drain_reorder_queue(&self) {
        let mut ready = Vec::new();
        {
            let mut guard = self.inner.lock();
            guard.reorder.flush(
                |_seq, pkt| ready.push(pkt),
                |_seq| {
                    // Timeout accounting happens via consecutive_timeouts_in_window below.
                },
            );
        }
        for pkt in ready {
            self.queue_for_dispatch(pkt);
        }
        self.maybe_request_keyframe_on_timeout();
    }

    fn queue_for_dispatch(&self, pkt: AvPacket) {
        let mut guard = self.inner.lock();
        if guard.dispatch.len() >= DISPATCH_CAPACITY {
            while guard.dispatch.len() > DISPATCH_TRIM_TARGET {
                guard.dispatch.pop_front();
            }
            drop(guard);
            self.request_keyframe();
            return;
        }
        let direct = guard.dispatch.len() < DISPATCH_DIRECT_THRESHOLD;
        if direct {
            drop(guard);
            self.process_packet(pkt);
        } else {
            guard.dispatch.push_back(QueuedPacket::Video(pkt));
        }
    }

    fn dispatch_now(&self, pkt: AvPacket) {
        self.process_packet(pkt);
    }

    fn process_packet(&self, mut pkt: AvPacket) {
        let mut guard = self.inner.lock();
        if pkt.key_pos > 0 {
            if let Some(cipher) = &guard.cipher {
                if let Ok(plain) = cipher.decrypt(&pkt.data, pkt.key_pos) {
                    pkt.data = plain;
                }
            }
        }

        match pkt.kind {
            PacketType::Video => {
                let frame_index = pkt.frame_index as u32;
                let pkt_codec = pkt.codec;
                let receiver = guard.receiver.clone();
                let profile_cb = guard.profile_switch_callback.clone();
                if let Some(frame) = guard.video.on_packet(pkt, |profile| {
                    if let Some(cb) = &profile_cb {
                        cb(profile);
                    }
                }) {
                    let status = match (frame.success, frame.recovered) {
                        (true, false) => FrameStatus::Success,
                        (true, true) => FrameStatus::FecSuccess,
                        (false, _) => FrameStatus::FecFailed,
                    };
                    guard.health.record_frame(frame_index, frame.bytes.len(), status);

                    if frame.success {
                        if guard.announced_video_codec != Some(pkt_codec) {
                            if let Some(r) = &receiver {
                                r.set_video_codec(codec_name(pkt_codec));
                            }
                            guard.announced_video_codec = Some(pkt_codec);
                        }
                        if let Some(r) = &receiver {
                            if frame.is_idr {
                                r.on_video_packet_priority(&frame.bytes);
                            } else {
                                r.on_video_packet(&frame.bytes);
                            }
                        }
                    }
                }
            }
            PacketType::Audio => {
                let pkt_codec = pkt.codec;
                let receiver = guard.receiver.clone();
                guard.audio.on_packet(&pkt);

                if guard.announced_audio_codec != Some(pkt_codec) {
                    if let Some(r) = &receiver {
                        r.set_audio_codec(codec_name(pkt_codec));
                    }
                    guard.announced_audio_codec = Some(pkt_codec);
                }

                let mut losses = Vec::new();
                guard.audio.flush(
                    |frame| {
                        if let Some(r) = &receiver {
                            r.on_audio_packet(&frame.data);
                        }
                    },
                    |gap| losses.push(gap),
                );
                for gap in losses {
                    log::debug!("audio gap classified as {:?}", gap);
                    let lost_frames = match gap {
                        GapClass::Duplicate => continue,
                        GapClass::Normal { gap } => gap,
                        GapClass::Extreme { gap } => gap,
                        GapClass::WrapAround => 0,
                    };
                    if let Some(r) = &receiver {
                        r.reset_audio_decoder(lost_frames);
                    }
                }
            }
        }
    }

    /// Drain up to `WORKER_BATCH` queued dispatch entries; intended to be
    /// called repeatedly from the worker loop.
    pub fn drain_worker_batch(&self) {
        let mut batch = Vec::new();
        {
            let mut guard = self.inner.lock();
            for _ in 0..WORKER_BATCH {
                match guard.dispatch.pop_front() {
                    Some(QueuedPacket::Video(p)) => batch.push(p),
                    None => break,
                }
            }
        }
        for pkt in batch {
            self.process_packet(pkt);
        }
    }

    fn maybe_request_keyframe_on_drop(&self, dropped: bool) {
        if !dropped {
            return;
        }
        let should_request = {
            let guard = self.inner.lock();
            guard.reorder.drops_in_last_second() >= DROP_WINDOW_TRIGGER
                || (guard.reorder.drops_in_last_two_seconds() >= SUSTAINED_DROP_TRIGGER
                    && SUSTAINED_DROP_WINDOW_SECS > 0)
        };
        if should_request {
            self.reset_reorder_queue();
            self.request_keyframe();
        }
    }

    fn maybe_request_keyframe_on_timeout(&self) {
        let should_request = {
            let guard = self.inner.lock();
            guard.reorder.consecutive_timeouts_in_window() >= TIMEOUT_TRIGGER_COUNT
        };
        if should_request {
            self.request_keyframe();
        }
    }

    fn reset_reorder_queue(&self) {
        self.inner.lock().reorder.reset();
    }

    /// Force a keyframe request, bypassing the automatic drop/timeout
    /// triggers; still gated by the health supervisor's cooldown.
    pub fn request_keyframe_now(&self) {
        self.request_keyframe();
    }

    fn request_keyframe(&self) {
        let mut guard = self.inner.lock();
        let fire = guard.health.try_request_keyframe();
        if fire {
            if let Some(tx) = &guard.keyframe_requested_tx {
                let _ = tx.send(());
            }
        }
    }

    pub fn reorder_state(&self) -> QueueState {
        self.inner.lock().reorder.state()
    }

    pub fn get_health_snapshot(&self, reset_deltas: bool) -> crate::health::StreamHealthSnapshot {
        self.inner.lock().health.snapshot(reset_deltas)
    }

    pub fn stop(&self) {
        let mut guard = self.inner.lock();
        guard.dispatch.clear();
        guard.reorder.reset();
    }
}

/// Run the periodic timeout scan for a handler's reorder queue; meant to be
/// spawned on its own task alongside the dispatch-draining loop.
pub async fn run_timeout_scan_loop(handler: Arc<AvHandler>, mut cancel: mpsc::UnboundedReceiver<()>) {
    let mut next_tick = Instant::now() + TIMEOUT_SCAN_INTERVAL;
    loop {
        tokio::select! {
            _ = cancel.recv() => return,
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(next_tick)) => {
                handler.drain_reorder_queue();
                handler.drain_worker_batch();
                next_tick = Instant::now() + TIMEOUT_SCAN_INTERVAL;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> AvHandler {
        let (h, _rx) = AvHandler::new(AvHandlerConfig {
            host_type: HostType::Ps4,
            reorder_timeout: Duration::from_millis(200),
            reorder_size_min: 8,
            reorder_size_max: 64,
            keyframe_cooldown_ms: 8000,
        });
        h
    }

    fn video_packet_bytes(seq: u16, unit_index: u32, units_src: u32) -> Vec<u8> {
        let mut b = vec![0u8; 24];
        b[0] = 0x00;
        b[1..3].copy_from_slice(&seq.to_be_bytes());
        b[3..5].copy_from_slice(&1u16.to_be_bytes());
        let total_minus_one = units_src - 1;
        let dword2: u32 = (unit_index << 21) | (total_minus_one << 10) | 0;
        b[5..9].copy_from_slice(&dword2.to_be_bytes());
        b.extend_from_slice(b"FRAME-UNIT-BYTES");
        b
    }

    #[test]
    fn single_unit_frames_emit_success_through_health() {
        let h = handler();
        h.add_packet(&video_packet_bytes(10, 0, 1));
        let snap = h.get_health_snapshot(false);
        assert_eq!(snap.recent_success, 1);
    }

    #[test]
    fn stop_clears_dispatch_and_reorder_state() {
        let h = handler();
        h.add_packet(&video_packet_bytes(10, 0, 1));
        h.stop();
        assert_eq!(h.reorder_state(), QueueState::Uninitialized);
    }
}
