//! Bridges the console AV pipeline into one browser session's WebRTC tracks.
//!
//! This is the `AvReceiver` the av_handler module dispatches completed
//! frames to; it owns no state beyond the target session and writes every
//! sample on its own spawned task, since `TrackLocalStaticSample::write_sample`
//! is async but the av worker calls into this bridge synchronously.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::av_handler::AvReceiver;
use crate::webrtc::WebRTCSession;

const AUDIO_FRAME_DURATION: Duration = Duration::from_millis(20);
const DEFAULT_FPS: u32 = 60;

pub struct SessionAvReceiver {
    session: Arc<WebRTCSession>,
    video_frame_duration: Duration,
}

impl SessionAvReceiver {
    pub fn new(session: Arc<WebRTCSession>, fps: u32) -> Self {
        let fps = if fps == 0 { DEFAULT_FPS } else { fps };
        Self { session, video_frame_duration: Duration::from_secs_f64(1.0 / fps as f64) }
    }

    fn write_video(&self, bytes: &[u8]) {
        let session = self.session.clone();
        let data = Bytes::copy_from_slice(bytes);
        let duration = self.video_frame_duration;
        tokio::spawn(async move {
            if let Err(e) = session.write_sample(data, duration).await {
                log::warn!("failed to write video sample: {}", e);
            }
        });
    }
}

impl AvReceiver for SessionAvReceiver {
    fn on_stream_info(&self, video_header: &[u8], audio_header: &[u8]) {
        log::info!(
            "stream info received: video header {} bytes, audio header {} bytes",
            video_header.len(),
            audio_header.len()
        );
    }

    fn set_video_codec(&self, name: &str) {
        log::info!("session {} video codec: {}", self.session.id, name);
    }

    fn set_audio_codec(&self, name: &str) {
        log::info!("session {} audio codec: {}", self.session.id, name);
    }

    fn on_video_packet(&self, bytes: &[u8]) {
        self.write_video(bytes);
    }

    fn on_video_packet_priority(&self, bytes: &[u8]) {
        self.write_video(bytes);
    }

    fn on_audio_packet(&self, bytes: &[u8]) {
        let session = self.session.clone();
        let data = Bytes::copy_from_slice(bytes);
        tokio::spawn(async move {
            if let Err(e) = session.write_audio_sample(data, AUDIO_FRAME_DURATION).await {
                log::warn!("failed to write audio sample: {}", e);
            }
        });
    }

    fn reset_audio_decoder(&self, lost_frames: u32) {
        log::debug!("session {} audio gap of {} frames, browser Opus decoder will resync", self.session.id, lost_frames);
    }
}
