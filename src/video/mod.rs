//! Video receiver: drives the frame processor per adaptive profile, tracks
//! IDR/profile switches, and emits annexB frames with a success/recovered tag.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use crate::codec::{AvPacket, Codec};
use crate::fec::{FecError, FlushStatus, FrameBuilder};

/// Profiles are immutable once published by `set_profiles`; a profile switch
/// only ever swaps which one is active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoProfile {
    pub index: i8,
    pub width: u32,
    pub height: u32,
    pub header_bytes: Vec<u8>,
    pub header_with_64b_padding: Vec<u8>,
}

impl VideoProfile {
    pub fn new(index: i8, width: u32, height: u32, header_bytes: Vec<u8>, header_with_64b_padding: Vec<u8>) -> Self {
        Self { index, width, height, header_bytes, header_with_64b_padding }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoError {
    NoActiveProfile,
    Fec(FecError),
}

impl fmt::Display for VideoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VideoError::NoActiveProfile => write!(f, "no active video profile"),
            VideoError::Fec(e) => write!(f, "fec error: {}", e),
        }
    }
}

impl std::error::Error for VideoError {}

const GRACE_PERIOD: Duration = Duration::from_millis(1500);

/// Emitted once per completed frame.
pub struct EmittedFrame {
    pub bytes: Vec<u8>,
    pub recovered: bool,
    pub success: bool,
    pub is_idr: bool,
}

fn is_idr(annexb: &[u8], codec: Codec) -> bool {
    // Scan for NAL start codes (00 00 01 or 00 00 00 01) and check the NAL
    // type of the byte that follows each one.
    let mut i = 0;
    while i + 3 <= annexb.len() {
        let three = &annexb[i..i + 3];
        let (nal_start, code_len) = if three == [0, 0, 1] {
            (i + 3, 3)
        } else if i + 4 <= annexb.len() && annexb[i..i + 4] == [0, 0, 0, 1] {
            (i + 4, 4)
        } else {
            i += 1;
            continue;
        };
        if nal_start < annexb.len() {
            let header = annexb[nal_start];
            let hit = match codec {
                Codec::H264 => (header & 0x1F) == 5,
                Codec::H265 => {
                    let nal_type = (header >> 1) & 0x3F;
                    nal_type == 19 || nal_type == 20
                }
                _ => false,
            };
            if hit {
                return true;
            }
        }
        i = nal_start;
    }
    false
}

pub struct VideoReceiver {
    active_profile: Option<VideoProfile>,
    active_builder: Option<FrameBuilder>,
    active_frame_index: Option<u16>,
    grace_deadline: Option<Instant>,
    codec: Codec,
    frames_emitted: u64,
    bytes_emitted: u64,
    profiles: HashMap<i8, VideoProfile>,
    pending_header_prepend: Option<Vec<u8>>,
}

impl VideoReceiver {
    pub fn new() -> Self {
        Self {
            active_profile: None,
            active_builder: None,
            active_frame_index: None,
            grace_deadline: None,
            codec: Codec::H264,
            frames_emitted: 0,
            bytes_emitted: 0,
            profiles: HashMap::new(),
            pending_header_prepend: None,
        }
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    pub fn bytes_emitted(&self) -> u64 {
        self.bytes_emitted
    }

    /// Publish the profile table the console advertised for this session;
    /// looked up by `adaptive_stream_index` on every profile switch.
    pub fn set_profiles(&mut self, profiles: Vec<VideoProfile>) {
        self.profiles = profiles.into_iter().map(|p| (p.index, p)).collect();
    }

    /// Feed one decrypted video packet; may complete a frame and return it.
    pub fn on_packet(
        &mut self,
        pkt: AvPacket,
        mut on_profile_switch: impl FnMut(VideoProfile),
    ) -> Option<EmittedFrame> {
        self.codec = pkt.codec;

        let switched_profile = match &self.active_profile {
            Some(p) => p.index != pkt.adaptive_stream_index,
            None => true,
        };
        if switched_profile {
            let profile = self
                .profiles
                .get(&pkt.adaptive_stream_index)
                .cloned()
                .unwrap_or_else(|| VideoProfile::new(pkt.adaptive_stream_index, 0, 0, Vec::new(), Vec::new()));
            if !profile.header_with_64b_padding.is_empty() {
                self.pending_header_prepend = Some(profile.header_with_64b_padding.clone());
            }
            self.active_profile = Some(profile.clone());
            on_profile_switch(profile);
        }

        let frame_started = match self.active_frame_index {
            Some(idx) => idx != pkt.frame_index,
            None => true,
        };
        if frame_started {
            self.active_builder = Some(FrameBuilder::alloc_frame(&pkt));
            self.active_frame_index = Some(pkt.frame_index);
        }

        let builder = self.active_builder.as_mut()?;
        if builder.put_unit(&pkt).is_err() {
            // Duplicate or malformed unit for this frame; ignore it and keep
            // waiting for the rest.
            return None;
        }

        if !builder.flush_possible() {
            return None;
        }

        let (mut bytes, status) = builder.flush();
        self.active_builder = None;

        let (success, recovered) = match status {
            FlushStatus::Success => (true, false),
            FlushStatus::FecSuccess => (true, true),
            FlushStatus::FecFailed | FlushStatus::Failed => {
                self.grace_deadline = Some(Instant::now() + GRACE_PERIOD);
                (false, true)
            }
        };

        if let Some(header) = self.pending_header_prepend.take() {
            let mut combined = header;
            combined.extend_from_slice(&bytes);
            bytes = combined;
        }

        if success {
            self.frames_emitted += 1;
            self.bytes_emitted += bytes.len() as u64;
        }

        let idr = success && is_idr(&bytes, self.codec);

        Some(EmittedFrame { bytes, recovered, success, is_idr: idr })
    }

    /// During a grace period after a lost frame, downstream should keep
    /// accepting `success=false` frames instead of stalling on a missing key
    /// frame.
    pub fn in_grace_period(&self) -> bool {
        match self.grace_deadline {
            Some(d) => Instant::now() < d,
            None => false,
        }
    }

    pub fn active_profile(&self) -> Option<VideoProfile> {
        self.active_profile.clone()
    }
}

impl Default for VideoReceiver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PacketType;

    fn pkt(frame_index: u16, unit_index: u32, units_src: u32, data: &[u8]) -> AvPacket {
        AvPacket {
            kind: PacketType::Video,
            has_nalu: false,
            seq: frame_index,
            frame_index,
            codec: Codec::H264,
            key_pos: 0,
            unit_index,
            units_total: units_src,
            units_src,
            units_fec: 0,
            audio_unit_size: 0,
            adaptive_stream_index: 0,
            data: data.to_vec(),
        }
    }

    #[test]
    fn emits_frame_once_all_units_arrive() {
        let mut recv = VideoReceiver::new();
        assert!(recv.on_packet(pkt(1, 0, 2, b"AAAA"), |_| {}).is_none());
        let frame = recv.on_packet(pkt(1, 1, 2, b"BBBB"), |_| {}).unwrap();
        assert!(frame.success);
        assert!(!frame.recovered);
        assert_eq!(recv.frames_emitted(), 1);
    }

    #[test]
    fn profile_switch_fires_callback() {
        let mut recv = VideoReceiver::new();
        let mut switches = Vec::new();
        let mut p = pkt(1, 0, 1, b"AAAA");
        p.adaptive_stream_index = 0;
        recv.on_packet(p, |profile| switches.push(profile));

        let mut p2 = pkt(2, 0, 1, b"BBBB");
        p2.adaptive_stream_index = 1;
        recv.on_packet(p2, |profile| switches.push(profile));

        assert_eq!(switches.len(), 2);
        assert_eq!(switches[1].index, 1);
    }

    #[test]
    fn profile_switch_prepends_header_to_next_frame() {
        let mut recv = VideoReceiver::new();
        recv.set_profiles(vec![VideoProfile::new(1, 1920, 1080, vec![0xAA], vec![0xAA, 0xBB])]);

        let mut p = pkt(1, 0, 1, b"AAAA");
        p.adaptive_stream_index = 1;
        let frame = recv.on_packet(p, |_| {}).unwrap();
        assert_eq!(frame.bytes, [0xAA, 0xBB, b'A', b'A', b'A', b'A']);

        // The header only prepends to the frame immediately after the switch.
        let frame2 = recv.on_packet(pkt(2, 0, 1, b"BBBB"), |_| {}).unwrap();
        assert_eq!(frame2.bytes, b"BBBB");
    }

    #[test]
    fn detects_h264_idr_nal() {
        let mut annexb = vec![0, 0, 0, 1];
        annexb.push(0x65); // nal_unit_type = 5 (IDR)
        annexb.extend_from_slice(b"rest");
        assert!(is_idr(&annexb, Codec::H264));
    }

    #[test]
    fn non_idr_slice_is_not_flagged() {
        let mut annexb = vec![0, 0, 0, 1];
        annexb.push(0x61); // nal_unit_type = 1 (non-IDR slice)
        assert!(!is_idr(&annexb, Codec::H264));
    }
}
