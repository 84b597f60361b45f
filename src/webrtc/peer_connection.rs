//! PeerConnection lifecycle: codec registration, SDP offer/answer,
//! trickled candidates, and the bounded ICE-gathering wait.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS};

/// H265 MIME type (not provided by the `webrtc` crate's media_engine module).
const MIME_TYPE_H265: &str = "video/H265";
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::packet::Packet as RtcpPacket;
use webrtc::rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::ice::resolve_ice_servers;
use super::sdp::{rewrite_local_description, RewriteOptions};
use super::WebRtcSignallingError;
use crate::config::{VideoCodec, WebRtcConfig};

pub struct PeerConnectionManager {
    config: WebRtcConfig,
}

impl PeerConnectionManager {
    pub fn new(config: WebRtcConfig) -> Self {
        Self { config }
    }

    pub async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, WebRtcSignallingError> {
        let mut setting_engine = SettingEngine::default();
        if let Some(ip) = &self.config.public_ip {
            setting_engine.set_nat_1to1_ips(
                vec![ip.clone()],
                webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType::Host,
            );
        }

        let mut media_engine = MediaEngine::default();
        self.register_video_codec(&mut media_engine)?;
        self.register_audio_codec(&mut media_engine)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| WebRtcSignallingError::ConnectionFailed(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        let ice_servers = resolve_ice_servers(&self.config.turn_servers, "remote-play-relay", Duration::from_secs(24 * 3600))
            .into_iter()
            .map(|entry| RTCIceServer {
                urls: entry.urls,
                username: entry.username.unwrap_or_default(),
                credential: entry.credential.unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        };

        let peer_connection = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| WebRtcSignallingError::ConnectionFailed(e.to_string()))?;

        Ok(Arc::new(peer_connection))
    }

    fn register_video_codec(&self, media_engine: &mut MediaEngine) -> Result<(), WebRtcSignallingError> {
        let (mime_type, fmtp, payload_type) = match self.config.video_codec {
            VideoCodec::H264 => (
                MIME_TYPE_H264,
                "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f",
                96,
            ),
            VideoCodec::H265 => (MIME_TYPE_H265, "", 98),
        };
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: mime_type.to_string(),
                        clock_rate: 90000,
                        channels: 0,
                        sdp_fmtp_line: fmtp.to_string(),
                        rtcp_feedback: vec![],
                    },
                    payload_type,
                    ..Default::default()
                },
                RTPCodecType::Video,
            )
            .map_err(|e| WebRtcSignallingError::ConnectionFailed(e.to_string()))?;
        Ok(())
    }

    fn register_audio_codec(&self, media_engine: &mut MediaEngine) -> Result<(), WebRtcSignallingError> {
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_OPUS.to_string(),
                        clock_rate: 48000,
                        channels: 2,
                        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                        rtcp_feedback: vec![],
                    },
                    payload_type: 111,
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )
            .map_err(|e| WebRtcSignallingError::ConnectionFailed(e.to_string()))?;
        Ok(())
    }

    /// A sample-based track lets webrtc-rs own RTP packetization; the av
    /// pipeline only ever hands it complete access-unit bytes.
    pub fn create_video_track(&self) -> Arc<TrackLocalStaticSample> {
        let (mime_type, fmtp) = match self.config.video_codec {
            VideoCodec::H264 => (MIME_TYPE_H264, "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"),
            VideoCodec::H265 => (MIME_TYPE_H265, ""),
        };
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: fmtp.to_string(),
                rtcp_feedback: vec![],
            },
            format!("video-{}", uuid::Uuid::new_v4()),
            "remote-play-relay".to_string(),
        ))
    }

    pub fn create_audio_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            format!("audio-{}", uuid::Uuid::new_v4()),
            "remote-play-relay".to_string(),
        ))
    }

    /// Drain RTCP on the video sender, watching for PLI/FIR keyframe
    /// requests from the browser; runs until the sender's RTCP channel closes.
    pub fn spawn_keyframe_rtcp_reader(rtp_sender: Arc<RTCRtpSender>, on_keyframe_requested: impl Fn() + Send + Sync + 'static) {
        tokio::spawn(async move {
            loop {
                match rtp_sender.read_rtcp().await {
                    Ok((packets, _)) => {
                        for packet in &packets {
                            let any = packet.as_any();
                            if any.downcast_ref::<PictureLossIndication>().is_some() || any.downcast_ref::<FullIntraRequest>().is_some() {
                                on_keyframe_requested();
                            }
                        }
                    }
                    Err(_) => break,
                }
            }
        });
    }

    pub async fn setup_state_callback(
        peer_connection: &Arc<RTCPeerConnection>,
        callback: impl Fn(RTCPeerConnectionState) + Send + Sync + 'static,
    ) {
        let callback = Arc::new(callback);
        peer_connection.on_peer_connection_state_change(Box::new(move |state| {
            let callback = callback.clone();
            Box::pin(async move { callback(state) })
        }));
    }

    pub async fn setup_ice_callback(
        peer_connection: &Arc<RTCPeerConnection>,
        callback: impl Fn(Option<String>) + Send + Sync + 'static,
    ) {
        let callback = Arc::new(callback);
        peer_connection.on_ice_candidate(Box::new(move |candidate| {
            let callback = callback.clone();
            Box::pin(async move {
                let candidate_str = candidate.map(|c| c.to_json().map(|j| j.candidate).unwrap_or_default());
                callback(candidate_str);
            })
        }));
    }

    pub async fn create_offer(
        &self,
        peer_connection: &Arc<RTCPeerConnection>,
    ) -> Result<String, WebRtcSignallingError> {
        let offer = peer_connection
            .create_offer(None)
            .await
            .map_err(|e| WebRtcSignallingError::SdpError(e.to_string()))?;
        peer_connection
            .set_local_description(offer)
            .await
            .map_err(|e| WebRtcSignallingError::SdpError(e.to_string()))?;

        self.await_ice_gathering(peer_connection).await;

        let sdp = peer_connection
            .local_description()
            .await
            .map(|d| d.sdp)
            .ok_or_else(|| WebRtcSignallingError::SdpError("local description missing after gathering".into()))?;

        let rewritten = rewrite_local_description(
            &sdp,
            &RewriteOptions { public_ip: self.config.public_ip.as_deref(), prefer_lan_candidates: self.config.prefer_lan_candidates },
        )
        .map_err(|e| WebRtcSignallingError::SdpError(e.to_string()))?;
        Ok(rewritten)
    }

    /// Wait for ICE gathering up to the configured timeout, then proceed
    /// with whatever candidates have arrived so far.
    async fn await_ice_gathering(&self, peer_connection: &Arc<RTCPeerConnection>) {
        let has_turn = self.config.turn_servers.iter().any(|_| true);
        let timeout_ms = if has_turn { self.config.gather_timeout_turn_ms } else { self.config.gather_timeout_no_turn_ms };
        let mut gather_complete = peer_connection.gathering_complete_promise().await;
        let _ = tokio::time::timeout(Duration::from_millis(timeout_ms), gather_complete.recv()).await;
    }

    pub async fn handle_answer(peer_connection: &Arc<RTCPeerConnection>, sdp: &str) -> Result<(), WebRtcSignallingError> {
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| WebRtcSignallingError::SdpError(e.to_string()))?;
        peer_connection
            .set_remote_description(answer)
            .await
            .map_err(|e| WebRtcSignallingError::SdpError(e.to_string()))
    }

    pub async fn add_ice_candidate(
        peer_connection: &Arc<RTCPeerConnection>,
        candidate: &str,
        sdp_mid: Option<&str>,
        sdp_mline_index: Option<u16>,
    ) -> Result<(), WebRtcSignallingError> {
        let candidate_init = RTCIceCandidateInit {
            candidate: candidate.to_string(),
            sdp_mid: sdp_mid.map(|s| s.to_string()),
            sdp_mline_index,
            username_fragment: None,
        };
        peer_connection
            .add_ice_candidate(candidate_init)
            .await
            .map_err(|e| WebRtcSignallingError::IceError(e.to_string()))
    }

    pub async fn close(peer_connection: &Arc<RTCPeerConnection>) -> Result<(), WebRtcSignallingError> {
        peer_connection
            .close()
            .await
            .map_err(|e| WebRtcSignallingError::ConnectionFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn manager_holds_configured_codec() {
        let mut cfg = WebRtcConfig::default();
        cfg.video_codec = VideoCodec::H265;
        let manager = PeerConnectionManager::new(cfg);
        assert_eq!(manager.config.video_codec, VideoCodec::H265);
    }
}
