//! Per-browser WebRTC session state: the peer connection, its video track,
//! buffered trickle candidates, and the auto-expiry clock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::Error as RtcError;

use super::ice::{upsert_candidate, BufferedCandidate, PendingCandidateKey};
use super::peer_connection::PeerConnectionManager;
use super::WebRtcSignallingError;
use crate::av_handler::AvHandler;
use crate::config::{VideoCodec, WebRtcConfig};

const SESSION_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for SessionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::New => SessionState::New,
            RTCPeerConnectionState::Connecting => SessionState::Connecting,
            RTCPeerConnectionState::Connected => SessionState::Connected,
            RTCPeerConnectionState::Disconnected => SessionState::Disconnected,
            RTCPeerConnectionState::Failed => SessionState::Failed,
            RTCPeerConnectionState::Closed => SessionState::Closed,
            _ => SessionState::New,
        }
    }
}

/// One browser-facing WebRTC session. `streaming_session_id` links this
/// session to the remote-play session once `connect-stream` is called;
/// before that, no frames are written to `video_track`.
pub struct WebRTCSession {
    pub id: String,
    pub peer_connection: Arc<RTCPeerConnection>,
    pub video_track: Arc<TrackLocalStaticSample>,
    pub audio_track: Arc<TrackLocalStaticSample>,
    state: RwLock<SessionState>,
    created_at: Instant,
    last_activity: RwLock<Instant>,
    pub video_codec: VideoCodec,
    pub streaming_session_id: RwLock<Option<String>>,
    pending_ice_candidates: RwLock<Vec<(PendingCandidateKey, BufferedCandidate)>>,
    remote_ufrag: RwLock<Option<String>>,
    keyframe_target: RwLock<Option<Arc<AvHandler>>>,
}

impl WebRTCSession {
    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    async fn set_state(&self, state: SessionState) {
        *self.state.write().await = state;
    }

    pub async fn touch(&self) {
        *self.last_activity.write().await = Instant::now();
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub async fn idle_time(&self) -> Duration {
        self.last_activity.read().await.elapsed()
    }

    pub async fn is_expired(&self) -> bool {
        self.age() > SESSION_TTL
    }

    pub async fn set_streaming_session_id(&self, id: String) {
        *self.streaming_session_id.write().await = Some(id);
    }

    pub async fn set_remote_ufrag(&self, ufrag: String) {
        *self.remote_ufrag.write().await = Some(ufrag);
    }

    /// Attach the remote-play stream whose keyframes should be requested
    /// when the browser's RTCP feedback reports a PLI/FIR.
    pub async fn set_keyframe_target(&self, handler: Arc<AvHandler>) {
        *self.keyframe_target.write().await = Some(handler);
    }

    pub async fn request_keyframe(&self) {
        if let Some(handler) = self.keyframe_target.read().await.as_ref() {
            handler.request_keyframe_now();
        }
    }

    /// Buffer a server-generated candidate, applying the ufrag pass before
    /// storage so polling retrieval never has to rewrite stale entries.
    pub async fn buffer_local_candidate(&self, text: String, sdp_mid: Option<String>, sdp_mline_index: Option<u16>) {
        let ufrag = self.remote_ufrag.read().await.clone();
        let rewritten = match ufrag {
            Some(correct) => super::ice::ensure_ufrag(&text, &correct),
            None => text,
        };
        let mut buffered = self.pending_ice_candidates.write().await;
        upsert_candidate(&mut buffered, BufferedCandidate { text: rewritten, sdp_mid, sdp_mline_index });
    }

    pub async fn candidates_for_remote(&self) -> Vec<(String, Option<String>, Option<u16>)> {
        let ufrag = self.remote_ufrag.read().await.clone();
        let buffered = self.pending_ice_candidates.read().await;
        match ufrag {
            Some(ufrag) => super::ice::retrieve_for_ufrag(&buffered, &ufrag)
                .into_iter()
                .map(|c| (c.text.clone(), c.sdp_mid.clone(), c.sdp_mline_index))
                .collect(),
            None => buffered.iter().map(|(_, c)| (c.text.clone(), c.sdp_mid.clone(), c.sdp_mline_index)).collect(),
        }
    }

    pub async fn write_sample(&self, data: bytes::Bytes, duration: Duration) -> Result<(), RtcError> {
        use webrtc::media::Sample;
        self.video_track
            .write_sample(&Sample { data, duration, ..Default::default() })
            .await
    }

    pub async fn write_audio_sample(&self, data: bytes::Bytes, duration: Duration) -> Result<(), RtcError> {
        use webrtc::media::Sample;
        self.audio_track
            .write_sample(&Sample { data, duration, ..Default::default() })
            .await
    }

    pub async fn close(&self) -> Result<(), WebRtcSignallingError> {
        self.set_state(SessionState::Closed).await;
        PeerConnectionManager::close(&self.peer_connection).await
    }
}

pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Arc<WebRTCSession>>>>,
    config: WebRtcConfig,
    pc_manager: PeerConnectionManager,
}

impl SessionManager {
    pub fn new(config: WebRtcConfig) -> Self {
        let pc_manager = PeerConnectionManager::new(config.clone());
        Self { sessions: Arc::new(RwLock::new(HashMap::new())), config, pc_manager }
    }

    pub fn config(&self) -> &WebRtcConfig {
        &self.config
    }

    /// Create a session and return it together with the SDP offer the
    /// caller should hand back to the browser.
    pub async fn create_session(&self) -> Result<(Arc<WebRTCSession>, String), WebRtcSignallingError> {
        let peer_connection = self.pc_manager.create_peer_connection().await?;
        let video_track = self.pc_manager.create_video_track();
        let audio_track = self.pc_manager.create_audio_track();

        let video_sender = peer_connection
            .add_track(video_track.clone())
            .await
            .map_err(|e| WebRtcSignallingError::MediaError(e.to_string()))?;
        peer_connection
            .add_track(audio_track.clone())
            .await
            .map_err(|e| WebRtcSignallingError::MediaError(e.to_string()))?;

        let offer = self.pc_manager.create_offer(&peer_connection).await?;

        let id = uuid::Uuid::new_v4().to_string();
        let session = Arc::new(WebRTCSession {
            id: id.clone(),
            peer_connection,
            video_track,
            audio_track,
            state: RwLock::new(SessionState::New),
            created_at: Instant::now(),
            last_activity: RwLock::new(Instant::now()),
            video_codec: self.config.video_codec,
            streaming_session_id: RwLock::new(None),
            pending_ice_candidates: RwLock::new(Vec::new()),
            remote_ufrag: RwLock::new(None),
            keyframe_target: RwLock::new(None),
        });

        self.setup_session_callbacks(session.clone()).await;

        let keyframe_session = session.clone();
        PeerConnectionManager::spawn_keyframe_rtcp_reader(video_sender, move || {
            let keyframe_session = keyframe_session.clone();
            tokio::spawn(async move {
                keyframe_session.request_keyframe().await;
            });
        });

        self.sessions.write().await.insert(id, session.clone());
        Ok((session, offer))
    }

    async fn setup_session_callbacks(&self, session: Arc<WebRTCSession>) {
        let watch_session = session.clone();
        PeerConnectionManager::setup_state_callback(&session.peer_connection, move |state| {
            let watch_session = watch_session.clone();
            tokio::spawn(async move {
                watch_session.set_state(SessionState::from(state)).await;
            });
        })
        .await;

        let candidate_session = session.clone();
        PeerConnectionManager::setup_ice_callback(&session.peer_connection, move |candidate| {
            if let Some(text) = candidate {
                let candidate_session = candidate_session.clone();
                tokio::spawn(async move {
                    candidate_session.buffer_local_candidate(text, None, None).await;
                });
            }
        })
        .await;
    }

    pub async fn get_session(&self, id: &str) -> Option<Arc<WebRTCSession>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn remove_session(&self, id: &str) -> Option<Arc<WebRTCSession>> {
        let session = self.sessions.write().await.remove(id);
        if let Some(session) = &session {
            let _ = session.close().await;
        }
        session
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn handle_answer(&self, id: &str, sdp: &str) -> Result<(), WebRtcSignallingError> {
        let session = self.get_session(id).await.ok_or(WebRtcSignallingError::SessionNotFound)?;
        if let Some(ufrag) = extract_ufrag_from_sdp(sdp) {
            session.set_remote_ufrag(ufrag).await;
        }
        session.touch().await;
        PeerConnectionManager::handle_answer(&session.peer_connection, sdp).await
    }

    pub async fn add_ice_candidate(
        &self,
        id: &str,
        candidate: &str,
        sdp_mid: Option<&str>,
        sdp_mline_index: Option<u16>,
    ) -> Result<(), WebRtcSignallingError> {
        let session = self.get_session(id).await.ok_or(WebRtcSignallingError::SessionNotFound)?;
        session.touch().await;
        PeerConnectionManager::add_ice_candidate(&session.peer_connection, candidate, sdp_mid, sdp_mline_index).await
    }

    /// Remove any session past its 1-hour lifetime; returns the removed ids.
    pub async fn cleanup_expired_sessions(&self) -> Vec<String> {
        let expired: Vec<String> = {
            let sessions = self.sessions.read().await;
            let mut expired = Vec::new();
            for (id, session) in sessions.iter() {
                if session.is_expired().await {
                    expired.push(id.clone());
                }
            }
            expired
        };
        for id in &expired {
            self.remove_session(id).await;
        }
        expired
    }
}

fn extract_ufrag_from_sdp(sdp: &str) -> Option<String> {
    sdp.lines()
        .find(|l| l.starts_with("a=ice-ufrag:"))
        .map(|l| l.trim_start_matches("a=ice-ufrag:").trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_ufrag_from_remote_sdp() {
        let sdp = "v=0\r\na=ice-ufrag:abcd\r\na=ice-pwd:xyz\r\n";
        assert_eq!(extract_ufrag_from_sdp(sdp), Some("abcd".to_string()));
    }

    #[test]
    fn missing_ufrag_line_yields_none() {
        let sdp = "v=0\r\na=ice-pwd:xyz\r\n";
        assert_eq!(extract_ufrag_from_sdp(sdp), None);
    }
}
