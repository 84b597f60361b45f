//! Shared application state handed to every axum handler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;

use crate::av_handler::AvHandler;
use crate::config::Config;
use crate::webrtc::SessionManager;

pub struct SharedState {
    pub config: Config,
    pub session_manager: Arc<SessionManager>,
    /// Remote-play streams keyed by `streaming_session_id`, the identifier a
    /// browser session attaches to via `connect-stream`.
    pub streams: RwLock<HashMap<String, Arc<AvHandler>>>,
    start: Instant,
}

impl SharedState {
    pub fn new(config: Config, session_manager: Arc<SessionManager>) -> Self {
        Self { config, session_manager, streams: RwLock::new(HashMap::new()), start: Instant::now() }
    }

    pub fn uptime_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    pub async fn register_stream(&self, streaming_session_id: String, handler: Arc<AvHandler>) {
        self.streams.write().await.insert(streaming_session_id, handler);
    }

    pub async fn stream(&self, streaming_session_id: &str) -> Option<Arc<AvHandler>> {
        self.streams.read().await.get(streaming_session_id).cloned()
    }

    pub async fn remove_stream(&self, streaming_session_id: &str) -> Option<Arc<AvHandler>> {
        self.streams.write().await.remove(streaming_session_id)
    }

    pub async fn stream_count(&self) -> usize {
        self.streams.read().await.len()
    }
}
