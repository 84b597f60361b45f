//! WebRTC republishing: peer connection lifecycle, SDP rewriting, ICE
//! candidate bookkeeping, and the per-browser session registry.

pub mod ice;
pub mod peer_connection;
pub mod sdp;
pub mod session;

pub use session::{SessionManager, SessionState, WebRTCSession};

use std::error::Error;
use std::fmt;

#[derive(Debug)]
pub enum WebRtcSignallingError {
    ConnectionFailed(String),
    SdpError(String),
    IceError(String),
    MediaError(String),
    SessionNotFound,
    InvalidState(String),
}

impl fmt::Display for WebRtcSignallingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebRtcSignallingError::ConnectionFailed(msg) => write!(f, "connection failed: {}", msg),
            WebRtcSignallingError::SdpError(msg) => write!(f, "SDP error: {}", msg),
            WebRtcSignallingError::IceError(msg) => write!(f, "ICE error: {}", msg),
            WebRtcSignallingError::MediaError(msg) => write!(f, "media error: {}", msg),
            WebRtcSignallingError::SessionNotFound => write!(f, "session not found"),
            WebRtcSignallingError::InvalidState(msg) => write!(f, "invalid state: {}", msg),
        }
    }
}

impl Error for WebRtcSignallingError {}
