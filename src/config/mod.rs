//! Configuration management for the remote-play relay.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Video codec selection for WebRTC streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    #[default]
    H264,
    H265,
}

impl VideoCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
            VideoCodec::H265 => "h265",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "video/H264",
            VideoCodec::H265 => "video/H265",
        }
    }

    pub fn rtp_payload_type(&self) -> u8 {
        match self {
            VideoCodec::H264 => 96,
            VideoCodec::H265 => 98,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServerConfig {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
    /// Shared secret for RFC 5766 §15 time-limited credentials; mutually
    /// exclusive with static username/credential.
    #[serde(default)]
    pub shared_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub http: HttpConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub webrtc: WebRtcConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub foreground: bool,
    pub pidfile: PathBuf,
    pub user: Option<String>,
    pub group: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    pub cors_origin: Option<String>,
    #[serde(default = "default_basic_auth_enabled")]
    pub basic_auth_enabled: bool,
    #[serde(default = "default_basic_auth_user")]
    pub basic_auth_user: String,
    #[serde(default = "default_basic_auth_password")]
    pub basic_auth_password: String,
    #[serde(default)]
    pub tls: bool,
}

/// WebRTC signalling/ICE configuration (§6 of the design).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRtcConfig {
    #[serde(default)]
    pub turn_servers: Vec<TurnServerConfig>,
    #[serde(default)]
    pub ice_port_min: Option<u16>,
    #[serde(default)]
    pub ice_port_max: Option<u16>,
    #[serde(default)]
    pub shuffle_ports: bool,
    #[serde(default)]
    pub public_ip: Option<String>,
    #[serde(default = "default_prefer_lan_candidates")]
    pub prefer_lan_candidates: bool,
    #[serde(default = "default_gather_timeout_no_turn_ms")]
    pub gather_timeout_no_turn_ms: u64,
    #[serde(default = "default_gather_timeout_turn_ms")]
    pub gather_timeout_turn_ms: u64,
    #[serde(default)]
    pub video_codec: VideoCodec,
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            turn_servers: Vec::new(),
            ice_port_min: None,
            ice_port_max: None,
            shuffle_ports: false,
            public_ip: None,
            prefer_lan_candidates: default_prefer_lan_candidates(),
            gather_timeout_no_turn_ms: default_gather_timeout_no_turn_ms(),
            gather_timeout_turn_ms: default_gather_timeout_turn_ms(),
            video_codec: VideoCodec::H264,
            session_ttl_secs: default_session_ttl_secs(),
        }
    }
}

/// Media-pipeline tuning (§4.C, §4.J of the design).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_resolution")]
    pub default_resolution: String,
    #[serde(default = "default_fps")]
    pub default_fps: u32,
    #[serde(default = "default_quality")]
    pub default_quality: String,
    #[serde(default = "default_reorder_timeout_ms")]
    pub reorder_timeout_ms: u64,
    #[serde(default = "default_reorder_size_min")]
    pub reorder_size_min: usize,
    #[serde(default = "default_reorder_size_max")]
    pub reorder_size_max: usize,
    #[serde(default = "default_keyframe_cooldown_ms")]
    pub keyframe_cooldown_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            discovery_timeout_ms: default_discovery_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            default_resolution: default_resolution(),
            default_fps: default_fps(),
            default_quality: default_quality(),
            reorder_timeout_ms: default_reorder_timeout_ms(),
            reorder_size_min: default_reorder_size_min(),
            reorder_size_max: default_reorder_size_max(),
            keyframe_cooldown_ms: default_keyframe_cooldown_ms(),
        }
    }
}

/// Reserved pass-through fields for the excluded auth collaborator (§6).
/// This crate does not implement authentication; these fields only exist so
/// deployments can keep one config file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub jwt_issuer: Option<String>,
    #[serde(default)]
    pub jwt_audience: Option<String>,
    #[serde(default)]
    pub jwt_secret: Option<String>,
    #[serde(default)]
    pub database_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub logfile: Option<PathBuf>,
    pub format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                foreground: false,
                pidfile: PathBuf::from("/var/run/remote-play-relay.pid"),
                user: None,
                group: None,
            },
            http: HttpConfig {
                host: "0.0.0.0".to_string(),
                port: 8008,
                cors_origin: None,
                basic_auth_enabled: false,
                basic_auth_user: "user".to_string(),
                basic_auth_password: "mypasswd".to_string(),
                tls: false,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                logfile: None,
                format: "plain".to_string(),
            },
            webrtc: WebRtcConfig::default(),
            relay: RelayConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file; missing file falls back to defaults.
    pub fn load(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration, returning a human-readable error on the first violation.
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.http.basic_auth_enabled && self.http.basic_auth_password.is_empty() {
            return Err("Basic auth is enabled but password is empty".into());
        }

        if let Some(ref ip) = self.webrtc.public_ip {
            if ip.parse::<std::net::IpAddr>().is_err() {
                return Err("webrtc.public_ip must be a valid IP address".into());
            }
        }

        if let (Some(min), Some(max)) = (self.webrtc.ice_port_min, self.webrtc.ice_port_max) {
            if min > max {
                return Err("webrtc.ice_port_min cannot exceed ice_port_max".into());
            }
        }

        for turn in &self.webrtc.turn_servers {
            let has_static = turn.username.is_some() || turn.credential.is_some();
            if has_static && turn.shared_secret.is_some() {
                return Err(
                    "turn_servers entries cannot set both shared_secret and static credentials"
                        .into(),
                );
            }
        }

        if self.relay.reorder_size_min == 0 {
            return Err("relay.reorder_size_min must be non-zero".into());
        }
        if self.relay.reorder_size_min > self.relay.reorder_size_max {
            return Err("relay.reorder_size_min cannot exceed reorder_size_max".into());
        }
        if self.relay.default_fps == 0 {
            return Err("relay.default_fps must be non-zero".into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn validate_rejects_empty_auth_password() {
        let mut cfg = Config::default();
        cfg.http.basic_auth_enabled = true;
        cfg.http.basic_auth_password.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_inverted_reorder_bounds() {
        let mut cfg = Config::default();
        cfg.relay.reorder_size_min = 64;
        cfg.relay.reorder_size_max = 8;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }
}

fn default_basic_auth_enabled() -> bool {
    false
}
fn default_basic_auth_user() -> String {
    "user".to_string()
}
fn default_basic_auth_password() -> String {
    "mypasswd".to_string()
}
fn default_prefer_lan_candidates() -> bool {
    true
}
fn default_gather_timeout_no_turn_ms() -> u64 {
    2_000
}
fn default_gather_timeout_turn_ms() -> u64 {
    8_000
}
fn default_session_ttl_secs() -> u64 {
    3_600
}
fn default_discovery_timeout_ms() -> u64 {
    30_000
}
fn default_connect_timeout_ms() -> u64 {
    6_000
}
fn default_resolution() -> String {
    "1920x1080".to_string()
}
fn default_fps() -> u32 {
    60
}
fn default_quality() -> String {
    "high".to_string()
}
fn default_reorder_timeout_ms() -> u64 {
    200
}
fn default_reorder_size_min() -> usize {
    32
}
fn default_reorder_size_max() -> usize {
    256
}
fn default_keyframe_cooldown_ms() -> u64 {
    8_000
}
