use clap::Parser;
use std::path::PathBuf;

use crate::config;

#[derive(Parser, Debug)]
#[command(name = "remote-play-relay")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Console remote-play to WebRTC relay", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/remote-play-relay.toml")]
    pub config: PathBuf,

    /// HTTP port for signalling/health/metrics
    #[arg(long)]
    pub http_port: Option<u16>,

    /// Enable or disable HTTP basic authentication (true/false)
    #[arg(long)]
    pub basic_auth_enabled: Option<bool>,

    /// Basic authentication username
    #[arg(long)]
    pub basic_auth_user: Option<String>,

    /// Basic authentication password
    #[arg(long)]
    pub basic_auth_password: Option<String>,

    /// Public IP to rewrite SDP host addresses with
    #[arg(long)]
    pub public_ip: Option<String>,

    /// Prefer LAN candidates when reordering SDP (true/false)
    #[arg(long)]
    pub prefer_lan_candidates: Option<bool>,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,

    /// Run in foreground (don't daemonize)
    #[arg(long, action)]
    pub foreground: bool,

    /// Enable HTTPS with auto-generated self-signed certificate
    #[arg(long, action)]
    pub tls: bool,

    /// PID file path
    #[arg(long, default_value = "/var/run/remote-play-relay.pid")]
    pub pidfile: PathBuf,
}

impl Args {
    pub fn load_config(&self) -> Result<config::Config, Box<dyn std::error::Error>> {
        config::Config::load(&self.config)
    }

    pub fn apply_overrides(&self, config: &mut config::Config) {
        if let Some(port) = self.http_port {
            config.http.port = port;
        }
        if let Some(v) = self.basic_auth_enabled {
            config.http.basic_auth_enabled = v;
        }
        if let Some(ref u) = self.basic_auth_user {
            config.http.basic_auth_user = u.clone();
        }
        if let Some(ref p) = self.basic_auth_password {
            config.http.basic_auth_password = p.clone();
        }
        if let Some(ref ip) = self.public_ip {
            config.webrtc.public_ip = Some(ip.clone());
        }
        if let Some(v) = self.prefer_lan_candidates {
            config.webrtc.prefer_lan_candidates = v;
        }
        if self.tls {
            config.http.tls = true;
        }
        if self.foreground {
            config.server.foreground = true;
        }
        config.server.pidfile = self.pidfile.clone();
    }
}
