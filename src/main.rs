//! Remote-play relay entry point: config load, session registry, HTTP
//! signalling surface, and the per-stream handshake/AV workers.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info};

use remote_play_relay::args::Args;
use remote_play_relay::web::{run_http_server, SharedState};
use remote_play_relay::webrtc::SessionManager;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::new()
        .parse_filters(&format!("remote_play_relay={},webrtc=warn,webrtc_ice=warn", log_level))
        .init();

    info!("remote-play-relay v{} starting", env!("CARGO_PKG_VERSION"));

    let mut config = match args.load_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    args.apply_overrides(&mut config);

    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        error!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    info!("HTTP listening on {}:{}", config.http.host, config.http.port);
    info!("Video codec: {}", config.webrtc.video_codec.as_str());

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(config)) {
        eprintln!("Fatal error: {}", e);
        error!("Fatal error: {}", e);
        std::process::exit(1);
    }
}

async fn run(config: remote_play_relay::Config) -> Result<(), Box<dyn std::error::Error>> {
    let port = config.http.port;
    let session_manager = Arc::new(SessionManager::new(config.webrtc.clone()));
    let shared_state = Arc::new(SharedState::new(config.clone(), session_manager.clone()));

    tokio::spawn(cleanup_expired_sessions_loop(session_manager.clone()));

    run_http_server(port, shared_state).await
}

/// Background sweep that enforces the 1-hour session lifetime.
async fn cleanup_expired_sessions_loop(session_manager: Arc<SessionManager>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    loop {
        ticker.tick().await;
        let expired = session_manager.cleanup_expired_sessions().await;
        if !expired.is_empty() {
            info!("expired {} idle WebRTC session(s)", expired.len());
        }
    }
}

