//! REST signalling surface plus ambient health/metrics endpoints.

#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;

use super::shared::SharedState;
use crate::webrtc::ice::{resolve_ice_servers, IceServerEntry};

pub async fn run_http_server(port: u16, state: Arc<SharedState>) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("0.0.0.0:{}", port);

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/turn-config", get(turn_config_handler))
        .route("/sessions", post(create_session_handler))
        .route("/sessions/{id}", delete(delete_session_handler))
        .route("/sessions/{id}/answer", post(answer_handler))
        .route("/sessions/{id}/candidates", post(add_candidate_handler).get(list_candidates_handler))
        .route("/sessions/{id}/connect-stream", post(connect_stream_handler))
        .route("/sessions/{id}/keyframe", post(keyframe_handler))
        .route("/sessions/{id}/stream-health", get(stream_health_handler))
        .route("/playstation/stop-session", post(stop_session_handler))
        .with_state(state);

    let listener = TcpListener::bind(&addr).await?;
    info!("HTTP server listening on http://{}", addr);
    axum::serve(listener, app).await.map_err(|e| Box::new(e) as Box<dyn std::error::Error>)
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

async fn health_handler(State(state): State<Arc<SharedState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "uptime_seconds": state.uptime_secs(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn metrics_handler(State(state): State<Arc<SharedState>>) -> String {
    let sessions = state.session_manager.session_count().await;
    let streams = state.stream_count().await;

    let mut frames_success = 0u64;
    let mut frames_recovered = 0u64;
    let mut frames_failed = 0u64;
    let mut frozen_streams = 0u64;
    for handler in state.streams.read().await.values() {
        let snap = handler.get_health_snapshot(false);
        frames_success += snap.recent_success as u64;
        frames_recovered += snap.recent_recovered as u64;
        frames_failed += snap.recent_failed as u64;
        if snap.frozen {
            frozen_streams += 1;
        }
    }

    format!(
        "# HELP remote_play_relay_uptime_seconds Server uptime in seconds\n\
# TYPE remote_play_relay_uptime_seconds counter\n\
remote_play_relay_uptime_seconds {uptime}\n\
# HELP remote_play_relay_sessions Active WebRTC sessions\n\
# TYPE remote_play_relay_sessions gauge\n\
remote_play_relay_sessions {sessions}\n\
# HELP remote_play_relay_streams Active remote-play streams\n\
# TYPE remote_play_relay_streams gauge\n\
remote_play_relay_streams {streams}\n\
# HELP remote_play_relay_frames_success Frames delivered without recovery, current window\n\
# TYPE remote_play_relay_frames_success gauge\n\
remote_play_relay_frames_success {frames_success}\n\
# HELP remote_play_relay_frames_fec_recovered Frames recovered by FEC, current window\n\
# TYPE remote_play_relay_frames_fec_recovered gauge\n\
remote_play_relay_frames_fec_recovered {frames_recovered}\n\
# HELP remote_play_relay_frames_failed Frames dropped/failed, current window\n\
# TYPE remote_play_relay_frames_failed gauge\n\
remote_play_relay_frames_failed {frames_failed}\n\
# HELP remote_play_relay_frozen_streams Streams currently flagged frozen\n\
# TYPE remote_play_relay_frozen_streams gauge\n\
remote_play_relay_frozen_streams {frozen_streams}\n",
        uptime = state.uptime_secs(),
    )
}

#[derive(Serialize)]
struct IceServerJson {
    urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    credential: Option<String>,
}

impl From<IceServerEntry> for IceServerJson {
    fn from(e: IceServerEntry) -> Self {
        Self { urls: e.urls, username: e.username, credential: e.credential }
    }
}

async fn turn_config_handler(State(state): State<Arc<SharedState>>) -> Json<serde_json::Value> {
    let servers = resolve_ice_servers(&state.config.webrtc.turn_servers, "remote-play-relay", std::time::Duration::from_secs(3600));
    let servers: Vec<IceServerJson> = servers.into_iter().map(Into::into).collect();
    Json(json!({ "turnServers": servers }))
}

#[derive(Serialize)]
struct CreateSessionResponse {
    session_id: String,
    sdp_offer: String,
}

async fn create_session_handler(State(state): State<Arc<SharedState>>) -> Response {
    match state.session_manager.create_session().await {
        Ok((session, offer)) => Json(CreateSessionResponse { session_id: session.id.clone(), sdp_offer: offer }).into_response(),
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn delete_session_handler(State(state): State<Arc<SharedState>>, Path(id): Path<String>) -> Response {
    match state.session_manager.remove_session(&id).await {
        Some(_) => StatusCode::NO_CONTENT.into_response(),
        None => json_error(StatusCode::NOT_FOUND, "session not found"),
    }
}

#[derive(Deserialize)]
struct AnswerRequest {
    sdp: String,
}

async fn answer_handler(State(state): State<Arc<SharedState>>, Path(id): Path<String>, Json(body): Json<AnswerRequest>) -> Response {
    match state.session_manager.handle_answer(&id, &body.sdp).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => json_error(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

#[derive(Deserialize)]
struct CandidateRequest {
    candidate: String,
    #[serde(rename = "sdpMid")]
    sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    sdp_mline_index: Option<u16>,
}

async fn add_candidate_handler(State(state): State<Arc<SharedState>>, Path(id): Path<String>, Json(body): Json<CandidateRequest>) -> Response {
    match state
        .session_manager
        .add_ice_candidate(&id, &body.candidate, body.sdp_mid.as_deref(), body.sdp_mline_index)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => json_error(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

#[derive(Serialize)]
struct CandidateJson {
    candidate: String,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    sdp_mline_index: Option<u16>,
}

async fn list_candidates_handler(State(state): State<Arc<SharedState>>, Path(id): Path<String>) -> Response {
    let Some(session) = state.session_manager.get_session(&id).await else {
        return json_error(StatusCode::NOT_FOUND, "session not found");
    };
    let candidates: Vec<CandidateJson> = session
        .candidates_for_remote()
        .await
        .into_iter()
        .map(|(candidate, sdp_mid, sdp_mline_index)| CandidateJson { candidate, sdp_mid, sdp_mline_index })
        .collect();
    Json(json!({ "candidates": candidates })).into_response()
}

#[derive(Deserialize)]
struct ConnectStreamRequest {
    remote_play_session_id: String,
}

async fn connect_stream_handler(State(state): State<Arc<SharedState>>, Path(id): Path<String>, Json(body): Json<ConnectStreamRequest>) -> Response {
    let Some(session) = state.session_manager.get_session(&id).await else {
        return json_error(StatusCode::NOT_FOUND, "session not found");
    };
    let Some(handler) = state.stream(&body.remote_play_session_id).await else {
        return json_error(StatusCode::NOT_FOUND, "remote-play session not found");
    };

    let receiver = super::receiver_bridge::SessionAvReceiver::new(session.clone(), state.config.relay.default_fps);
    handler.set_receiver(Arc::new(receiver));
    session.set_keyframe_target(handler).await;
    session.set_streaming_session_id(body.remote_play_session_id).await;
    StatusCode::NO_CONTENT.into_response()
}

async fn keyframe_handler(State(state): State<Arc<SharedState>>, Path(id): Path<String>) -> Response {
    let Some(session) = state.session_manager.get_session(&id).await else {
        return json_error(StatusCode::NOT_FOUND, "session not found");
    };
    let Some(streaming_id) = session.streaming_session_id.read().await.clone() else {
        return json_error(StatusCode::CONFLICT, "session is not attached to a stream");
    };
    match state.stream(&streaming_id).await {
        Some(handler) => {
            handler.request_keyframe_now();
            StatusCode::NO_CONTENT.into_response()
        }
        None => json_error(StatusCode::NOT_FOUND, "remote-play session not found"),
    }
}

async fn stream_health_handler(State(state): State<Arc<SharedState>>, Path(id): Path<String>) -> Response {
    let Some(session) = state.session_manager.get_session(&id).await else {
        return json_error(StatusCode::NOT_FOUND, "session not found");
    };
    let Some(streaming_id) = session.streaming_session_id.read().await.clone() else {
        return json_error(StatusCode::CONFLICT, "session is not attached to a stream");
    };
    match state.stream(&streaming_id).await {
        Some(handler) => Json(handler.get_health_snapshot(false)).into_response(),
        None => json_error(StatusCode::NOT_FOUND, "remote-play session not found"),
    }
}

#[derive(Deserialize)]
struct StopSessionQuery {
    #[serde(rename = "sessionId")]
    session_id: String,
}

async fn stop_session_handler(State(state): State<Arc<SharedState>>, Query(query): Query<StopSessionQuery>) -> Response {
    if let Some(handler) = state.remove_stream(&query.session_id).await {
        handler.stop();
    }
    StatusCode::NO_CONTENT.into_response()
}
