//! HTTP server: signaling WebSocket, VOX API, dashboard API
//!
//! All JSON endpoints answer `{success, ...}`. Recording downloads go
//! through a strict filename whitelist so no request ever names a path
//! outside the recordings directory.

use axum::{
    extract::ws::WebSocketUpgrade,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::{info, warn};
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::sync::OnceLock;
use tokio::net::TcpListener;

use crate::web::SharedState;

/// Accepted recording names: `rec_` (radio side) or `web_` captures only.
fn is_valid_recording_name(name: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    if let Some(pattern) = PATTERN.get() {
        return pattern.is_match(name);
    }
    let Ok(pattern) = Regex::new(r"^(?:rec|web)_\d{8}_\d{6}(?:_[A-Za-z0-9]+)?\.wav$") else {
        return false;
    };
    PATTERN.get_or_init(|| pattern).is_match(name)
}

/// Run the HTTP server. Serves until the process exits.
pub async fn run_http_server(state: Arc<SharedState>) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("0.0.0.0:{}", state.config.server.http_port);

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/vox/on", post(vox_on_handler))
        .route("/api/vox/off", post(vox_off_handler))
        .route("/api/dash/login", post(dash_login_handler))
        .route("/api/dash/logout", post(dash_logout_handler))
        .route("/api/dash/status", get(dash_status_handler))
        .route("/api/dash/clients", get(dash_clients_handler))
        .route("/api/dash/ptt", get(dash_ptt_handler))
        .route("/api/dash/ptt/release", post(dash_ptt_release_handler))
        .route(
            "/api/dash/clients/{id}/disconnect",
            post(dash_disconnect_handler),
        )
        .route("/api/dash/restart", post(dash_restart_handler))
        .route("/api/audio", get(audio_file_handler))
        .with_state(state);

    let listener = TcpListener::bind(&addr).await?;
    info!("HTTP server listening on http://{}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}

/// Signaling WebSocket upgrade
async fn ws_handler(
    State(state): State<Arc<SharedState>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        crate::transport::handle_signaling_connection(socket, state).await;
    })
}

/// Plain-text metrics snapshot
async fn metrics_handler(State(state): State<Arc<SharedState>>) -> String {
    let uptime = state.uptime().as_secs_f64();
    let clients = state.registry.count().await;
    let p2p = state.p2p_count().await;
    let mem = state.memory_rss_bytes();
    let transmitting = if state.floor.holder().is_some() { 1 } else { 0 };

    format!(
        r#"# HELP ptt_core_uptime_seconds Server uptime in seconds
# TYPE ptt_core_uptime_seconds counter
ptt_core_uptime_seconds {}
# HELP ptt_core_clients Connected signaling clients
# TYPE ptt_core_clients gauge
ptt_core_clients {}
# HELP ptt_core_p2p_connections Connected fan-out peer connections
# TYPE ptt_core_p2p_connections gauge
ptt_core_p2p_connections {}
# HELP ptt_core_mem_bytes Process RSS in bytes
# TYPE ptt_core_mem_bytes gauge
ptt_core_mem_bytes {}
# HELP ptt_core_transmitting Whether the floor is currently held
# TYPE ptt_core_transmitting gauge
ptt_core_transmitting {}
"#,
        uptime, clients, p2p, mem, transmitting
    )
}

async fn vox_on_handler(State(state): State<Arc<SharedState>>) -> impl IntoResponse {
    match state.vox_claim().await {
        Ok(()) => Json(json!({ "success": true })),
        Err(holder_name) => Json(json!({
            "success": false,
            "reason": format!("busy: {}", holder_name),
        })),
    }
}

async fn vox_off_handler(State(state): State<Arc<SharedState>>) -> impl IntoResponse {
    let released = state.vox_release().await;
    Json(json!({ "success": true, "released": released }))
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    password: String,
}

async fn dash_login_handler(
    State(state): State<Arc<SharedState>>,
    Json(request): Json<LoginRequest>,
) -> Response {
    match state.dash.login(&request.password) {
        Some(token) => Json(json!({ "success": true, "token": token })).into_response(),
        None => unauthorized(),
    }
}

async fn dash_logout_handler(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return unauthorized();
    };
    state.dash.logout(token);
    Json(json!({ "success": true })).into_response()
}

async fn dash_status_handler(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }

    Json(json!({
        "success": true,
        "uptime_seconds": state.uptime().as_secs_f64(),
        "clients": state.registry.count().await,
        "p2p_connections": state.p2p_count().await,
        "memory_rss_bytes": state.memory_rss_bytes(),
        "relay_enabled": state.relay.is_enabled(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
    .into_response()
}

async fn dash_clients_handler(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }

    let mut clients = Vec::new();
    for session in state.registry.all().await {
        let p2p_state = match session.p2p.lock().await.as_ref() {
            Some(peer) if peer.is_connected() => "connected",
            Some(_) => "pending",
            None => "none",
        };
        clients.push(json!({
            "clientId": session.client_id,
            "displayName": session.display_name(),
            "p2pState": p2p_state,
        }));
    }

    Json(json!({ "success": true, "clients": clients })).into_response()
}

async fn dash_ptt_handler(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }

    let holder = state.floor.holder();
    let speaker_name = match holder.as_deref() {
        Some(holder) => state.holder_display_name(holder).await,
        None => None,
    };

    Json(json!({
        "success": true,
        "speaker": holder,
        "speakerName": speaker_name,
    }))
    .into_response()
}

async fn dash_ptt_release_handler(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }

    warn!("Dashboard forced floor release");
    state.force_release_floor().await;
    Json(json!({ "success": true })).into_response()
}

async fn dash_disconnect_handler(
    State(state): State<Arc<SharedState>>,
    Path(client_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }

    let Some(session) = state.registry.get(&client_id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "error": "Unknown client" })),
        )
            .into_response();
    };

    info!("Dashboard disconnecting {}", client_id);
    session.send_frame(axum::extract::ws::Message::Close(Some(
        axum::extract::ws::CloseFrame {
            code: axum::extract::ws::close_code::NORMAL,
            reason: "disconnected by administrator".into(),
        },
    )));
    session.request_close();
    Json(json!({ "success": true })).into_response()
}

async fn dash_restart_handler(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }

    let marker = state.config.paths.restart_marker();
    if let Err(e) = std::fs::write(&marker, chrono::Local::now().to_rfc3339()) {
        warn!("Failed to write restart marker {:?}: {}", marker, e);
    }

    warn!("Dashboard requested restart; exiting for supervisor relaunch");
    tokio::spawn(async {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        std::process::exit(0);
    });

    Json(json!({ "success": true })).into_response()
}

#[derive(Debug, Deserialize)]
struct AudioFileQuery {
    file: String,
}

/// Serve a finished recording. Anything outside the whitelist is a 400
/// before any filesystem access happens.
async fn audio_file_handler(
    State(state): State<Arc<SharedState>>,
    Query(query): Query<AudioFileQuery>,
) -> Response {
    if !is_valid_recording_name(&query.file) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": "Invalid filename" })),
        )
            .into_response();
    }

    let path = state.config.paths.recordings_dir.join(&query.file);
    match tokio::fs::read(&path).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, "audio/wav")], bytes).into_response(),
        Err(_) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "error": "Not found" })),
        )
            .into_response(),
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
}

fn authorized(state: &SharedState, headers: &HeaderMap) -> bool {
    state.dash.verify_header(
        headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok()),
    )
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "success": false, "error": "Unauthorized" })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitelist_accepts_recording_names() {
        assert!(is_valid_recording_name("web_20260801_120000_aaaaaaaa.wav"));
        assert!(is_valid_recording_name("rec_20260801_120000.wav"));
        assert!(is_valid_recording_name("web_20260801_120000.wav"));
        assert!(is_valid_recording_name("rec_20260801_235959_ABC123.wav"));
    }

    #[test]
    fn whitelist_accepts_collision_renamed_files() {
        // The shapes unique_target produces on rename collisions
        assert!(is_valid_recording_name("web_20260801_120000_aaaaaaaa1.wav"));
        assert!(is_valid_recording_name("web_20260801_120000_aaaaaaaa2.wav"));
        assert!(is_valid_recording_name("rec_20260801_120000_1.wav"));
    }

    #[test]
    fn whitelist_rejects_traversal_and_junk() {
        assert!(!is_valid_recording_name("../../etc/passwd"));
        assert!(!is_valid_recording_name("..%2F..%2Fetc%2Fpasswd"));
        assert!(!is_valid_recording_name("web_20260801_120000_aaaaaaaa.wav.mp3"));
        assert!(!is_valid_recording_name("web_20260801_120000_aa/aa.wav"));
        assert!(!is_valid_recording_name("other_20260801_120000.wav"));
        assert!(!is_valid_recording_name("web_2026081_120000.wav"));
        assert!(!is_valid_recording_name("web_20260801_120000_.wav"));
        assert!(!is_valid_recording_name(""));
        assert!(!is_valid_recording_name("web_20260801_120000\u{0}.wav"));
    }
}
