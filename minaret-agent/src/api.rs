//! Local HTTP surface for on-site technician tooling. Everything returns
//! JSON; errors are non-2xx with an `{"error": ...}` body.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use minaret_core::DeviceIdentity;
use serde::Deserialize;
use serde_json::json;

use crate::audio::{AudioGuard, PlayOutcome};
use crate::health::HealthMonitor;
use crate::schedule::ScheduleEngine;
use crate::state::AgentState;
use crate::wifi::WifiManager;

pub struct ApiState {
    pub identity: DeviceIdentity,
    pub state: AgentState,
    pub audio: AudioGuard,
    pub engine: Arc<ScheduleEngine>,
    pub health: HealthMonitor,
    pub wifi: WifiManager,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(liveness))
        .route("/api/status", get(device_status))
        .route("/api/audio/volume", post(set_volume))
        .route("/api/audio/mute", post(set_muted))
        .route("/api/audio/test", post(audio_test))
        .route("/api/audio/files", get(audio_files))
        .route("/api/prayers/scheduled", get(scheduled_prayers))
        .route("/api/prayers/trigger", post(trigger_prayer))
        .route("/api/wifi/scan", get(wifi_scan))
        .route("/api/wifi/connect", post(wifi_connect))
        .with_state(state)
}

async fn liveness() -> &'static str {
    "OK"
}

async fn device_status(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    Json(json!({
        "deviceId": state.identity.device_id,
        "deviceInfo": state.identity,
        "status": state.state.status().await,
        "systemInfo": state.health.last_snapshot().await,
        "healthReport": state.health.health_report().await,
        "customerData": state.state.customer().await,
        "audio": state.audio.status(),
        "timestamp": jiff::Timestamp::now().to_string(),
    }))
}

#[derive(Debug, Deserialize)]
struct VolumeRequest {
    volume: i64,
}

async fn set_volume(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<VolumeRequest>,
) -> Json<serde_json::Value> {
    let volume = state.audio.set_volume(request.volume).await;
    Json(json!({ "success": true, "volume": volume }))
}

#[derive(Debug, Deserialize)]
struct MuteRequest {
    muted: bool,
}

async fn set_muted(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<MuteRequest>,
) -> Json<serde_json::Value> {
    state.audio.set_muted(request.muted);
    Json(json!({ "success": true, "muted": request.muted }))
}

async fn audio_test(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.audio.play_test().await {
        PlayOutcome::Played => Ok(Json(json!({ "success": true }))),
        PlayOutcome::SkippedBusy => Err(ApiError::Conflict("audio output busy".to_string())),
        PlayOutcome::SkippedMuted | PlayOutcome::Failed => {
            Err(ApiError::Internal("test playback failed".to_string()))
        }
    }
}

async fn audio_files(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    Json(json!({ "files": state.audio.available_audio_files().await }))
}

async fn scheduled_prayers(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    let scheduled: Vec<_> = state
        .engine
        .scheduled_prayers()
        .into_iter()
        .map(|(name, time)| {
            json!({
                "name": name,
                "time": time,
                "minutes": time.minutes_since_midnight(),
            })
        })
        .collect();
    let (next_name, next_time) = state.engine.next_prayer();
    let (current_name, current_time) = state.engine.current_prayer();

    Json(json!({
        "success": true,
        "scheduledPrayers": scheduled,
        "nextPrayer": { "name": next_name, "time": next_time },
        "currentPrayer": { "name": current_name, "time": current_time },
        "timestamp": jiff::Timestamp::now().to_string(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TriggerRequest {
    prayer_name: String,
}

async fn trigger_prayer(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<TriggerRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let name = request
        .prayer_name
        .parse()
        .map_err(|e| ApiError::BadRequest(format!("{e}")))?;
    state.engine.trigger_manually(name);
    Ok(Json(json!({
        "success": true,
        "message": format!("{name} prayer triggered"),
    })))
}

async fn wifi_scan(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let networks = state
        .wifi
        .scan_networks()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(json!({ "networks": networks })))
}

#[derive(Debug, Deserialize)]
struct WifiConnectRequest {
    ssid: String,
    password: String,
}

async fn wifi_connect(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<WifiConnectRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .wifi
        .connect(&request.ssid, &request.password)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(json!({ "success": true, "ssid": request.ssid })))
}
