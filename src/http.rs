use crate::fleet::{DeviceInfo, EnsureRequest, FleetHandle};
use crate::stats::{PipelineStats, StatsSnapshot};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct HttpState {
    pub fleet: FleetHandle,
    pub stats: Arc<PipelineStats>,
}

#[derive(Debug, Deserialize)]
struct EnsureBody {
    sensor_type: String,
    target_count: usize,
    #[serde(default)]
    ramp_up_delay_ms: u64,
    #[serde(default)]
    ramp_down_delay_ms: u64,
}

#[derive(Debug, Serialize)]
struct FleetResponse {
    devices: Vec<DeviceInfo>,
    stats: StatsSnapshot,
}

#[derive(Debug, Serialize)]
struct EnsureResponse {
    devices: Vec<DeviceInfo>,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_fleet(
    State(state): State<HttpState>,
) -> Result<Json<FleetResponse>, (StatusCode, String)> {
    let devices = state
        .fleet
        .list()
        .await
        .map_err(|err| (StatusCode::SERVICE_UNAVAILABLE, err.to_string()))?;
    Ok(Json(FleetResponse {
        devices,
        stats: state.stats.snapshot(),
    }))
}

async fn post_ensure(
    State(state): State<HttpState>,
    Json(body): Json<EnsureBody>,
) -> Result<Json<EnsureResponse>, (StatusCode, String)> {
    let devices = state
        .fleet
        .ensure(EnsureRequest {
            sensor_type: body.sensor_type,
            target: body.target_count,
            ramp_up: Duration::from_millis(body.ramp_up_delay_ms),
            ramp_down: Duration::from_millis(body.ramp_down_delay_ms),
        })
        .await
        .map_err(|err| (StatusCode::BAD_REQUEST, err.to_string()))?;
    Ok(Json(EnsureResponse { devices }))
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/fleet", get(get_fleet))
        .route("/v1/fleet/ensure", post(post_ensure))
        .with_state(state)
}
