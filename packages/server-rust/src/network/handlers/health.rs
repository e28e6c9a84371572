//! Health, liveness, and readiness endpoint handlers.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use super::AppState;

/// Detailed health report. Always 200; `ready` carries the aggregate.
pub async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "ready": state.health.is_ready(),
        "state": state.shutdown.health_state().as_str(),
        "services": state.health.snapshot(),
        "inFlight": state.shutdown.in_flight_count(),
        "uptimeSecs": state.start_time.elapsed().as_secs(),
    }))
}

/// Liveness probe: the process is up and serving.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe: 200 only while every registered dependency is ready.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.health.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
