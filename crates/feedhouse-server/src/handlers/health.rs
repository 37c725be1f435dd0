//! Health and status endpoints

use axum::{extract::State, http::StatusCode, Json};
use feedhouse_agent::LifecycleHealth;
use serde::Serialize;
use tracing::warn;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub shutting_down: bool,
    /// Highest submission id handed out by the repository
    pub repository_last_id: u64,
    #[serde(flatten)]
    pub lifecycle: LifecycleHealth,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// Liveness probe: if we can respond, we're alive
pub async fn liveness_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// Readiness probe
///
/// 503 while shutting down, when the aggregation schedule is not running, or when
/// a required destination's circuit is open.
pub async fn readiness_check(
    State(state): State<AppState>,
) -> Result<Json<HealthResponse>, (StatusCode, Json<HealthResponse>)> {
    let health = state.lifecycle.health().await;
    if !state.is_shutting_down() && health.is_ready() {
        return Ok(Json(HealthResponse {
            status: "ready".to_string(),
        }));
    }

    let reason = if state.is_shutting_down() {
        "shutting_down"
    } else if !health.scanner_running {
        "scanner_stopped"
    } else {
        "destination_unavailable"
    };
    warn!(reason, "Readiness check failed");
    Err((
        StatusCode::SERVICE_UNAVAILABLE,
        Json(HealthResponse {
            status: reason.to_string(),
        }),
    ))
}

pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        shutting_down: state.is_shutting_down(),
        repository_last_id: state.receiver.store().last_id().0,
        lifecycle: state.lifecycle.health().await,
    })
}
