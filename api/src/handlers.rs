/// Health and fallback handlers.

use axum::{extract::State, http::StatusCode, Json};

use crate::error::ApiError;
use crate::models::HealthResponse;
use crate::state::AppState;

// ─────────────────────────────────────────────────────────
// GET /healthz
// ─────────────────────────────────────────────────────────
pub async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<HealthResponse>, ApiError> {
    let db_ok = sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(&state.db)
        .await
        .is_ok();

    let response = HealthResponse {
        status: if db_ok { "ok" } else { "degraded" }.to_string(),
        database: if db_ok { "up" } else { "down" }.to_string(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    };
    if db_ok {
        Ok(Json(response))
    } else {
        Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "Unhealthy",
            "database unreachable",
        ))
    }
}

pub async fn route_not_found() -> ApiError {
    ApiError::not_found("no such route")
}
