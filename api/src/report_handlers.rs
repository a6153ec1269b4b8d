/// Read-only report endpoints backed by shared::reports.

use axum::{
    extract::{Path, State},
    Json,
};
use shared::reports::{self, DomainReport, ProjectReport};

use crate::error::ApiResult;
use crate::policy::Token;
use crate::state::AppState;

// ─────────────────────────────────────────────────────────
// GET /v1/domains/:domain
// ─────────────────────────────────────────────────────────
pub async fn get_domain_report(
    State(state): State<AppState>,
    Path(domain): Path<String>,
    _token: Token,
) -> ApiResult<Json<DomainReport>> {
    let domain = reports::fetch_domain(&state.db, &domain).await?;
    // Domain reports walk every project; render one at a time.
    let _guard = state.report_render_lock.lock().await;
    let report = reports::domain_report(&state.db, &domain).await?;
    Ok(Json(report))
}

// ─────────────────────────────────────────────────────────
// GET /v1/domains/:domain/projects/:project
// ─────────────────────────────────────────────────────────
pub async fn get_project_report(
    State(state): State<AppState>,
    Path((domain, project)): Path<(String, String)>,
    _token: Token,
) -> ApiResult<Json<ProjectReport>> {
    let project = reports::fetch_project(&state.db, &domain, &project).await?;
    let report = reports::project_report(&state.db, &project).await?;
    Ok(Json(report))
}
