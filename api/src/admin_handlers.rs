/// Administrative endpoints: quota ceilings and explicit sync requests.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use shared::quota;
use shared::reports;
use tracing::info;

use crate::error::{ApiError, ApiResult};
use crate::models::MaxQuotaEntry;
use crate::policy::{Token, PERMISSION_ADMIN};
use crate::state::AppState;

// ─────────────────────────────────────────────────────────
// PUT /v1/domains/:domain/projects/:project/max-quota
// ─────────────────────────────────────────────────────────
pub async fn put_max_quota(
    State(state): State<AppState>,
    Path((domain, project)): Path<(String, String)>,
    token: Token,
    Json(entries): Json<Vec<MaxQuotaEntry>>,
) -> ApiResult<StatusCode> {
    token.require(PERMISSION_ADMIN)?;
    let project = reports::fetch_project(&state.db, &domain, &project).await?;

    let mut tx = state.db.begin().await.map_err(shared::QuotaError::from)?;
    for entry in &entries {
        let resource: Option<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT s.id, r.id FROM resources r
            JOIN services s ON s.id = r.service_id
            WHERE s.type = $1 AND r.name = $2
            "#,
        )
        .bind(&entry.service_type)
        .bind(&entry.resource_name)
        .fetch_optional(&mut *tx)
        .await
        .map_err(shared::QuotaError::from)?;
        let Some((service_id, resource_id)) = resource else {
            return Err(ApiError::unprocessable(format!(
                "no such resource: {}/{}",
                entry.service_type, entry.resource_name
            )));
        };

        // The ceiling may be set before the first scrape created the rows.
        quota::ensure_project_az_cell(
            &mut tx,
            project.id,
            service_id,
            resource_id,
            shared::models::AZ_ANY,
        )
        .await?;

        sqlx::query(
            r#"
            UPDATE project_resources pr
            SET max_quota_from_outside_admin = $3
            FROM project_services ps
            WHERE pr.project_service_id = ps.id
              AND ps.project_id = $1 AND pr.resource_id = $2
            "#,
        )
        .bind(project.id)
        .bind(resource_id)
        .bind(entry.max_quota.map(quota::db_from_u64))
        .execute(&mut *tx)
        .await
        .map_err(shared::QuotaError::from)?;

        let multiplier = state
            .cluster
            .resource(&entry.service_type, &entry.resource_name)
            .map(|r| r.growth_multiplier())
            .unwrap_or(1.0);
        quota::recompute_resource_quotas(&mut tx, resource_id, multiplier).await?;
    }
    tx.commit().await.map_err(shared::QuotaError::from)?;

    info!(
        project = %project.name,
        entries = entries.len(),
        "Administrative quota ceilings updated"
    );
    Ok(StatusCode::ACCEPTED)
}

// ─────────────────────────────────────────────────────────
// POST /v1/domains/:domain/projects/:project/sync
// ─────────────────────────────────────────────────────────
pub async fn sync_project(
    State(state): State<AppState>,
    Path((domain, project)): Path<(String, String)>,
    _token: Token,
) -> ApiResult<StatusCode> {
    let project = reports::fetch_project(&state.db, &domain, &project).await?;

    sqlx::query("UPDATE project_services SET stale = TRUE WHERE project_id = $1")
        .bind(project.id)
        .execute(&state.db)
        .await
        .map_err(shared::QuotaError::from)?;

    info!(project = %project.name, "Project marked for immediate usage scrape");
    Ok(StatusCode::ACCEPTED)
}
