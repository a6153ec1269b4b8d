/// Axum handlers for the commitment lifecycle. Thin translation only:
/// resolve the project, check the token, call into the engine, render the
/// result. All semantics live in shared::commitment.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use shared::errors::QuotaError;
use shared::models::Project;
use shared::reports::{self, CommitmentFilter};

use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::models::{
    CanConfirmResponse, CommitmentListResponse, CommitmentResponse, ConvertRequest, ListQuery,
    MergeRequest, NewCommitmentRequest, SplitResponse, StartTransferRequest,
    UpdateDurationRequest,
};
use crate::policy::{Token, PERMISSION_COMMIT, PERMISSION_UNCOMMIT};
use crate::state::AppState;

async fn resolve_project(
    state: &AppState,
    domain_ref: &str,
    project_ref: &str,
) -> ApiResult<Project> {
    Ok(reports::fetch_project(&state.db, domain_ref, project_ref).await?)
}

fn outcome_of(err: &QuotaError) -> &'static str {
    match err {
        QuotaError::CapacityExceeded(_) | QuotaError::Conflict(_) => "rejected",
        _ => "error",
    }
}

/// Count the operation and translate the error in one place.
fn tracked<T>(operation: &str, result: Result<T, QuotaError>) -> ApiResult<T> {
    match result {
        Ok(value) => {
            metrics::record_operation(operation, "success");
            Ok(value)
        }
        Err(err) => {
            metrics::record_operation(operation, outcome_of(&err));
            Err(err.into())
        }
    }
}

// ─────────────────────────────────────────────────────────
// GET /v1/domains/:domain/projects/:project/commitments
// ─────────────────────────────────────────────────────────
pub async fn list_commitments(
    State(state): State<AppState>,
    Path((domain, project)): Path<(String, String)>,
    Query(query): Query<ListQuery>,
    _token: Token,
) -> ApiResult<Json<CommitmentListResponse>> {
    let project = resolve_project(&state, &domain, &project).await?;
    let filter = CommitmentFilter {
        service_type: query.service,
        resource_name: query.resource,
        include_inactive: query.include_inactive,
    };
    let commitments = reports::list_commitments(&state.db, project.id, &filter).await?;
    Ok(Json(CommitmentListResponse { commitments }))
}

// ─────────────────────────────────────────────────────────
// POST /v1/domains/:domain/projects/:project/commitments/new
// ─────────────────────────────────────────────────────────
pub async fn create_commitment(
    State(state): State<AppState>,
    Path((domain, project)): Path<(String, String)>,
    token: Token,
    Json(body): Json<NewCommitmentRequest>,
) -> ApiResult<(StatusCode, Json<CommitmentResponse>)> {
    token.require(PERMISSION_COMMIT)?;
    let project = resolve_project(&state, &domain, &project).await?;
    let request = body.into_create_request()?;

    let created = tracked(
        "create",
        state
            .commitments
            .create(&project, &token.principal(), request)
            .await,
    )?;
    let commitment = reports::commitment_report_by_id(&state.db, created.id).await?;
    Ok((StatusCode::CREATED, Json(CommitmentResponse { commitment })))
}

// ─────────────────────────────────────────────────────────
// POST /v1/domains/:domain/projects/:project/commitments/can-confirm
// ─────────────────────────────────────────────────────────
pub async fn can_confirm_commitment(
    State(state): State<AppState>,
    Path((domain, project)): Path<(String, String)>,
    token: Token,
    Json(body): Json<NewCommitmentRequest>,
) -> ApiResult<Json<CanConfirmResponse>> {
    token.require(PERMISSION_COMMIT)?;
    let project = resolve_project(&state, &domain, &project).await?;
    let request = body.into_create_request()?;

    let result = state.commitments.can_confirm(&project, &request).await?;
    Ok(Json(CanConfirmResponse { result }))
}

// ─────────────────────────────────────────────────────────
// DELETE /v1/domains/:domain/projects/:project/commitments/:id
// ─────────────────────────────────────────────────────────
pub async fn delete_commitment(
    State(state): State<AppState>,
    Path((domain, project, id)): Path<(String, String, i64)>,
    token: Token,
) -> ApiResult<StatusCode> {
    let project = resolve_project(&state, &domain, &project).await?;
    let has_uncommit = token.check(PERMISSION_UNCOMMIT);

    tracked(
        "delete",
        state
            .commitments
            .delete(&project, &token.principal(), id, has_uncommit)
            .await,
    )?;
    Ok(StatusCode::NO_CONTENT)
}

// ─────────────────────────────────────────────────────────
// POST /v1/domains/:domain/projects/:project/commitments/:id/start-transfer
// ─────────────────────────────────────────────────────────
pub async fn start_transfer(
    State(state): State<AppState>,
    Path((domain, project, id)): Path<(String, String, i64)>,
    token: Token,
    Json(body): Json<StartTransferRequest>,
) -> ApiResult<Json<CommitmentResponse>> {
    token.require(PERMISSION_COMMIT)?;
    let project = resolve_project(&state, &domain, &project).await?;

    let listed = tracked(
        "start-transfer",
        state
            .commitments
            .start_transfer(
                &project,
                &token.principal(),
                id,
                body.amount,
                body.transfer_status,
            )
            .await,
    )?;
    let commitment = reports::commitment_report_by_id(&state.db, listed.id).await?;
    Ok(Json(CommitmentResponse { commitment }))
}

// ─────────────────────────────────────────────────────────
// GET /v1/commitments/:token
// ─────────────────────────────────────────────────────────
pub async fn get_by_transfer_token(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> ApiResult<Json<CommitmentResponse>> {
    let found = state.commitments.get_by_transfer_token(&token).await?;
    let commitment = reports::commitment_report_by_id(&state.db, found.id).await?;
    Ok(Json(CommitmentResponse { commitment }))
}

// ─────────────────────────────────────────────────────────
// POST /v1/domains/:domain/projects/:project/transfer-commitment/:id
// ─────────────────────────────────────────────────────────
pub async fn accept_transfer(
    State(state): State<AppState>,
    Path((domain, project, id)): Path<(String, String, i64)>,
    headers: HeaderMap,
    token: Token,
) -> ApiResult<Json<CommitmentResponse>> {
    token.require(PERMISSION_COMMIT)?;
    let project = resolve_project(&state, &domain, &project).await?;

    let transfer_token = headers
        .get("transfer-token")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::unprocessable("missing Transfer-Token header"))?;

    // The token is the credential; the path id guards against stale links.
    let listed = state.commitments.get_by_transfer_token(transfer_token).await?;
    if listed.id != id {
        return Err(ApiError::not_found(format!("no commitment with ID {}", id)));
    }

    let moved = tracked(
        "accept-transfer",
        state
            .commitments
            .accept_transfer(&project, &token.principal(), transfer_token)
            .await,
    )?;
    let commitment = reports::commitment_report_by_id(&state.db, moved.id).await?;
    Ok(Json(CommitmentResponse { commitment }))
}

// ─────────────────────────────────────────────────────────
// POST /v1/domains/:domain/projects/:project/commitments/:id/split
// ─────────────────────────────────────────────────────────
#[derive(Debug, serde::Deserialize)]
pub struct SplitRequest {
    pub amount: u64,
}

pub async fn split_commitment(
    State(state): State<AppState>,
    Path((domain, project, id)): Path<(String, String, i64)>,
    token: Token,
    Json(body): Json<SplitRequest>,
) -> ApiResult<Json<SplitResponse>> {
    token.require(PERMISSION_COMMIT)?;
    let project = resolve_project(&state, &domain, &project).await?;

    let (first, second) = tracked(
        "split",
        state
            .commitments
            .split(&project, &token.principal(), id, body.amount)
            .await,
    )?;
    let commitments = vec![
        reports::commitment_report_by_id(&state.db, first.id).await?,
        reports::commitment_report_by_id(&state.db, second.id).await?,
    ];
    Ok(Json(SplitResponse { commitments }))
}

// ─────────────────────────────────────────────────────────
// POST /v1/domains/:domain/projects/:project/commitments/merge
// ─────────────────────────────────────────────────────────
pub async fn merge_commitments(
    State(state): State<AppState>,
    Path((domain, project)): Path<(String, String)>,
    token: Token,
    Json(body): Json<MergeRequest>,
) -> ApiResult<Json<CommitmentResponse>> {
    token.require(PERMISSION_COMMIT)?;
    let project = resolve_project(&state, &domain, &project).await?;

    let merged = tracked(
        "merge",
        state
            .commitments
            .merge(&project, &token.principal(), &body.commitment_ids)
            .await,
    )?;
    let commitment = reports::commitment_report_by_id(&state.db, merged.id).await?;
    Ok(Json(CommitmentResponse { commitment }))
}

// ─────────────────────────────────────────────────────────
// POST /v1/domains/:domain/projects/:project/commitments/:id/convert
// ─────────────────────────────────────────────────────────
pub async fn convert_commitment(
    State(state): State<AppState>,
    Path((domain, project, id)): Path<(String, String, i64)>,
    token: Token,
    Json(body): Json<ConvertRequest>,
) -> ApiResult<Json<CommitmentResponse>> {
    token.require(PERMISSION_COMMIT)?;
    let project = resolve_project(&state, &domain, &project).await?;

    let converted = tracked(
        "convert",
        state
            .commitments
            .convert(
                &project,
                &token.principal(),
                id,
                body.source_amount,
                &body.target_service_type,
                &body.target_resource_name,
                body.target_amount,
            )
            .await,
    )?;
    let commitment = reports::commitment_report_by_id(&state.db, converted.id).await?;
    Ok(Json(CommitmentResponse { commitment }))
}

// ─────────────────────────────────────────────────────────
// POST /v1/domains/:domain/projects/:project/commitments/:id/renew
// ─────────────────────────────────────────────────────────
pub async fn renew_commitment(
    State(state): State<AppState>,
    Path((domain, project, id)): Path<(String, String, i64)>,
    token: Token,
) -> ApiResult<(StatusCode, Json<CommitmentResponse>)> {
    token.require(PERMISSION_COMMIT)?;
    let project = resolve_project(&state, &domain, &project).await?;

    let renewed = tracked(
        "renew",
        state
            .commitments
            .renew(&project, &token.principal(), id)
            .await,
    )?;
    let commitment = reports::commitment_report_by_id(&state.db, renewed.id).await?;
    Ok((StatusCode::CREATED, Json(CommitmentResponse { commitment })))
}

// ─────────────────────────────────────────────────────────
// POST /v1/domains/:domain/projects/:project/commitments/:id/update-duration
// ─────────────────────────────────────────────────────────
pub async fn update_commitment_duration(
    State(state): State<AppState>,
    Path((domain, project, id)): Path<(String, String, i64)>,
    token: Token,
    Json(body): Json<UpdateDurationRequest>,
) -> ApiResult<Json<CommitmentResponse>> {
    token.require(PERMISSION_COMMIT)?;
    let project = resolve_project(&state, &domain, &project).await?;
    let duration = body
        .duration
        .parse()
        .map_err(|err: String| ApiError::unprocessable(format!("invalid duration: {}", err)))?;

    let updated = tracked(
        "update-duration",
        state
            .commitments
            .update_duration(&project, &token.principal(), id, duration)
            .await,
    )?;
    let commitment = reports::commitment_report_by_id(&state.db, updated.id).await?;
    Ok(Json(CommitmentResponse { commitment }))
}
