// src/routes.rs
// Route definitions, merged into the main router by main().

use axum::{
    routing::{delete, get, post, put},
    Router,
};

use crate::state::AppState;
use crate::{admin_handlers, commitment_handlers, handlers, metrics_handler, report_handlers};

pub fn commitment_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/v1/domains/:domain/projects/:project/commitments",
            get(commitment_handlers::list_commitments),
        )
        .route(
            "/v1/domains/:domain/projects/:project/commitments/new",
            post(commitment_handlers::create_commitment),
        )
        .route(
            "/v1/domains/:domain/projects/:project/commitments/can-confirm",
            post(commitment_handlers::can_confirm_commitment),
        )
        .route(
            "/v1/domains/:domain/projects/:project/commitments/merge",
            post(commitment_handlers::merge_commitments),
        )
        .route(
            "/v1/domains/:domain/projects/:project/commitments/:id",
            delete(commitment_handlers::delete_commitment),
        )
        .route(
            "/v1/domains/:domain/projects/:project/commitments/:id/split",
            post(commitment_handlers::split_commitment),
        )
        .route(
            "/v1/domains/:domain/projects/:project/commitments/:id/convert",
            post(commitment_handlers::convert_commitment),
        )
        .route(
            "/v1/domains/:domain/projects/:project/commitments/:id/renew",
            post(commitment_handlers::renew_commitment),
        )
        .route(
            "/v1/domains/:domain/projects/:project/commitments/:id/update-duration",
            post(commitment_handlers::update_commitment_duration),
        )
        .route(
            "/v1/domains/:domain/projects/:project/commitments/:id/start-transfer",
            post(commitment_handlers::start_transfer),
        )
        .route(
            "/v1/domains/:domain/projects/:project/transfer-commitment/:id",
            post(commitment_handlers::accept_transfer),
        )
        // Token-based lookup for transfer recipients.
        .route(
            "/v1/commitments/:token",
            get(commitment_handlers::get_by_transfer_token),
        )
}

pub fn report_routes() -> Router<AppState> {
    Router::new()
        .route("/v1/domains/:domain", get(report_handlers::get_domain_report))
        .route(
            "/v1/domains/:domain/projects/:project",
            get(report_handlers::get_project_report),
        )
}

pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/v1/domains/:domain/projects/:project/max-quota",
            put(admin_handlers::put_max_quota),
        )
        .route(
            "/v1/domains/:domain/projects/:project/sync",
            post(admin_handlers::sync_project),
        )
}

pub fn health_routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(handlers::health_check))
        .route("/metrics", get(metrics_handler::serve_metrics))
}
