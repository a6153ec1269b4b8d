/// GET /metrics
/// Queue and scraper gauges are derived from the database at scrape time;
/// the counters accumulate in-process.

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;

use crate::metrics;
use crate::state::AppState;

async fn refresh_gauges(state: &AppState) {
    if let Ok((depth, max_failed)) = sqlx::query_as::<_, (i64, Option<i64>)>(
        "SELECT COUNT(*), MAX(failed_submissions) FROM mail_notifications",
    )
    .fetch_one(&state.db)
    .await
    {
        metrics::MAIL_QUEUE_DEPTH.set(depth);
        metrics::MAIL_FAILED_SUBMISSIONS.set(max_failed.unwrap_or(0));
    }

    if let Ok((count,)) = sqlx::query_as::<_, (i64,)>(
        "SELECT COUNT(*) FROM project_services WHERE scrape_error <> ''",
    )
    .fetch_one(&state.db)
    .await
    {
        metrics::PROJECT_SCRAPE_ERRORS.set(count);
    }

    if let Ok((count,)) = sqlx::query_as::<_, (i64,)>(
        "SELECT COUNT(*) FROM cluster_capacitors WHERE scrape_error <> ''",
    )
    .fetch_one(&state.db)
    .await
    {
        metrics::CAPACITOR_SCRAPE_ERRORS.set(count);
    }
}

pub async fn serve_metrics(State(state): State<AppState>) -> impl IntoResponse {
    refresh_gauges(&state).await;
    let body = metrics::render(&state.registry);
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}
