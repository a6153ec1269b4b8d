mod admin_handlers;
mod commitment_handlers;
mod error;
mod handlers;
mod metrics;
mod metrics_handler;
mod models;
mod policy;
mod report_handlers;
mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::http::{header, HeaderValue, Method};
use axum::{middleware, Router};
use dotenv::dotenv;
use prometheus::Registry;
use shared::audit::LogAuditor;
use shared::clock::{SharedClock, SystemClock};
use shared::commitment::CommitmentService;
use shared::config::ClusterConfig;
use shared::liquid::DriverRegistry;
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::CorsLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "api=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let registry = Registry::new_custom(Some("quotad".into()), None)?;
    metrics::register_all(&registry)?;

    // Database connection
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPoolOptions::new()
        .max_connections(
            std::env::var("API_DB_MAX_CONNECTIONS")
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(5),
        )
        // Bound every query; a wedged backend must not pin handlers forever.
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                use sqlx::Executor;
                conn.execute("SET statement_timeout = '10s'").await?;
                Ok(())
            })
        })
        .connect(&database_url)
        .await?;

    sqlx::migrate!("../migrations").run(&pool).await?;
    tracing::info!("Database connected and migrations applied");

    // Cluster configuration and core services
    let config_path =
        std::env::var("QUOTAD_CONFIG").unwrap_or_else(|_| "./quotad.yaml".to_string());
    let cluster = Arc::new(ClusterConfig::load(&config_path)?);
    let clock: SharedClock = Arc::new(SystemClock);
    let drivers = Arc::new(DriverRegistry::from_config(&cluster));
    let commitments = Arc::new(CommitmentService::new(
        pool.clone(),
        cluster.clone(),
        clock.clone(),
        drivers,
        Arc::new(LogAuditor),
    ));

    let state = AppState::new(pool, cluster, commitments, clock, registry);

    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("*"))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    // Build router
    let app = Router::new()
        .merge(routes::commitment_routes())
        .merge(routes::report_routes())
        .merge(routes::admin_routes())
        .merge(routes::health_routes())
        .fallback(handlers::route_not_found)
        .layer(middleware::from_fn(request_logger))
        .layer(cors)
        .with_state(state);

    // Start server
    let port: u16 = std::env::var("API_PORT")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn request_logger(
    req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> axum::response::Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let path = req
        .extensions()
        .get::<axum::extract::MatchedPath>()
        .map(|matched| matched.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let start = std::time::Instant::now();

    let response = next.run(req).await;

    let elapsed = start.elapsed();
    let status = response.status().as_u16();

    metrics::HTTP_REQUESTS_TOTAL
        .with_label_values(&[method.as_str(), &path, &status.to_string()])
        .inc();
    metrics::HTTP_REQUEST_DURATION
        .with_label_values(&[method.as_str(), &path])
        .observe(elapsed.as_secs_f64());

    tracing::info!("{method} {uri} {status} {}ms", elapsed.as_millis());

    response
}
