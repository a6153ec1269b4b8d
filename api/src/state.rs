use std::sync::Arc;
use std::time::Instant;

use prometheus::Registry;
use shared::clock::SharedClock;
use shared::commitment::CommitmentService;
use shared::config::ClusterConfig;
use sqlx::PgPool;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub cluster: Arc<ClusterConfig>,
    pub commitments: Arc<CommitmentService>,
    pub clock: SharedClock,
    pub registry: Registry,
    pub started_at: Instant,
    /// Caps memory: only one large domain report renders at a time.
    pub report_render_lock: Arc<tokio::sync::Mutex<()>>,
}

impl AppState {
    pub fn new(
        db: PgPool,
        cluster: Arc<ClusterConfig>,
        commitments: Arc<CommitmentService>,
        clock: SharedClock,
        registry: Registry,
    ) -> Self {
        Self {
            db,
            cluster,
            commitments,
            clock,
            registry,
            started_at: Instant::now(),
            report_render_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}
