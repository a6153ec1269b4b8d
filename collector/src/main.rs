/// Cluster quota collector
/// Runs the background half of the quota service:
/// - capacity scrapers refreshing per-AZ capacity from liquid backends
/// - usage scrapers refreshing per-project usage and recomputing quotas
/// - the expiry sweeper expiring and confirming commitments
/// - the mail worker draining the notification queue
///
/// All scheduling state lives in the database; workers claim rows with
/// single-statement UPDATE … RETURNING, so any number of collector
/// processes can run side by side.

mod backoff;
mod bootstrap;
mod capacity;
mod config;
mod mailer;
mod sweeper;
mod usage;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use dotenv::dotenv;
use shared::audit::LogAuditor;
use shared::clock::{SharedClock, SystemClock};
use shared::commitment::CommitmentService;
use shared::config::ClusterConfig;
use shared::liquid::DriverRegistry;
use shared::mail::HttpMailClient;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::backoff::BackoffTracker;
use crate::capacity::{CapacityScraper, ServiceInfoCache};
use crate::config::CollectorConfig;
use crate::mailer::MailWorker;
use crate::sweeper::ExpirySweeper;
use crate::usage::UsageScraper;

#[derive(Parser)]
#[command(name = "collector")]
#[command(about = "Background workers for the cluster quota service")]
struct Args {
    /// Overrides the QUOTAD_CONFIG cluster configuration path.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "collector=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stdout))
        .init();

    info!("Cluster quota collector starting...");

    let args = Args::parse();
    let config = CollectorConfig::from_env()?;
    let cluster_config_path = args
        .config
        .unwrap_or_else(|| config.cluster_config_path.clone());
    let cluster = Arc::new(ClusterConfig::load(&cluster_config_path)?);

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.max_connections)
        // Bound every query; a wedged backend must not pin workers forever.
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                use sqlx::Executor;
                conn.execute("SET statement_timeout = '10s'").await?;
                Ok(())
            })
        })
        .connect(&config.database_url)
        .await?;

    bootstrap::sync_cluster_rows(&pool, &cluster).await?;

    let clock: SharedClock = Arc::new(SystemClock);
    let drivers = Arc::new(DriverRegistry::from_config(&cluster));
    let commitments = Arc::new(CommitmentService::new(
        pool.clone(),
        cluster.clone(),
        clock.clone(),
        drivers.clone(),
        Arc::new(LogAuditor),
    ));
    let info_cache = Arc::new(ServiceInfoCache::new());

    let mut handles = Vec::new();

    for _ in 0..config.capacity_workers {
        let scraper = CapacityScraper::new(
            pool.clone(),
            cluster.clone(),
            drivers.clone(),
            clock.clone(),
            info_cache.clone(),
            config.capacity_scrape_interval_secs,
            BackoffTracker::new(
                config.backoff_base_interval_secs,
                config.backoff_max_interval_secs,
            ),
        );
        handles.push(tokio::spawn(scraper.run()));
    }

    for _ in 0..config.usage_workers {
        let scraper = UsageScraper::new(
            pool.clone(),
            cluster.clone(),
            drivers.clone(),
            clock.clone(),
            config.usage_scrape_interval_secs,
            BackoffTracker::new(
                config.backoff_base_interval_secs,
                config.backoff_max_interval_secs,
            ),
        );
        handles.push(tokio::spawn(scraper.run()));
    }

    handles.push(tokio::spawn(
        ExpirySweeper::new(commitments.clone(), config.sweep_interval_secs).run(),
    ));

    match cluster.mail.as_ref().and_then(|m| m.endpoint.clone()) {
        Some(endpoint) => {
            let worker = MailWorker::new(
                pool.clone(),
                Arc::new(HttpMailClient::new(endpoint)),
                clock.clone(),
                config.mail_poll_interval_secs,
                config.mail_max_retries,
            );
            handles.push(tokio::spawn(worker.run()));
        }
        None => warn!("No mail endpoint configured, mail worker disabled"),
    }

    info!(workers = handles.len(), "Collector workers running");

    signal_support::create_shutdown_signal().await;
    info!("Received shutdown signal, stopping workers...");
    for handle in handles {
        handle.abort();
    }
    Ok(())
}

/// Signal handling support
mod signal_support {
    use std::future::Future;

    pub fn create_shutdown_signal() -> impl Future<Output = ()> {
        async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};

                let mut sigterm =
                    signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
                let mut sigint =
                    signal(SignalKind::interrupt()).expect("Failed to register SIGINT handler");

                tokio::select! {
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM");
                    }
                    _ = sigint.recv() => {
                        tracing::info!("Received SIGINT");
                    }
                }
            }

            #[cfg(windows)]
            {
                tokio::signal::ctrl_c()
                    .await
                    .expect("Failed to listen for Ctrl+C");
                tracing::info!("Received Ctrl+C");
            }
        }
    }
}
