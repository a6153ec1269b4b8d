/// Usage scraper
/// Claims due (project, service) rows and refreshes per-AZ usage from the
/// backend's usage report. The success transaction also recomputes target
/// quotas for every resource the report touched, so quota follows usage
/// without a separate pass.

use std::sync::Arc;
use std::time::Duration;

use shared::clock::SharedClock;
use shared::config::ClusterConfig;
use shared::errors::{QuotaError, QuotaResult};
use shared::liquid::{DriverRegistry, UsageReport};
use shared::models::Project;
use shared::quota;
use sqlx::PgPool;
use tracing::{error, info, warn};

use crate::backoff::BackoffTracker;

const IDLE_POLL_SECS: u64 = 5;

pub struct UsageScraper {
    pool: PgPool,
    cluster: Arc<ClusterConfig>,
    drivers: Arc<DriverRegistry>,
    clock: SharedClock,
    scrape_interval_secs: u64,
    backoff: BackoffTracker,
}

#[derive(sqlx::FromRow)]
struct ClaimedProjectService {
    id: i64,
    project_id: i64,
    service_id: i64,
}

impl UsageScraper {
    pub fn new(
        pool: PgPool,
        cluster: Arc<ClusterConfig>,
        drivers: Arc<DriverRegistry>,
        clock: SharedClock,
        scrape_interval_secs: u64,
        backoff: BackoffTracker,
    ) -> Self {
        UsageScraper {
            pool,
            cluster,
            drivers,
            clock,
            scrape_interval_secs,
            backoff,
        }
    }

    pub async fn run(mut self) {
        loop {
            match self.scrape_next().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(Duration::from_secs(IDLE_POLL_SECS)).await,
                Err(err) => {
                    error!(error = %err, "Usage scrape cycle failed");
                    tokio::time::sleep(Duration::from_secs(IDLE_POLL_SECS)).await;
                }
            }
        }
    }

    /// Claim and process one due row; a row is due when its scrape interval
    /// elapsed or a sync request marked it stale.
    async fn scrape_next(&mut self) -> QuotaResult<bool> {
        let now = self.clock.now();
        let claimed: Option<ClaimedProjectService> = sqlx::query_as(
            r#"
            UPDATE project_services
            SET next_scrape_at = $2, stale = FALSE
            WHERE id = (
                SELECT id FROM project_services
                WHERE next_scrape_at <= $1 OR stale
                ORDER BY next_scrape_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, project_id, service_id
            "#,
        )
        .bind(now)
        .bind(now + chrono::Duration::seconds(self.scrape_interval_secs as i64))
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = claimed else {
            return Ok(false);
        };

        let project: Project = sqlx::query_as("SELECT * FROM projects WHERE id = $1")
            .bind(row.project_id)
            .fetch_one(&self.pool)
            .await?;
        let (service_type,): (String,) = sqlx::query_as("SELECT type FROM services WHERE id = $1")
            .bind(row.service_id)
            .fetch_one(&self.pool)
            .await?;

        let Some(driver) = self.drivers.get(&service_type) else {
            warn!(service = %service_type, "No driver for service, skipping usage scrape");
            return Ok(true);
        };

        match driver
            .get_usage_report(project.uuid, &self.cluster.availability_zones)
            .await
        {
            Ok(report) => {
                self.store_report(&row, &service_type, &report).await?;
                self.backoff.on_success(row.id);
                info!(
                    project = %project.name,
                    service = %service_type,
                    resources = report.resources.len(),
                    "Usage scraped"
                );
            }
            Err(err) => {
                let err: QuotaError = err.into();
                let delay = self.backoff.on_failure(row.id, &err.to_string());
                sqlx::query(
                    "UPDATE project_services SET scrape_error = $2, next_scrape_at = $3 WHERE id = $1",
                )
                .bind(row.id)
                .bind(err.to_string())
                .bind(self.clock.now() + chrono::Duration::seconds(delay.as_secs() as i64))
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(true)
    }

    async fn store_report(
        &self,
        row: &ClaimedProjectService,
        service_type: &str,
        report: &UsageReport,
    ) -> QuotaResult<()> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;
        let mut affected: Vec<(i64, f64)> = Vec::new();

        for (resource_name, resource_report) in &report.resources {
            let resource: Option<(i64,)> =
                sqlx::query_as("SELECT id FROM resources WHERE service_id = $1 AND name = $2")
                    .bind(row.service_id)
                    .bind(resource_name)
                    .fetch_optional(&mut *tx)
                    .await?;
            let Some((resource_id,)) = resource else {
                warn!(
                    service = %service_type,
                    resource = %resource_name,
                    "Usage reported for unknown resource, skipping"
                );
                continue;
            };

            for (az, usage) in &resource_report.per_az {
                let cell_id = quota::ensure_project_az_cell(
                    &mut tx,
                    row.project_id,
                    row.service_id,
                    resource_id,
                    az,
                )
                .await?;

                // Without a reported history, track the peak of what we saw.
                sqlx::query(
                    r#"
                    UPDATE project_az_resources
                    SET usage = $2,
                        physical_usage = $3,
                        historical_usage = COALESCE($4, GREATEST(COALESCE(historical_usage, 0), $2))
                    WHERE id = $1
                    "#,
                )
                .bind(cell_id)
                .bind(quota::db_from_u64(usage.usage))
                .bind(usage.physical_usage.map(quota::db_from_u64))
                .bind(usage.historical_usage.map(quota::db_from_u64))
                .execute(&mut *tx)
                .await?;
            }

            let multiplier = self
                .cluster
                .resource(service_type, resource_name)
                .map(|r| r.growth_multiplier())
                .unwrap_or(1.0);
            affected.push((resource_id, multiplier));
        }

        sqlx::query(
            "UPDATE project_services SET scraped_at = $2, scrape_error = '' WHERE id = $1",
        )
        .bind(row.id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for (resource_id, multiplier) in affected {
            quota::recompute_resource_quotas(&mut tx, resource_id, multiplier).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
