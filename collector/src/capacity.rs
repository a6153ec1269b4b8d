/// Capacity scraper
/// A pool of workers that claim due cluster_capacitors rows and refresh
/// az_resources from the backend's capacity report. Claiming advances
/// next_scrape_at in the same statement, so a row has at most one scrape
/// in flight across all workers and restarts.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use shared::clock::SharedClock;
use shared::config::ClusterConfig;
use shared::errors::{QuotaError, QuotaResult};
use shared::liquid::{CapacityReport, DriverRegistry, ServiceInfo};
use shared::quota;
use sqlx::PgPool;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffTracker;

/// Idle sleep between polls when no row is due.
const IDLE_POLL_SECS: u64 = 5;

/// Read-mostly cache of liquid service info, swapped wholesale when a
/// backend reports a new version.
#[derive(Default)]
pub struct ServiceInfoCache {
    inner: RwLock<HashMap<String, ServiceInfo>>,
}

impl ServiceInfoCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version_of(&self, service_type: &str) -> Option<i64> {
        self.inner
            .read()
            .unwrap()
            .get(service_type)
            .map(|info| info.version)
    }

    pub fn replace(&self, service_type: &str, info: ServiceInfo) {
        self.inner
            .write()
            .unwrap()
            .insert(service_type.to_string(), info);
    }
}

pub struct CapacityScraper {
    pool: PgPool,
    cluster: Arc<ClusterConfig>,
    drivers: Arc<DriverRegistry>,
    clock: SharedClock,
    info_cache: Arc<ServiceInfoCache>,
    scrape_interval_secs: u64,
    backoff: BackoffTracker,
}

#[derive(sqlx::FromRow)]
struct ClaimedCapacitor {
    id: i64,
    capacitor_id: String,
}

impl CapacityScraper {
    pub fn new(
        pool: PgPool,
        cluster: Arc<ClusterConfig>,
        drivers: Arc<DriverRegistry>,
        clock: SharedClock,
        info_cache: Arc<ServiceInfoCache>,
        scrape_interval_secs: u64,
        backoff: BackoffTracker,
    ) -> Self {
        CapacityScraper {
            pool,
            cluster,
            drivers,
            clock,
            info_cache,
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
                    error!(error = %err, "Capacity scrape cycle failed");
                    tokio::time::sleep(Duration::from_secs(IDLE_POLL_SECS)).await;
                }
            }
        }
    }

    /// Claim and process one due capacitor. Returns false when nothing is due.
    async fn scrape_next(&mut self) -> QuotaResult<bool> {
        let now = self.clock.now();
        let claimed: Option<ClaimedCapacitor> = sqlx::query_as(
            r#"
            UPDATE cluster_capacitors
            SET next_scrape_at = $2
            WHERE id = (
                SELECT id FROM cluster_capacitors
                WHERE next_scrape_at <= $1
                ORDER BY next_scrape_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, capacitor_id
            "#,
        )
        .bind(now)
        .bind(now + chrono::Duration::seconds(self.scrape_interval_secs as i64))
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = claimed else {
            return Ok(false);
        };

        let Some(driver) = self.drivers.get(&row.capacitor_id) else {
            // A leftover row for a service that was removed from the config.
            warn!(capacitor = %row.capacitor_id, "No driver for capacitor, skipping");
            return Ok(true);
        };

        let result: Result<CapacityReport, QuotaError> = async {
            self.refresh_service_info(&row.capacitor_id).await?;
            let report = driver
                .get_capacity_report(&self.cluster.availability_zones)
                .await?;
            Ok(report)
        }
        .await;

        match result {
            Ok(report) => {
                self.store_report(&row, &report).await?;
                self.backoff.on_success(row.id);
                info!(
                    capacitor = %row.capacitor_id,
                    resources = report.resources.len(),
                    "Capacity scraped"
                );
            }
            Err(err) if err.is_transient() => {
                let delay = self.backoff.on_failure(row.id, &err.to_string());
                sqlx::query(
                    "UPDATE cluster_capacitors SET scrape_error = $2, next_scrape_at = $3 WHERE id = $1",
                )
                .bind(row.id)
                .bind(err.to_string())
                .bind(self.clock.now() + chrono::Duration::seconds(delay.as_secs() as i64))
                .execute(&self.pool)
                .await?;
            }
            Err(err) => return Err(err),
        }
        Ok(true)
    }

    /// Re-read the backend's service info when its version moved, updating
    /// the resources table and the in-memory cache.
    async fn refresh_service_info(&self, service_type: &str) -> QuotaResult<()> {
        let driver = self
            .drivers
            .get(service_type)
            .ok_or_else(|| QuotaError::Driver(format!("no driver for {}", service_type)))?;
        let info = driver.get_info().await?;

        if self.info_cache.version_of(service_type) == Some(info.version) {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        let stored: Option<(i64, i64)> =
            sqlx::query_as("SELECT id, liquid_version FROM services WHERE type = $1")
                .bind(service_type)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((service_id, stored_version)) = stored else {
            tx.rollback().await?;
            return Err(QuotaError::internal(format!(
                "service {} missing from database",
                service_type
            )));
        };

        if stored_version != info.version {
            debug!(
                service = service_type,
                old = stored_version,
                new = info.version,
                "Liquid version changed, updating resource catalog"
            );
            for (name, resource) in &info.resources {
                sqlx::query(
                    r#"
                    INSERT INTO resources
                        (service_id, name, unit, topology, has_capacity, has_quota, handles_commitments)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    ON CONFLICT (service_id, name) DO UPDATE
                    SET unit = EXCLUDED.unit,
                        topology = EXCLUDED.topology,
                        has_capacity = EXCLUDED.has_capacity,
                        has_quota = EXCLUDED.has_quota,
                        handles_commitments = EXCLUDED.handles_commitments
                    "#,
                )
                .bind(service_id)
                .bind(name)
                .bind(&resource.unit)
                .bind(resource.topology)
                .bind(resource.has_capacity)
                .bind(resource.has_quota)
                .bind(resource.handles_commitments)
                .execute(&mut *tx)
                .await?;
            }
            sqlx::query("UPDATE services SET liquid_version = $2 WHERE id = $1")
                .bind(service_id)
                .bind(info.version)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        self.info_cache.replace(service_type, info);
        Ok(())
    }

    /// Persist one capacity report in a single transaction.
    async fn store_report(
        &self,
        row: &ClaimedCapacitor,
        report: &CapacityReport,
    ) -> QuotaResult<()> {
        let mut tx = self.pool.begin().await?;
        let (service_id,): (i64,) = sqlx::query_as("SELECT id FROM services WHERE type = $1")
            .bind(&row.capacitor_id)
            .fetch_one(&mut *tx)
            .await?;

        for (resource_name, resource_report) in &report.resources {
            let resource: Option<(i64,)> =
                sqlx::query_as("SELECT id FROM resources WHERE service_id = $1 AND name = $2")
                    .bind(service_id)
                    .bind(resource_name)
                    .fetch_optional(&mut *tx)
                    .await?;
            let Some((resource_id,)) = resource else {
                warn!(
                    service = %row.capacitor_id,
                    resource = %resource_name,
                    "Capacity reported for unknown resource, skipping"
                );
                continue;
            };

            for (az, capacity) in &resource_report.per_az {
                sqlx::query(
                    r#"
                    INSERT INTO az_resources (resource_id, az, raw_capacity, usage)
                    VALUES ($1, $2, $3, COALESCE($4, 0))
                    ON CONFLICT (resource_id, az) DO UPDATE
                    SET raw_capacity = EXCLUDED.raw_capacity,
                        usage = COALESCE($4, az_resources.usage)
                    "#,
                )
                .bind(resource_id)
                .bind(az)
                .bind(quota::db_from_u64(capacity.capacity))
                .bind(capacity.usage.map(quota::db_from_u64))
                .execute(&mut *tx)
                .await?;
            }
        }

        sqlx::query("UPDATE cluster_capacitors SET scrape_error = '' WHERE id = $1")
            .bind(row.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!(capacitor = %row.capacitor_id, "Capacity report stored");
        Ok(())
    }
}
