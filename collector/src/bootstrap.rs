/// Startup synchronization
/// Makes the services / resources / cluster_capacitors rows match the
/// cluster configuration so the scrapers have scheduler rows to claim.

use shared::config::ClusterConfig;
use shared::errors::QuotaResult;
use sqlx::PgPool;
use tracing::info;

pub async fn sync_cluster_rows(pool: &PgPool, cluster: &ClusterConfig) -> QuotaResult<()> {
    let mut tx = pool.begin().await?;

    for service in &cluster.services {
        let (service_id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO services (type) VALUES ($1)
            ON CONFLICT (type) DO UPDATE SET type = EXCLUDED.type
            RETURNING id
            "#,
        )
        .bind(&service.service_type)
        .fetch_one(&mut *tx)
        .await?;

        for resource in &service.resources {
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
            .bind(&resource.name)
            .bind(&resource.unit)
            .bind(resource.topology)
            .bind(resource.has_capacity)
            .bind(resource.has_quota)
            .bind(resource.handles_commitments)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO cluster_capacitors (capacitor_id)
            VALUES ($1)
            ON CONFLICT (capacitor_id) DO NOTHING
            "#,
        )
        .bind(&service.service_type)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    info!(
        services = cluster.services.len(),
        "Cluster rows synchronized from configuration"
    );
    Ok(())
}
