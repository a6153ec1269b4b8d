use anyhow::Result;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::Rng;
use shared::config::ClusterConfig;
use shared::models::AZ_ANY;
use shared::quota;
use sqlx::PgPool;
use uuid::Uuid;

const DOMAIN_NAMES: &[&str] = &["germany", "france", "netherlands", "sweden", "poland"];

const PROJECT_NAMES: &[&str] = &[
    "berlin",
    "dresden",
    "hamburg",
    "munich",
    "cologne",
    "frankfurt",
    "stuttgart",
    "leipzig",
    "bremen",
    "hannover",
    "nuremberg",
    "duisburg",
];

const RECIPIENTS: &[&str] = &[
    "ops@cloud.example",
    "platform@cloud.example",
    "infra@cloud.example",
];

/// Mirror the cluster configuration into services / resources /
/// cluster_capacitors, exactly like the collector does at boot.
pub async fn seed_catalog(pool: &PgPool, cluster: &ClusterConfig) -> Result<Vec<(i64, i64, bool)>> {
    let mut resources = Vec::new();
    for service in &cluster.services {
        let (service_id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO services (type) VALUES ($1)
            ON CONFLICT (type) DO UPDATE SET type = EXCLUDED.type
            RETURNING id
            "#,
        )
        .bind(&service.service_type)
        .fetch_one(pool)
        .await?;

        for resource in &service.resources {
            let (resource_id,): (i64,) = sqlx::query_as(
                r#"
                INSERT INTO resources
                    (service_id, name, unit, topology, has_capacity, has_quota, handles_commitments)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (service_id, name) DO UPDATE SET unit = EXCLUDED.unit
                RETURNING id
                "#,
            )
            .bind(service_id)
            .bind(&resource.name)
            .bind(&resource.unit)
            .bind(resource.topology)
            .bind(resource.has_capacity)
            .bind(resource.has_quota)
            .bind(resource.handles_commitments)
            .fetch_one(pool)
            .await?;
            let az_aware = resource.topology == shared::models::ResourceTopology::AzAware;
            resources.push((service_id, resource_id, az_aware));
        }

        sqlx::query(
            "INSERT INTO cluster_capacitors (capacitor_id) VALUES ($1) ON CONFLICT DO NOTHING",
        )
        .bind(&service.service_type)
        .execute(pool)
        .await?;
    }
    Ok(resources)
}

/// Random per-AZ capacities for every resource.
pub async fn seed_capacities(
    pool: &PgPool,
    cluster: &ClusterConfig,
    resources: &[(i64, i64, bool)],
    rng: &mut StdRng,
) -> Result<usize> {
    let mut rows = 0;
    for &(_, resource_id, az_aware) in resources {
        let azs: Vec<&str> = if az_aware {
            cluster.availability_zones.iter().map(String::as_str).collect()
        } else {
            vec![AZ_ANY]
        };
        for az in azs {
            sqlx::query(
                r#"
                INSERT INTO az_resources (resource_id, az, raw_capacity, usage)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (resource_id, az) DO UPDATE
                SET raw_capacity = EXCLUDED.raw_capacity, usage = EXCLUDED.usage
                "#,
            )
            .bind(resource_id)
            .bind(az)
            .bind(rng.gen_range(500..5000i64))
            .bind(rng.gen_range(0..400i64))
            .execute(pool)
            .await?;
            rows += 1;
        }
    }
    Ok(rows)
}

/// Domains and projects with usage rows for every resource.
pub async fn seed_tenants(
    pool: &PgPool,
    cluster: &ClusterConfig,
    resources: &[(i64, i64, bool)],
    domain_count: usize,
    projects_per_domain: usize,
    rng: &mut StdRng,
) -> Result<(usize, usize)> {
    let mut domains = 0;
    let mut projects = 0;

    for domain_name in DOMAIN_NAMES.iter().take(domain_count) {
        let (domain_id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO domains (uuid, name) VALUES ($1, $2)
            ON CONFLICT (uuid) DO UPDATE SET name = EXCLUDED.name
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(domain_name)
        .fetch_one(pool)
        .await?;
        domains += 1;

        let offset = rng.gen_range(0..PROJECT_NAMES.len());
        for i in 0..projects_per_domain {
            let project_name = format!(
                "{}-{}",
                PROJECT_NAMES[(offset + i) % PROJECT_NAMES.len()],
                domain_name
            );
            let recipient = RECIPIENTS[rng.gen_range(0..RECIPIENTS.len())];
            let (project_id,): (i64,) = sqlx::query_as(
                r#"
                INSERT INTO projects (uuid, domain_id, name, recipient)
                VALUES ($1, $2, $3, $4)
                RETURNING id
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(domain_id)
            .bind(&project_name)
            .bind(recipient)
            .fetch_one(pool)
            .await?;
            projects += 1;

            let mut tx = pool.begin().await?;
            for &(service_id, resource_id, az_aware) in resources {
                let azs: Vec<&str> = if az_aware {
                    cluster.availability_zones.iter().map(String::as_str).collect()
                } else {
                    vec![AZ_ANY]
                };
                for az in azs {
                    let cell = quota::ensure_project_az_cell(
                        &mut tx,
                        project_id,
                        service_id,
                        resource_id,
                        az,
                    )
                    .await?;
                    sqlx::query("UPDATE project_az_resources SET usage = $2 WHERE id = $1")
                        .bind(cell)
                        .bind(rng.gen_range(0..50i64))
                        .execute(&mut *tx)
                        .await?;
                }
            }
            tx.commit().await?;
        }
    }
    Ok((domains, projects))
}

/// A few confirmed commitments on commitment-enabled resources.
pub async fn seed_commitments(
    pool: &PgPool,
    cluster: &ClusterConfig,
    rng: &mut StdRng,
    count: usize,
) -> Result<usize> {
    let cells: Vec<(i64, String, String)> = sqlx::query_as(
        r#"
        SELECT par.id, s.type, r.name
        FROM project_az_resources par
        JOIN project_resources pr ON pr.id = par.project_resource_id
        JOIN resources r ON r.id = pr.resource_id
        JOIN services s ON s.id = r.service_id
        ORDER BY par.id
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut created = 0;
    for (cell_id, service_type, resource_name) in cells {
        if created >= count {
            break;
        }
        let Some(resource) = cluster.resource(&service_type, &resource_name) else {
            continue;
        };
        let durations = resource.durations();
        if durations.is_empty() {
            continue;
        }

        let duration = durations[rng.gen_range(0..durations.len())];
        let now = Utc::now();
        let expires_at = duration
            .add_to(now)
            .unwrap_or(now + chrono::Duration::days(365));
        sqlx::query(
            r#"
            INSERT INTO project_commitments
                (uuid, az_resource_id, amount, duration, created_at, creator_uuid,
                 creator_name, confirmed_at, expires_at, status, creation_context)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $5, $8, 'confirmed', $9)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(cell_id)
        .bind(rng.gen_range(1..40i64))
        .bind(duration.to_string())
        .bind(now)
        .bind(Uuid::new_v4())
        .bind("seeder")
        .bind(expires_at)
        .bind(serde_json::json!({"reason": "create"}))
        .execute(pool)
        .await?;
        created += 1;
    }
    Ok(created)
}
