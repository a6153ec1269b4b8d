/// Report assembler
/// Read-only views over persisted state, consumed by the HTTP surface.
/// The assemble_* functions are pure so the grouping logic tests without a
/// database; the fetch wrappers only gather rows and delegate.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::errors::{QuotaError, QuotaResult};
use crate::models::{
    CommitmentStatus, Domain, Project, ProjectAzResource, ProjectCommitment, ProjectResource,
    ProjectService, Resource, ResourceTopology, Service, TransferStatus,
};
use crate::quota::u64_from_db;

// ═══════════════════════════════════════════════════════════════════════════
// REPORT SHAPES
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize)]
pub struct ProjectReport {
    pub uuid: Uuid,
    pub name: String,
    pub services: Vec<ProjectServiceReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectServiceReport {
    pub service_type: String,
    pub scraped_at: Option<DateTime<Utc>>,
    pub stale: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scrape_error: Option<String>,
    pub resources: Vec<ProjectResourceReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectResourceReport {
    pub name: String,
    pub unit: String,
    pub topology: ResourceTopology,
    pub quota: Option<u64>,
    pub usage: u64,
    pub committed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_quota: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub per_az: Vec<AzReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AzReport {
    pub az: String,
    pub usage: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub physical_usage: Option<u64>,
    pub quota: Option<u64>,
    pub committed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DomainReport {
    pub uuid: Uuid,
    pub name: String,
    pub resources: Vec<DomainResourceReport>,
}

/// Per-resource aggregate across all projects of a domain.
#[derive(Debug, Clone, Serialize)]
pub struct DomainResourceReport {
    pub service_type: String,
    pub name: String,
    pub unit: String,
    pub total_quota: u64,
    pub total_usage: u64,
    pub total_committed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitmentReport {
    pub id: i64,
    pub uuid: Uuid,
    pub service_type: String,
    pub resource_name: String,
    pub availability_zone: String,
    pub amount: u64,
    pub duration: String,
    pub created_at: DateTime<Utc>,
    pub creator_uuid: Uuid,
    pub creator_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirm_by: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub status: CommitmentStatus,
    pub transfer_status: TransferStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_token: Option<String>,
    pub notify_on_confirm: bool,
}

// ═══════════════════════════════════════════════════════════════════════════
// PURE ASSEMBLY
// ═══════════════════════════════════════════════════════════════════════════

/// Everything needed to render one project report.
#[derive(Debug, Clone, Default)]
pub struct ProjectReportRows {
    pub services: Vec<(Service, ProjectService)>,
    pub resources: Vec<(Resource, ProjectResource)>,
    pub az_rows: Vec<ProjectAzResource>,
    /// Confirmed commitment sums keyed by project_az_resources.id.
    pub committed: HashMap<i64, u64>,
}

pub fn assemble_project_report(project: &Project, rows: &ProjectReportRows) -> ProjectReport {
    let mut services = Vec::with_capacity(rows.services.len());
    for (service, project_service) in &rows.services {
        let mut resources = Vec::new();
        for (resource, project_resource) in rows
            .resources
            .iter()
            .filter(|(_, pr)| pr.project_service_id == project_service.id)
        {
            let az_rows: Vec<&ProjectAzResource> = rows
                .az_rows
                .iter()
                .filter(|row| row.project_resource_id == project_resource.id)
                .collect();

            let usage = az_rows.iter().map(|row| u64_from_db(row.usage)).sum();
            let committed = az_rows
                .iter()
                .map(|row| rows.committed.get(&row.id).copied().unwrap_or(0))
                .sum();

            let per_az = match resource.topology {
                ResourceTopology::Flat => Vec::new(),
                ResourceTopology::AzAware => az_rows
                    .iter()
                    .map(|row| AzReport {
                        az: row.az.clone(),
                        usage: u64_from_db(row.usage),
                        physical_usage: row.physical_usage.map(u64_from_db),
                        quota: row.quota.map(u64_from_db),
                        committed: rows.committed.get(&row.id).copied().unwrap_or(0),
                    })
                    .collect(),
            };

            resources.push(ProjectResourceReport {
                name: resource.name.clone(),
                unit: resource.unit.clone(),
                topology: resource.topology,
                quota: project_resource.quota.map(u64_from_db),
                usage,
                committed,
                max_quota: project_resource.max_quota().map(u64_from_db),
                per_az,
            });
        }

        services.push(ProjectServiceReport {
            service_type: service.service_type.clone(),
            scraped_at: project_service.scraped_at,
            stale: project_service.stale,
            scrape_error: if project_service.scrape_error.is_empty() {
                None
            } else {
                Some(project_service.scrape_error.clone())
            },
            resources,
        });
    }

    ProjectReport {
        uuid: project.uuid,
        name: project.name.clone(),
        services,
    }
}

/// Aggregate the already-assembled project reports of one domain.
pub fn assemble_domain_report(domain: &Domain, projects: &[ProjectReport]) -> DomainReport {
    let mut totals: Vec<DomainResourceReport> = Vec::new();
    for project in projects {
        for service in &project.services {
            for resource in &service.resources {
                let position = totals.iter().position(|t| {
                    t.service_type == service.service_type && t.name == resource.name
                });
                let entry = match position {
                    Some(i) => &mut totals[i],
                    None => {
                        totals.push(DomainResourceReport {
                            service_type: service.service_type.clone(),
                            name: resource.name.clone(),
                            unit: resource.unit.clone(),
                            total_quota: 0,
                            total_usage: 0,
                            total_committed: 0,
                        });
                        totals.last_mut().unwrap()
                    }
                };
                entry.total_quota = entry
                    .total_quota
                    .saturating_add(resource.quota.unwrap_or(0));
                entry.total_usage = entry.total_usage.saturating_add(resource.usage);
                entry.total_committed = entry.total_committed.saturating_add(resource.committed);
            }
        }
    }

    DomainReport {
        uuid: domain.uuid,
        name: domain.name.clone(),
        resources: totals,
    }
}

pub fn assemble_commitment_report(
    commitment: &ProjectCommitment,
    service_type: &str,
    resource_name: &str,
    az: &str,
) -> CommitmentReport {
    CommitmentReport {
        id: commitment.id,
        uuid: commitment.uuid,
        service_type: service_type.to_string(),
        resource_name: resource_name.to_string(),
        availability_zone: az.to_string(),
        amount: u64_from_db(commitment.amount),
        duration: commitment.duration.clone(),
        created_at: commitment.created_at,
        creator_uuid: commitment.creator_uuid,
        creator_name: commitment.creator_name.clone(),
        confirm_by: commitment.confirm_by,
        confirmed_at: commitment.confirmed_at,
        expires_at: commitment.expires_at,
        status: commitment.status,
        transfer_status: commitment.transfer_status,
        transfer_token: commitment.transfer_token.clone(),
        notify_on_confirm: commitment.notify_on_confirm,
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// FETCH WRAPPERS
// ═══════════════════════════════════════════════════════════════════════════

/// Path references accept either the entity's UUID or its name.
pub async fn fetch_project(
    pool: &PgPool,
    domain_ref: &str,
    project_ref: &str,
) -> QuotaResult<Project> {
    let project: Option<Project> = sqlx::query_as(
        r#"
        SELECT p.* FROM projects p
        JOIN domains d ON d.id = p.domain_id
        WHERE (d.name = $1 OR CAST(d.uuid AS TEXT) = $1)
          AND (p.name = $2 OR CAST(p.uuid AS TEXT) = $2)
        "#,
    )
    .bind(domain_ref)
    .bind(project_ref)
    .fetch_optional(pool)
    .await?;
    project.ok_or_else(|| {
        QuotaError::not_found(format!("no project {} in domain {}", project_ref, domain_ref))
    })
}

pub async fn fetch_domain(pool: &PgPool, domain_ref: &str) -> QuotaResult<Domain> {
    let domain: Option<Domain> =
        sqlx::query_as("SELECT * FROM domains WHERE name = $1 OR CAST(uuid AS TEXT) = $1")
            .bind(domain_ref)
            .fetch_optional(pool)
            .await?;
    domain.ok_or_else(|| QuotaError::not_found(format!("no such domain: {}", domain_ref)))
}

/// Render one commitment with its service/resource/AZ context.
pub async fn commitment_report_by_id(pool: &PgPool, id: i64) -> QuotaResult<CommitmentReport> {
    let row: Option<CommitmentListRow> = sqlx::query_as(
        r#"
        SELECT c.*, s.type AS service_type, r.name AS resource_name, par.az
        FROM project_commitments c
        JOIN project_az_resources par ON par.id = c.az_resource_id
        JOIN project_resources pr ON pr.id = par.project_resource_id
        JOIN resources r ON r.id = pr.resource_id
        JOIN services s ON s.id = r.service_id
        WHERE c.id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    let row = row.ok_or_else(|| QuotaError::not_found(format!("no commitment with ID {}", id)))?;
    Ok(assemble_commitment_report(
        &row.commitment,
        &row.service_type,
        &row.resource_name,
        &row.az,
    ))
}

async fn fetch_project_rows(pool: &PgPool, project_id: i64) -> QuotaResult<ProjectReportRows> {
    let service_pairs: Vec<(i64, i64)> = sqlx::query_as(
        "SELECT id, service_id FROM project_services WHERE project_id = $1 ORDER BY id",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;

    let mut rows = ProjectReportRows::default();
    for (ps_id, service_id) in &service_pairs {
        let service: Service = sqlx::query_as("SELECT * FROM services WHERE id = $1")
            .bind(service_id)
            .fetch_one(pool)
            .await?;
        let project_service: ProjectService =
            sqlx::query_as("SELECT * FROM project_services WHERE id = $1")
                .bind(ps_id)
                .fetch_one(pool)
                .await?;
        rows.services.push((service, project_service));
    }

    let resource_rows: Vec<ProjectResource> = sqlx::query_as(
        r#"
        SELECT pr.* FROM project_resources pr
        JOIN project_services ps ON ps.id = pr.project_service_id
        WHERE ps.project_id = $1
        ORDER BY pr.id
        "#,
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;
    for project_resource in resource_rows {
        let resource: Resource = sqlx::query_as("SELECT * FROM resources WHERE id = $1")
            .bind(project_resource.resource_id)
            .fetch_one(pool)
            .await?;
        rows.resources.push((resource, project_resource));
    }

    rows.az_rows = sqlx::query_as(
        r#"
        SELECT par.* FROM project_az_resources par
        JOIN project_resources pr ON pr.id = par.project_resource_id
        JOIN project_services ps ON ps.id = pr.project_service_id
        WHERE ps.project_id = $1
        ORDER BY par.id
        "#,
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;

    let committed: Vec<(i64, i64)> = sqlx::query_as(
        r#"
        SELECT c.az_resource_id, SUM(c.amount)::BIGINT
        FROM project_commitments c
        JOIN project_az_resources par ON par.id = c.az_resource_id
        JOIN project_resources pr ON pr.id = par.project_resource_id
        JOIN project_services ps ON ps.id = pr.project_service_id
        WHERE ps.project_id = $1 AND c.status = 'confirmed'
        GROUP BY c.az_resource_id
        "#,
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;
    rows.committed = committed
        .into_iter()
        .map(|(id, sum)| (id, u64_from_db(sum)))
        .collect();

    Ok(rows)
}

pub async fn project_report(pool: &PgPool, project: &Project) -> QuotaResult<ProjectReport> {
    let rows = fetch_project_rows(pool, project.id).await?;
    Ok(assemble_project_report(project, &rows))
}

pub async fn domain_report(pool: &PgPool, domain: &Domain) -> QuotaResult<DomainReport> {
    let projects: Vec<Project> =
        sqlx::query_as("SELECT * FROM projects WHERE domain_id = $1 ORDER BY name")
            .bind(domain.id)
            .fetch_all(pool)
            .await?;

    let mut reports = Vec::with_capacity(projects.len());
    for project in &projects {
        reports.push(project_report(pool, project).await?);
    }
    Ok(assemble_domain_report(domain, &reports))
}

#[derive(Debug, Clone, Default)]
pub struct CommitmentFilter {
    pub service_type: Option<String>,
    pub resource_name: Option<String>,
    pub include_inactive: bool,
}

#[derive(sqlx::FromRow)]
struct CommitmentListRow {
    #[sqlx(flatten)]
    commitment: ProjectCommitment,
    service_type: String,
    resource_name: String,
    az: String,
}

pub async fn list_commitments(
    pool: &PgPool,
    project_id: i64,
    filter: &CommitmentFilter,
) -> QuotaResult<Vec<CommitmentReport>> {
    let rows: Vec<CommitmentListRow> = sqlx::query_as(
        r#"
        SELECT c.*, s.type AS service_type, r.name AS resource_name, par.az
        FROM project_commitments c
        JOIN project_az_resources par ON par.id = c.az_resource_id
        JOIN project_resources pr ON pr.id = par.project_resource_id
        JOIN project_services ps ON ps.id = pr.project_service_id
        JOIN resources r ON r.id = pr.resource_id
        JOIN services s ON s.id = r.service_id
        WHERE ps.project_id = $1
          AND ($2::TEXT IS NULL OR s.type = $2)
          AND ($3::TEXT IS NULL OR r.name = $3)
          AND ($4::BOOLEAN OR c.status IN ('planned', 'pending', 'confirmed'))
        ORDER BY c.id
        "#,
    )
    .bind(project_id)
    .bind(filter.service_type.as_deref())
    .bind(filter.resource_name.as_deref())
    .bind(filter.include_inactive)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            assemble_commitment_report(
                &row.commitment,
                &row.service_type,
                &row.resource_name,
                &row.az,
            )
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(id: i64, service_type: &str) -> Service {
        Service {
            id,
            service_type: service_type.into(),
            liquid_version: 1,
        }
    }

    fn project_service(id: i64, service_id: i64, scrape_error: &str) -> ProjectService {
        ProjectService {
            id,
            project_id: 1,
            service_id,
            scraped_at: None,
            next_scrape_at: Utc::now(),
            stale: false,
            scrape_error: scrape_error.into(),
        }
    }

    fn resource(id: i64, service_id: i64, name: &str, topology: ResourceTopology) -> Resource {
        Resource {
            id,
            service_id,
            name: name.into(),
            unit: String::new(),
            topology,
            has_capacity: true,
            has_quota: true,
            handles_commitments: false,
        }
    }

    fn project_resource(id: i64, ps_id: i64, resource_id: i64, quota: Option<i64>) -> ProjectResource {
        ProjectResource {
            id,
            project_service_id: ps_id,
            resource_id,
            quota,
            max_quota_from_local_admin: None,
            max_quota_from_outside_admin: None,
            forbidden: false,
        }
    }

    fn az_row(id: i64, pr_id: i64, az: &str, usage: i64) -> ProjectAzResource {
        ProjectAzResource {
            id,
            project_resource_id: pr_id,
            az: az.into(),
            usage,
            physical_usage: None,
            historical_usage: None,
            quota: None,
        }
    }

    fn berlin() -> Project {
        Project {
            id: 1,
            uuid: Uuid::from_bytes([3; 16]),
            domain_id: 1,
            name: "berlin".into(),
            recipient: None,
        }
    }

    fn sample_rows() -> ProjectReportRows {
        let mut rows = ProjectReportRows {
            services: vec![(service(1, "compute"), project_service(10, 1, ""))],
            resources: vec![(
                resource(100, 1, "cores", ResourceTopology::AzAware),
                project_resource(200, 10, 100, Some(40)),
            )],
            az_rows: vec![
                az_row(300, 200, "az-one", 12),
                az_row(301, 200, "az-two", 8),
            ],
            committed: HashMap::new(),
        };
        rows.committed.insert(300, 25);
        rows
    }

    #[test]
    fn test_project_report_sums_azs() {
        let report = assemble_project_report(&berlin(), &sample_rows());
        assert_eq!(report.services.len(), 1);
        let resource = &report.services[0].resources[0];
        assert_eq!(resource.usage, 20);
        assert_eq!(resource.committed, 25);
        assert_eq!(resource.quota, Some(40));
        assert_eq!(resource.per_az.len(), 2);
        assert_eq!(resource.per_az[0].committed, 25);
        assert_eq!(resource.per_az[1].committed, 0);
    }

    #[test]
    fn test_flat_resources_omit_az_breakdown() {
        let mut rows = sample_rows();
        rows.resources[0].0.topology = ResourceTopology::Flat;
        let report = assemble_project_report(&berlin(), &rows);
        assert!(report.services[0].resources[0].per_az.is_empty());
        // The totals still include every AZ row.
        assert_eq!(report.services[0].resources[0].usage, 20);
    }

    #[test]
    fn test_scrape_error_surfaces_only_when_set() {
        let mut rows = sample_rows();
        let report = assemble_project_report(&berlin(), &rows);
        assert!(report.services[0].scrape_error.is_none());

        rows.services[0].1.scrape_error = "liquid unreachable".into();
        let report = assemble_project_report(&berlin(), &rows);
        assert_eq!(
            report.services[0].scrape_error.as_deref(),
            Some("liquid unreachable")
        );
    }

    #[test]
    fn test_domain_report_aggregates_projects() {
        let domain = Domain {
            id: 1,
            uuid: Uuid::from_bytes([9; 16]),
            name: "germany".into(),
        };
        let a = assemble_project_report(&berlin(), &sample_rows());
        let mut dresden_rows = sample_rows();
        dresden_rows.az_rows[0].usage = 5;
        dresden_rows.committed.insert(300, 7);
        let mut dresden = berlin();
        dresden.name = "dresden".into();
        let b = assemble_project_report(&dresden, &dresden_rows);

        let report = assemble_domain_report(&domain, &[a, b]);
        assert_eq!(report.resources.len(), 1);
        assert_eq!(report.resources[0].total_usage, 20 + 13);
        assert_eq!(report.resources[0].total_committed, 25 + 7);
        assert_eq!(report.resources[0].total_quota, 80);
    }
}
