/// Commitment engine
/// The full commitment lifecycle: creation with immediate or delayed
/// confirmation, deletion, split/merge/convert arithmetic, duration updates,
/// renewal, the transfer protocol, and the sweeper entry points. Every
/// operation runs in a single database transaction; the pure planning
/// helpers at the top carry the arithmetic so it stays testable without a
/// database.

use std::sync::Arc;

use chrono::{DateTime, Duration, Months, Utc};
use rand::RngCore;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, Auditor, CommitmentAction};
use crate::clock::SharedClock;
use crate::config::{ClusterConfig, ResourceConfig};
use crate::duration::CommitmentDuration;
use crate::errors::{QuotaError, QuotaResult};
use crate::liquid::{
    CommitmentChangeEntry, CommitmentChangeRequest, DriverRegistry, ProjectCommitmentChangeset,
    ResourceCommitmentChangeset,
};
use crate::mail;
use crate::models::{
    CommitmentContext, CommitmentReason, CommitmentStatus, Project, ProjectCommitment,
    TransferStatus, AZ_ANY,
};
use crate::quota;

/// Creators may delete their own fresh commitments inside this window;
/// afterwards deletion needs the elevated uncommit permission.
pub const DELETE_GRACE_HOURS: i64 = 24;

/// Renewal opens at most this far before expiry.
pub const RENEWAL_HORIZON_MONTHS: u32 = 3;

// ═══════════════════════════════════════════════════════════════════════════
// REQUEST TYPES
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub service_type: String,
    pub resource_name: String,
    pub availability_zone: String,
    pub amount: u64,
    pub duration: CommitmentDuration,
    pub confirm_by: Option<DateTime<Utc>>,
    pub notify_on_confirm: bool,
}

/// The acting user, as resolved by the policy layer.
#[derive(Debug, Clone)]
pub struct Principal {
    pub uuid: Uuid,
    pub name: String,
}

// ═══════════════════════════════════════════════════════════════════════════
// PURE PLANNING HELPERS
// ═══════════════════════════════════════════════════════════════════════════

/// 24 random bytes as 48 lowercase hex characters.
pub fn mint_transfer_token() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}

/// Reduced conversion rate between two weighted resources:
/// `from` source units become `to` target units.
pub fn conversion_rate(source_weight: u64, target_weight: u64) -> (u64, u64) {
    let g = gcd(source_weight, target_weight);
    (source_weight / g, target_weight / g)
}

pub fn check_conversion_amounts(
    source_amount: u64,
    target_amount: u64,
    from: u64,
    to: u64,
) -> QuotaResult<()> {
    if source_amount == 0 {
        return Err(QuotaError::invalid("conversion amount must be positive"));
    }
    if source_amount % from != 0 {
        return Err(QuotaError::conflict(format!(
            "amount {} does not fit into conversion rate {}",
            source_amount, from
        )));
    }
    let expected = (source_amount / from).checked_mul(to).ok_or_else(|| {
        QuotaError::Overflow("converted amount exceeds u64".into())
    })?;
    if target_amount != expected {
        return Err(QuotaError::conflict(format!(
            "expected target amount {} for source amount {}, got {}",
            expected, source_amount, target_amount
        )));
    }
    Ok(())
}

pub fn split_amounts(total: u64, carve: u64) -> QuotaResult<(u64, u64)> {
    if carve == 0 {
        return Err(QuotaError::invalid("split amount must be positive"));
    }
    if carve >= total {
        return Err(QuotaError::invalid(format!(
            "split amount {} must be smaller than the commitment amount {}",
            carve, total
        )));
    }
    Ok((carve, total - carve))
}

/// Field values for a commitment row about to be inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitmentValues {
    pub az_resource_id: i64,
    pub amount: u64,
    pub duration: String,
    pub created_at: DateTime<Utc>,
    pub creator_uuid: Uuid,
    pub creator_name: String,
    pub confirm_by: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub status: CommitmentStatus,
    pub notify_on_confirm: bool,
}

impl From<&ProjectCommitment> for CommitmentValues {
    fn from(c: &ProjectCommitment) -> Self {
        CommitmentValues {
            az_resource_id: c.az_resource_id,
            amount: quota::u64_from_db(c.amount),
            duration: c.duration.clone(),
            created_at: c.created_at,
            creator_uuid: c.creator_uuid,
            creator_name: c.creator_name.clone(),
            confirm_by: c.confirm_by,
            confirmed_at: c.confirmed_at,
            expires_at: c.expires_at,
            status: c.status,
            notify_on_confirm: c.notify_on_confirm,
        }
    }
}

/// Plan the two successors of a split. Everything but the amount is
/// inherited unchanged.
pub fn split_values(
    predecessor: &ProjectCommitment,
    carve: u64,
) -> QuotaResult<(CommitmentValues, CommitmentValues)> {
    if predecessor.status.is_terminal() {
        return Err(QuotaError::conflict(format!(
            "commitment {} is {}",
            predecessor.uuid, predecessor.status
        )));
    }
    let (first, second) = split_amounts(quota::u64_from_db(predecessor.amount), carve)?;
    let mut a = CommitmentValues::from(predecessor);
    let mut b = CommitmentValues::from(predecessor);
    a.amount = first;
    b.amount = second;
    Ok((a, b))
}

/// Plan the single successor of a merge: summed amount, the latest expiry
/// and that commitment's duration. All parts must be confirmed and sit on
/// the same (project, resource, AZ) cell.
pub fn merge_values(parts: &[ProjectCommitment]) -> QuotaResult<CommitmentValues> {
    if parts.len() < 2 {
        return Err(QuotaError::invalid(
            "merging requires at least two commitments",
        ));
    }
    let cell = parts[0].az_resource_id;
    if parts.iter().any(|p| p.az_resource_id != cell) {
        return Err(QuotaError::conflict(
            "all merged commitments must be on the same resource and availability zone",
        ));
    }
    if parts
        .iter()
        .any(|p| p.status != CommitmentStatus::Confirmed)
    {
        return Err(QuotaError::conflict(
            "only confirmed commitments can be merged",
        ));
    }

    let mut amount: u64 = 0;
    for part in parts {
        amount = amount
            .checked_add(quota::u64_from_db(part.amount))
            .ok_or_else(|| QuotaError::Overflow("merged amount exceeds u64".into()))?;
    }

    let latest = parts
        .iter()
        .max_by_key(|p| p.expires_at)
        .expect("parts is non-empty");

    let mut values = CommitmentValues::from(latest);
    values.amount = amount;
    values.created_at = parts.iter().map(|p| p.created_at).min().unwrap();
    values.confirmed_at = parts.iter().filter_map(|p| p.confirmed_at).min();
    Ok(values)
}

/// Whether deleting this commitment needs the elevated uncommit permission
/// even for its creator.
pub fn delete_requires_elevation(commitment: &ProjectCommitment, now: DateTime<Utc>) -> bool {
    !(commitment.status.is_active()
        && commitment.creation_reason() == CommitmentReason::Create
        && now <= commitment.created_at + Duration::hours(DELETE_GRACE_HOURS))
}

pub fn validate_renewal(commitment: &ProjectCommitment, now: DateTime<Utc>) -> QuotaResult<()> {
    if commitment.status.is_terminal() || commitment.expires_at <= now {
        return Err(QuotaError::conflict(format!(
            "commitment {} can no longer be renewed",
            commitment.uuid
        )));
    }
    let horizon = now
        .checked_add_months(Months::new(RENEWAL_HORIZON_MONTHS))
        .ok_or_else(|| QuotaError::internal("renewal horizon overflows calendar"))?;
    if commitment.expires_at > horizon {
        return Err(QuotaError::conflict(format!(
            "commitment {} expires more than {} months from now",
            commitment.uuid, RENEWAL_HORIZON_MONTHS
        )));
    }
    Ok(())
}

pub fn validate_create(
    resource: &ResourceConfig,
    cluster_azs: &[String],
    req: &CreateRequest,
    now: DateTime<Utc>,
) -> QuotaResult<()> {
    if !resource.accepts_commitments() {
        return Err(QuotaError::invalid(format!(
            "resource {}/{} does not accept commitments",
            req.service_type, req.resource_name
        )));
    }
    if req.amount == 0 {
        return Err(QuotaError::invalid("amount must be positive"));
    }
    match resource.topology {
        crate::models::ResourceTopology::Flat => {
            if req.availability_zone != AZ_ANY {
                return Err(QuotaError::invalid(format!(
                    "resource {}/{} is not AZ-aware; use availability zone {:?}",
                    req.service_type, req.resource_name, AZ_ANY
                )));
            }
        }
        crate::models::ResourceTopology::AzAware => {
            if !cluster_azs.iter().any(|az| az == &req.availability_zone) {
                return Err(QuotaError::invalid(format!(
                    "unknown availability zone: {}",
                    req.availability_zone
                )));
            }
        }
    }
    if !resource.durations().contains(&req.duration) {
        return Err(QuotaError::invalid(format!(
            "unacceptable commitment duration for this resource, acceptable values: {}",
            resource
                .durations()
                .iter()
                .map(|d| format!("{:?}", d.to_string()))
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }
    match req.confirm_by {
        None => {
            // There is no later confirmation event to notify about.
            if req.notify_on_confirm {
                return Err(QuotaError::conflict(
                    "notify_on_confirm is not allowed for commitments that confirm immediately",
                ));
            }
        }
        Some(confirm_by) => {
            let earliest = resource
                .min_confirm_date()
                .map_or(now, |min| min.max(now));
            if confirm_by < earliest {
                return Err(QuotaError::invalid(format!(
                    "confirm_by must not be earlier than {}",
                    earliest.to_rfc3339()
                )));
            }
        }
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// SERVICE
// ═══════════════════════════════════════════════════════════════════════════

pub struct CommitmentService {
    pool: PgPool,
    config: Arc<ClusterConfig>,
    clock: SharedClock,
    drivers: Arc<DriverRegistry>,
    auditor: Arc<dyn Auditor>,
}

/// Where a commitment lives: the full join from its capacity cell up to the
/// owning project and backend service.
#[derive(Debug, Clone, sqlx::FromRow)]
struct CommitmentLocation {
    service_type: String,
    liquid_version: i64,
    resource_id: i64,
    resource_name: String,
    unit: String,
    has_capacity: bool,
    handles_commitments: bool,
    az: String,
    #[allow(dead_code)]
    az_resource_id: i64,
    project_id: i64,
    project_uuid: Uuid,
    project_name: String,
}

const LOCATION_SQL: &str = r#"
    SELECT s.type AS service_type, s.liquid_version,
           r.id AS resource_id, r.name AS resource_name, r.unit,
           r.has_capacity, r.handles_commitments,
           par.az, par.id AS az_resource_id,
           ps.project_id, p.uuid AS project_uuid, p.name AS project_name
    FROM project_az_resources par
    JOIN project_resources pr ON pr.id = par.project_resource_id
    JOIN project_services ps ON ps.id = pr.project_service_id
    JOIN projects p ON p.id = ps.project_id
    JOIN resources r ON r.id = pr.resource_id
    JOIN services s ON s.id = r.service_id
    WHERE par.id = $1
"#;

const COMMITMENT_IN_PROJECT_SQL: &str = r#"
    SELECT c.* FROM project_commitments c
    JOIN project_az_resources par ON par.id = c.az_resource_id
    JOIN project_resources pr ON pr.id = par.project_resource_id
    JOIN project_services ps ON ps.id = pr.project_service_id
    WHERE c.id = $1 AND ps.project_id = $2
"#;

impl CommitmentService {
    pub fn new(
        pool: PgPool,
        config: Arc<ClusterConfig>,
        clock: SharedClock,
        drivers: Arc<DriverRegistry>,
        auditor: Arc<dyn Auditor>,
    ) -> Self {
        CommitmentService {
            pool,
            config,
            clock,
            drivers,
            auditor,
        }
    }

    fn resource_config(&self, service_type: &str, name: &str) -> QuotaResult<&ResourceConfig> {
        self.config.resource(service_type, name).ok_or_else(|| {
            QuotaError::invalid(format!("no such resource: {}/{}", service_type, name))
        })
    }

    fn growth_multiplier(&self, service_type: &str, name: &str) -> f64 {
        self.config
            .resource(service_type, name)
            .map(|r| r.growth_multiplier())
            .unwrap_or(1.0)
    }

    async fn location(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        az_resource_id: i64,
    ) -> QuotaResult<CommitmentLocation> {
        let location: Option<CommitmentLocation> = sqlx::query_as(LOCATION_SQL)
            .bind(az_resource_id)
            .fetch_optional(&mut **tx)
            .await?;
        location.ok_or_else(|| {
            QuotaError::internal(format!("dangling az_resource_id: {}", az_resource_id))
        })
    }

    async fn fetch_for_project(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: i64,
        project_id: i64,
    ) -> QuotaResult<ProjectCommitment> {
        let commitment: Option<ProjectCommitment> = sqlx::query_as(COMMITMENT_IN_PROJECT_SQL)
            .bind(id)
            .bind(project_id)
            .fetch_optional(&mut **tx)
            .await?;
        commitment
            .ok_or_else(|| QuotaError::not_found(format!("no commitment with ID {}", id)))
    }

    async fn confirmed_sum(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        az_resource_id: i64,
    ) -> QuotaResult<u64> {
        let (sum,): (Option<i64>,) = sqlx::query_as(
            "SELECT SUM(amount)::BIGINT FROM project_commitments
             WHERE az_resource_id = $1 AND status = 'confirmed'",
        )
        .bind(az_resource_id)
        .fetch_one(&mut **tx)
        .await?;
        Ok(quota::u64_from_db(sum.unwrap_or(0)))
    }

    /// Ask the backend for its verdict when the resource delegates
    /// commitment approval. Rejection maps to `CapacityExceeded`.
    async fn driver_veto(
        &self,
        location: &CommitmentLocation,
        changesets: Vec<(Uuid, ResourceCommitmentChangeset)>,
        dry_run: bool,
    ) -> QuotaResult<()> {
        if !location.handles_commitments {
            return Ok(());
        }
        let driver = self.drivers.get(&location.service_type).ok_or_else(|| {
            QuotaError::Driver(format!(
                "no driver registered for service {}",
                location.service_type
            ))
        })?;

        let mut by_project = std::collections::HashMap::new();
        for (project_uuid, changeset) in changesets {
            let entry: &mut ProjectCommitmentChangeset =
                by_project.entry(project_uuid).or_default();
            entry
                .by_resource
                .insert(location.resource_name.clone(), changeset);
        }

        let request = CommitmentChangeRequest {
            az: location.az.clone(),
            info_version: location.liquid_version,
            by_project,
            dry_run,
        };
        let response = driver.change_commitments(&request).await?;
        if !response.accepted {
            return Err(QuotaError::CapacityExceeded(
                response
                    .reason
                    .unwrap_or_else(|| "backend rejected the commitment change".into()),
            ));
        }
        Ok(())
    }

    async fn insert_commitment(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        values: &CommitmentValues,
        predecessor_id: Option<i64>,
        context: &CommitmentContext,
    ) -> QuotaResult<ProjectCommitment> {
        let row: ProjectCommitment = sqlx::query_as(
            r#"
            INSERT INTO project_commitments
                (uuid, az_resource_id, amount, duration, created_at,
                 creator_uuid, creator_name, confirm_by, confirmed_at,
                 expires_at, status, predecessor_id, creation_context,
                 notify_on_confirm)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(values.az_resource_id)
        .bind(quota::db_from_u64(values.amount))
        .bind(&values.duration)
        .bind(values.created_at)
        .bind(values.creator_uuid)
        .bind(&values.creator_name)
        .bind(values.confirm_by)
        .bind(values.confirmed_at)
        .bind(values.expires_at)
        .bind(values.status)
        .bind(predecessor_id)
        .bind(serde_json::to_value(context)?)
        .bind(values.notify_on_confirm)
        .fetch_one(&mut **tx)
        .await?;
        Ok(row)
    }

    /// Terminal transition into `superseded`; clears any transfer listing
    /// because tokens are single-use.
    async fn mark_superseded(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: i64,
        context: &CommitmentContext,
    ) -> QuotaResult<()> {
        sqlx::query(
            r#"
            UPDATE project_commitments
            SET status = 'superseded', supersede_context = $2,
                transfer_status = 'none', transfer_token = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(serde_json::to_value(context)?)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn recompute_quotas(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        location: &CommitmentLocation,
    ) -> QuotaResult<()> {
        quota::recompute_resource_quotas(
            tx,
            location.resource_id,
            self.growth_multiplier(&location.service_type, &location.resource_name),
        )
        .await
    }

    fn audit(
        &self,
        action: CommitmentAction,
        principal: &Principal,
        project_uuid: Uuid,
        commitment: &ProjectCommitment,
    ) {
        self.auditor.record(AuditEvent::for_commitment(
            action,
            self.clock.now(),
            principal.uuid,
            &principal.name,
            project_uuid,
            commitment,
        ));
    }

    // ── Operations ──────────────────────────────────────────────────────

    /// Dry run: would a commitment of this shape confirm right now?
    pub async fn can_confirm(&self, project: &Project, req: &CreateRequest) -> QuotaResult<bool> {
        let resource = self.resource_config(&req.service_type, &req.resource_name)?;
        let now = self.clock.now();

        if let Some(min) = resource.min_confirm_date() {
            if min > now {
                return Ok(false);
            }
        }
        let probe = CreateRequest {
            confirm_by: None,
            notify_on_confirm: false,
            ..req.clone()
        };
        validate_create(resource, &self.config.availability_zones, &probe, now)?;

        let mut tx = self.pool.begin().await?;
        let row = self
            .lookup_resource_row(&mut tx, &req.service_type, &req.resource_name)
            .await?;
        let par_id = quota::ensure_project_az_cell(
            &mut tx,
            project.id,
            row.service_id,
            row.resource_id,
            &req.availability_zone,
        )
        .await?;

        let decision = if row.handles_commitments {
            let location = self.location(&mut tx, par_id).await?;
            let before = self.confirmed_sum(&mut tx, par_id).await?;
            let entry = CommitmentChangeEntry {
                uuid: Uuid::new_v4(),
                old_status: None,
                new_status: Some(CommitmentStatus::Confirmed),
                amount: req.amount,
                confirm_by: None,
                expires_at: req
                    .duration
                    .add_to(now)
                    .ok_or_else(|| QuotaError::invalid("duration overflows the calendar"))?,
                old_expires_at: None,
            };
            let changeset = ResourceCommitmentChangeset {
                total_confirmed_before: before,
                total_confirmed_after: before.saturating_add(req.amount),
                commitments: vec![entry],
            };
            self.driver_veto(&location, vec![(project.uuid, changeset)], true)
                .await
        } else {
            let input = quota::fetch_capacity_check_input(
                &mut tx,
                row.resource_id,
                &req.availability_zone,
                row.has_capacity,
            )
            .await?;
            quota::check_commitment_delta(&input, par_id, req.amount)
        };
        tx.rollback().await?;

        match decision {
            Ok(()) => Ok(true),
            Err(QuotaError::CapacityExceeded(_)) => Ok(false),
            Err(other) => Err(other),
        }
    }

    pub async fn create(
        &self,
        project: &Project,
        principal: &Principal,
        req: CreateRequest,
    ) -> QuotaResult<ProjectCommitment> {
        let resource = self.resource_config(&req.service_type, &req.resource_name)?;
        let now = self.clock.now();
        validate_create(resource, &self.config.availability_zones, &req, now)?;

        let mut tx = self.pool.begin().await?;
        let row = self
            .lookup_resource_row(&mut tx, &req.service_type, &req.resource_name)
            .await?;
        let par_id = quota::ensure_project_az_cell(
            &mut tx,
            project.id,
            row.service_id,
            row.resource_id,
            &req.availability_zone,
        )
        .await?;

        let anchor = req.confirm_by.unwrap_or(now);
        let expires_at = req
            .duration
            .add_to(anchor)
            .ok_or_else(|| QuotaError::invalid("duration overflows the calendar"))?;
        if expires_at <= now {
            return Err(QuotaError::invalid("commitment would expire immediately"));
        }

        let (status, confirmed_at) = match req.confirm_by {
            None => {
                let input = quota::fetch_capacity_check_input(
                    &mut tx,
                    row.resource_id,
                    &req.availability_zone,
                    row.has_capacity,
                )
                .await?;
                quota::check_commitment_delta(&input, par_id, req.amount)?;
                (CommitmentStatus::Confirmed, Some(now))
            }
            Some(_) => (CommitmentStatus::Planned, None),
        };

        let location = self.location(&mut tx, par_id).await?;
        let before = self.confirmed_sum(&mut tx, par_id).await?;
        let after = if status == CommitmentStatus::Confirmed {
            before.saturating_add(req.amount)
        } else {
            before
        };
        self.driver_veto(
            &location,
            vec![(
                project.uuid,
                ResourceCommitmentChangeset {
                    total_confirmed_before: before,
                    total_confirmed_after: after,
                    commitments: vec![CommitmentChangeEntry {
                        uuid: Uuid::new_v4(),
                        old_status: None,
                        new_status: Some(status),
                        amount: req.amount,
                        confirm_by: req.confirm_by,
                        expires_at,
                        old_expires_at: None,
                    }],
                },
            )],
            false,
        )
        .await?;

        let values = CommitmentValues {
            az_resource_id: par_id,
            amount: req.amount,
            duration: req.duration.to_string(),
            created_at: now,
            creator_uuid: principal.uuid,
            creator_name: principal.name.clone(),
            confirm_by: req.confirm_by,
            confirmed_at,
            expires_at,
            status,
            notify_on_confirm: req.notify_on_confirm,
        };
        let context = CommitmentContext::new(CommitmentReason::Create);
        let commitment = self.insert_commitment(&mut tx, &values, None, &context).await?;

        if status == CommitmentStatus::Confirmed {
            self.recompute_quotas(&mut tx, &location).await?;
        }
        tx.commit().await?;

        info!(
            project = %project.name,
            service = %req.service_type,
            resource = %req.resource_name,
            az = %req.availability_zone,
            amount = req.amount,
            status = %status,
            "Commitment created"
        );
        self.audit(CommitmentAction::Create, principal, project.uuid, &commitment);
        Ok(commitment)
    }

    pub async fn delete(
        &self,
        project: &Project,
        principal: &Principal,
        id: i64,
        has_uncommit_permission: bool,
    ) -> QuotaResult<()> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;
        let commitment = self.fetch_for_project(&mut tx, id, project.id).await?;

        let creator_within_grace = !delete_requires_elevation(&commitment, now)
            && principal.uuid == commitment.creator_uuid;
        if !creator_within_grace && !has_uncommit_permission {
            return Err(QuotaError::forbidden(
                "deleting this commitment requires the uncommit permission",
            ));
        }

        let location = self.location(&mut tx, commitment.az_resource_id).await?;
        let before = self.confirmed_sum(&mut tx, commitment.az_resource_id).await?;
        let amount = quota::u64_from_db(commitment.amount);
        let after = if commitment.counts_toward_capacity() {
            before.saturating_sub(amount)
        } else {
            before
        };
        self.driver_veto(
            &location,
            vec![(
                project.uuid,
                ResourceCommitmentChangeset {
                    total_confirmed_before: before,
                    total_confirmed_after: after,
                    commitments: vec![CommitmentChangeEntry {
                        uuid: commitment.uuid,
                        old_status: Some(commitment.status),
                        new_status: None,
                        amount,
                        confirm_by: commitment.confirm_by,
                        expires_at: commitment.expires_at,
                        old_expires_at: None,
                    }],
                },
            )],
            false,
        )
        .await?;

        sqlx::query("DELETE FROM project_commitments WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        if commitment.counts_toward_capacity() {
            self.recompute_quotas(&mut tx, &location).await?;
        }
        tx.commit().await?;

        info!(project = %project.name, commitment = %commitment.uuid, "Commitment deleted");
        self.audit(CommitmentAction::Delete, principal, project.uuid, &commitment);
        Ok(())
    }

    pub async fn split(
        &self,
        project: &Project,
        principal: &Principal,
        id: i64,
        amount: u64,
    ) -> QuotaResult<(ProjectCommitment, ProjectCommitment)> {
        let mut tx = self.pool.begin().await?;
        let predecessor = self.fetch_for_project(&mut tx, id, project.id).await?;
        let (first_values, second_values) = split_values(&predecessor, amount)?;

        let context =
            CommitmentContext::with_related(CommitmentReason::Split, vec![predecessor.uuid]);
        let first = self
            .insert_commitment(&mut tx, &first_values, Some(predecessor.id), &context)
            .await?;
        let second = self
            .insert_commitment(&mut tx, &second_values, Some(predecessor.id), &context)
            .await?;

        let supersede = CommitmentContext::with_related(
            CommitmentReason::Split,
            vec![first.uuid, second.uuid],
        );
        self.mark_superseded(&mut tx, predecessor.id, &supersede).await?;
        tx.commit().await?;

        self.audit(CommitmentAction::Split, principal, project.uuid, &predecessor);
        Ok((first, second))
    }

    pub async fn merge(
        &self,
        project: &Project,
        principal: &Principal,
        ids: &[i64],
    ) -> QuotaResult<ProjectCommitment> {
        let mut tx = self.pool.begin().await?;
        let mut parts = Vec::with_capacity(ids.len());
        for &id in ids {
            parts.push(self.fetch_for_project(&mut tx, id, project.id).await?);
        }
        let values = merge_values(&parts)?;

        let context = CommitmentContext::with_related(
            CommitmentReason::Merge,
            parts.iter().map(|p| p.uuid).collect(),
        );
        let successor = self
            .insert_commitment(&mut tx, &values, Some(parts[0].id), &context)
            .await?;

        let supersede =
            CommitmentContext::with_related(CommitmentReason::Merge, vec![successor.uuid]);
        for part in &parts {
            self.mark_superseded(&mut tx, part.id, &supersede).await?;
        }
        tx.commit().await?;

        self.audit(CommitmentAction::Merge, principal, project.uuid, &successor);
        Ok(successor)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn convert(
        &self,
        project: &Project,
        principal: &Principal,
        id: i64,
        source_amount: u64,
        target_service: &str,
        target_resource: &str,
        target_amount: u64,
    ) -> QuotaResult<ProjectCommitment> {
        let mut tx = self.pool.begin().await?;
        let predecessor = self.fetch_for_project(&mut tx, id, project.id).await?;
        if predecessor.status.is_terminal() {
            return Err(QuotaError::conflict(format!(
                "commitment {} is {}",
                predecessor.uuid, predecessor.status
            )));
        }

        let source_location = self.location(&mut tx, predecessor.az_resource_id).await?;
        let source_config = self
            .resource_config(&source_location.service_type, &source_location.resource_name)?;
        let target_config = self.resource_config(target_service, target_resource)?;

        let (Some(source_conv), Some(target_conv)) =
            (source_config.conversion(), target_config.conversion())
        else {
            return Err(QuotaError::conflict(format!(
                "resource {}/{} is not convertible to {}/{}",
                source_location.service_type,
                source_location.resource_name,
                target_service,
                target_resource
            )));
        };
        if source_conv.identifier != target_conv.identifier
            || source_config.unit != target_config.unit
        {
            return Err(QuotaError::conflict(format!(
                "resource {}/{} is not convertible to {}/{}",
                source_location.service_type,
                source_location.resource_name,
                target_service,
                target_resource
            )));
        }
        if !target_config.topology.accepts_az(&source_location.az) {
            return Err(QuotaError::conflict(format!(
                "resource {}/{} does not exist in availability zone {}",
                target_service, target_resource, source_location.az
            )));
        }

        let (from, to) = conversion_rate(source_conv.weight, target_conv.weight);
        check_conversion_amounts(source_amount, target_amount, from, to)?;

        let total = quota::u64_from_db(predecessor.amount);
        if source_amount > total {
            return Err(QuotaError::invalid(format!(
                "conversion amount {} exceeds commitment amount {}",
                source_amount, total
            )));
        }

        let target_row = self
            .lookup_resource_row(&mut tx, target_service, target_resource)
            .await?;
        let target_par = quota::ensure_project_az_cell(
            &mut tx,
            project.id,
            target_row.service_id,
            target_row.resource_id,
            &source_location.az,
        )
        .await?;
        let target_location = self.location(&mut tx, target_par).await?;

        if predecessor.status == CommitmentStatus::Confirmed {
            let input = quota::fetch_capacity_check_input(
                &mut tx,
                target_row.resource_id,
                &source_location.az,
                target_row.has_capacity,
            )
            .await?;
            quota::check_commitment_delta(&input, target_par, target_amount)?;

            let before = self.confirmed_sum(&mut tx, target_par).await?;
            self.driver_veto(
                &target_location,
                vec![(
                    project.uuid,
                    ResourceCommitmentChangeset {
                        total_confirmed_before: before,
                        total_confirmed_after: before.saturating_add(target_amount),
                        commitments: vec![CommitmentChangeEntry {
                            uuid: Uuid::new_v4(),
                            old_status: None,
                            new_status: Some(CommitmentStatus::Confirmed),
                            amount: target_amount,
                            confirm_by: predecessor.confirm_by,
                            expires_at: predecessor.expires_at,
                            old_expires_at: None,
                        }],
                    },
                )],
                false,
            )
            .await?;
        }

        let mut related = Vec::new();

        // Any unconverted remainder stays behind on the source as a split.
        let remainder = total - source_amount;
        if remainder > 0 {
            let mut values = CommitmentValues::from(&predecessor);
            values.amount = remainder;
            let context =
                CommitmentContext::with_related(CommitmentReason::Split, vec![predecessor.uuid]);
            let rest = self
                .insert_commitment(&mut tx, &values, Some(predecessor.id), &context)
                .await?;
            related.push(rest.uuid);
        }

        let mut converted_values = CommitmentValues::from(&predecessor);
        converted_values.az_resource_id = target_par;
        converted_values.amount = target_amount;
        let context =
            CommitmentContext::with_related(CommitmentReason::Convert, vec![predecessor.uuid]);
        let converted = self
            .insert_commitment(&mut tx, &converted_values, Some(predecessor.id), &context)
            .await?;
        related.insert(0, converted.uuid);

        let supersede = CommitmentContext::with_related(CommitmentReason::Convert, related);
        self.mark_superseded(&mut tx, predecessor.id, &supersede).await?;

        if predecessor.status == CommitmentStatus::Confirmed {
            self.recompute_quotas(&mut tx, &source_location).await?;
            self.recompute_quotas(&mut tx, &target_location).await?;
        }
        tx.commit().await?;

        self.audit(CommitmentAction::Convert, principal, project.uuid, &converted);
        Ok(converted)
    }

    pub async fn update_duration(
        &self,
        project: &Project,
        principal: &Principal,
        id: i64,
        new_duration: CommitmentDuration,
    ) -> QuotaResult<ProjectCommitment> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;
        let commitment = self.fetch_for_project(&mut tx, id, project.id).await?;
        if commitment.status == CommitmentStatus::Superseded {
            return Err(QuotaError::conflict(format!(
                "commitment {} is superseded",
                commitment.uuid
            )));
        }
        if commitment.expires_at <= now {
            return Err(QuotaError::conflict(format!(
                "commitment {} is already expired",
                commitment.uuid
            )));
        }

        let location = self.location(&mut tx, commitment.az_resource_id).await?;
        let resource =
            self.resource_config(&location.service_type, &location.resource_name)?;
        if !resource.durations().contains(&new_duration) {
            return Err(QuotaError::invalid(format!(
                "unacceptable commitment duration for this resource, acceptable values: {}",
                resource
                    .durations()
                    .iter()
                    .map(|d| format!("{:?}", d.to_string()))
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }

        let anchor = commitment.confirm_by.unwrap_or(commitment.created_at);
        let new_expires_at = new_duration
            .add_to(anchor)
            .ok_or_else(|| QuotaError::invalid("duration overflows the calendar"))?;
        if new_expires_at < commitment.expires_at {
            return Err(QuotaError::conflict(
                "commitment duration cannot be shortened",
            ));
        }

        let confirmed_total = self.confirmed_sum(&mut tx, commitment.az_resource_id).await?;
        self.driver_veto(
            &location,
            vec![(
                project.uuid,
                ResourceCommitmentChangeset {
                    total_confirmed_before: confirmed_total,
                    total_confirmed_after: confirmed_total,
                    commitments: vec![CommitmentChangeEntry {
                        uuid: commitment.uuid,
                        old_status: Some(commitment.status),
                        new_status: Some(commitment.status),
                        amount: quota::u64_from_db(commitment.amount),
                        confirm_by: commitment.confirm_by,
                        expires_at: new_expires_at,
                        old_expires_at: Some(commitment.expires_at),
                    }],
                },
            )],
            false,
        )
        .await?;

        let updated: ProjectCommitment = sqlx::query_as(
            "UPDATE project_commitments SET duration = $2, expires_at = $3 WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(new_duration.to_string())
        .bind(new_expires_at)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        self.audit(CommitmentAction::UpdateDuration, principal, project.uuid, &updated);
        Ok(updated)
    }

    pub async fn renew(
        &self,
        project: &Project,
        principal: &Principal,
        id: i64,
    ) -> QuotaResult<ProjectCommitment> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;
        let predecessor = self.fetch_for_project(&mut tx, id, project.id).await?;
        validate_renewal(&predecessor, now)?;

        let (already_renewed,): (bool,) = sqlx::query_as(
            "SELECT EXISTS(
                SELECT 1 FROM project_commitments
                WHERE predecessor_id = $1 AND status IN ('planned', 'pending')
            )",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        if already_renewed {
            return Err(QuotaError::conflict(format!(
                "commitment {} already has a renewal",
                predecessor.uuid
            )));
        }

        let duration: CommitmentDuration = predecessor
            .duration
            .parse()
            .map_err(QuotaError::Internal)?;
        let confirm_by = predecessor.expires_at;
        let expires_at = duration
            .add_to(confirm_by)
            .ok_or_else(|| QuotaError::invalid("duration overflows the calendar"))?;

        let values = CommitmentValues {
            az_resource_id: predecessor.az_resource_id,
            amount: quota::u64_from_db(predecessor.amount),
            duration: predecessor.duration.clone(),
            created_at: now,
            creator_uuid: principal.uuid,
            creator_name: principal.name.clone(),
            confirm_by: Some(confirm_by),
            confirmed_at: None,
            expires_at,
            status: CommitmentStatus::Planned,
            notify_on_confirm: predecessor.notify_on_confirm,
        };
        let context =
            CommitmentContext::with_related(CommitmentReason::Renew, vec![predecessor.uuid]);
        let successor = self
            .insert_commitment(&mut tx, &values, Some(predecessor.id), &context)
            .await?;
        tx.commit().await?;

        self.audit(CommitmentAction::Renew, principal, project.uuid, &successor);
        Ok(successor)
    }

    pub async fn start_transfer(
        &self,
        project: &Project,
        principal: &Principal,
        id: i64,
        amount: u64,
        transfer_status: TransferStatus,
    ) -> QuotaResult<ProjectCommitment> {
        if transfer_status == TransferStatus::None {
            return Err(QuotaError::invalid(
                "transfer status must be unlisted or public",
            ));
        }

        let mut tx = self.pool.begin().await?;
        let commitment = self.fetch_for_project(&mut tx, id, project.id).await?;
        if commitment.status.is_terminal() {
            return Err(QuotaError::conflict(format!(
                "commitment {} is {}",
                commitment.uuid, commitment.status
            )));
        }
        let total = quota::u64_from_db(commitment.amount);
        if amount == 0 || amount > total {
            return Err(QuotaError::invalid(format!(
                "transfer amount must be between 1 and {}",
                total
            )));
        }

        // Carve out the transferred share first if it is a partial transfer.
        let target_id = if amount < total {
            let (first_values, second_values) = split_values(&commitment, amount)?;
            let context =
                CommitmentContext::with_related(CommitmentReason::Split, vec![commitment.uuid]);
            let first = self
                .insert_commitment(&mut tx, &first_values, Some(commitment.id), &context)
                .await?;
            let second = self
                .insert_commitment(&mut tx, &second_values, Some(commitment.id), &context)
                .await?;
            let supersede = CommitmentContext::with_related(
                CommitmentReason::Split,
                vec![first.uuid, second.uuid],
            );
            self.mark_superseded(&mut tx, commitment.id, &supersede).await?;
            first.id
        } else {
            commitment.id
        };

        let token = mint_transfer_token();
        let listed: ProjectCommitment = sqlx::query_as(
            "UPDATE project_commitments SET transfer_status = $2, transfer_token = $3
             WHERE id = $1 RETURNING *",
        )
        .bind(target_id)
        .bind(transfer_status)
        .bind(&token)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(
            project = %project.name,
            commitment = %listed.uuid,
            status = %transfer_status,
            "Commitment listed for transfer"
        );
        self.audit(CommitmentAction::StartTransfer, principal, project.uuid, &listed);
        Ok(listed)
    }

    pub async fn get_by_transfer_token(&self, token: &str) -> QuotaResult<ProjectCommitment> {
        let commitment: Option<ProjectCommitment> =
            sqlx::query_as("SELECT * FROM project_commitments WHERE transfer_token = $1")
                .bind(token)
                .fetch_optional(&self.pool)
                .await?;
        commitment.ok_or_else(|| QuotaError::not_found("no such transfer token"))
    }

    pub async fn accept_transfer(
        &self,
        target_project: &Project,
        principal: &Principal,
        token: &str,
    ) -> QuotaResult<ProjectCommitment> {
        let mut tx = self.pool.begin().await?;
        let commitment: Option<ProjectCommitment> =
            sqlx::query_as("SELECT * FROM project_commitments WHERE transfer_token = $1")
                .bind(token)
                .fetch_optional(&mut *tx)
                .await?;
        let commitment =
            commitment.ok_or_else(|| QuotaError::not_found("no such transfer token"))?;

        let source = self.location(&mut tx, commitment.az_resource_id).await?;
        if source.project_id == target_project.id {
            return Err(QuotaError::conflict(
                "commitment is already owned by this project",
            ));
        }

        // The receiving project must already carry the exact same
        // (service, resource, AZ) tuple; no mapping to other zones.
        let target_par: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT par.id
            FROM project_az_resources par
            JOIN project_resources pr ON pr.id = par.project_resource_id
            JOIN project_services ps ON ps.id = pr.project_service_id
            WHERE ps.project_id = $1 AND pr.resource_id = $2 AND par.az = $3
            "#,
        )
        .bind(target_project.id)
        .bind(source.resource_id)
        .bind(&source.az)
        .fetch_optional(&mut *tx)
        .await?;
        let (target_par,) = target_par.ok_or_else(|| {
            QuotaError::not_found(format!(
                "project {} has no {}/{} in availability zone {}",
                target_project.name, source.service_type, source.resource_name, source.az
            ))
        })?;

        let amount = quota::u64_from_db(commitment.amount);
        if commitment.status == CommitmentStatus::Confirmed {
            let input = quota::fetch_capacity_check_input(
                &mut tx,
                source.resource_id,
                &source.az,
                source.has_capacity,
            )
            .await?;
            quota::check_transfer(&input, commitment.az_resource_id, target_par, amount)?;
        }

        let source_before = self.confirmed_sum(&mut tx, commitment.az_resource_id).await?;
        let target_before = self.confirmed_sum(&mut tx, target_par).await?;
        let counts = commitment.counts_toward_capacity();
        self.driver_veto(
            &source,
            vec![
                (
                    source.project_uuid,
                    ResourceCommitmentChangeset {
                        total_confirmed_before: source_before,
                        total_confirmed_after: if counts {
                            source_before.saturating_sub(amount)
                        } else {
                            source_before
                        },
                        commitments: vec![CommitmentChangeEntry {
                            uuid: commitment.uuid,
                            old_status: Some(commitment.status),
                            new_status: None,
                            amount,
                            confirm_by: commitment.confirm_by,
                            expires_at: commitment.expires_at,
                            old_expires_at: None,
                        }],
                    },
                ),
                (
                    target_project.uuid,
                    ResourceCommitmentChangeset {
                        total_confirmed_before: target_before,
                        total_confirmed_after: if counts {
                            target_before.saturating_add(amount)
                        } else {
                            target_before
                        },
                        commitments: vec![CommitmentChangeEntry {
                            uuid: commitment.uuid,
                            old_status: None,
                            new_status: Some(commitment.status),
                            amount,
                            confirm_by: commitment.confirm_by,
                            expires_at: commitment.expires_at,
                            old_expires_at: None,
                        }],
                    },
                ),
            ],
            false,
        )
        .await?;

        let moved: ProjectCommitment = sqlx::query_as(
            "UPDATE project_commitments
             SET az_resource_id = $2, transfer_status = 'none', transfer_token = NULL
             WHERE id = $1 RETURNING *",
        )
        .bind(commitment.id)
        .bind(target_par)
        .fetch_one(&mut *tx)
        .await?;

        if counts {
            self.recompute_quotas(&mut tx, &source).await?;
        }
        tx.commit().await?;

        info!(
            from = %source.project_name,
            to = %target_project.name,
            commitment = %moved.uuid,
            "Commitment transferred"
        );
        self.audit(
            CommitmentAction::AcceptTransfer,
            principal,
            target_project.uuid,
            &moved,
        );
        Ok(moved)
    }

    // ── Sweeper entry points ────────────────────────────────────────────

    /// Move every overdue active commitment to `expired`. Returns how many
    /// rows were transitioned.
    pub async fn expire_overdue(&self) -> QuotaResult<u64> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;
        let expired: Vec<ProjectCommitment> = sqlx::query_as(
            r#"
            UPDATE project_commitments
            SET status = 'expired'
            WHERE expires_at <= $1 AND status IN ('planned', 'pending', 'confirmed')
            RETURNING *
            "#,
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        // Confirmed expiries free capacity; recompute each resource once.
        let mut seen_resources = std::collections::HashSet::new();
        let mut events = Vec::with_capacity(expired.len());
        for commitment in &expired {
            let location = self.location(&mut tx, commitment.az_resource_id).await?;
            if commitment.confirmed_at.is_some() && seen_resources.insert(location.resource_id) {
                self.recompute_quotas(&mut tx, &location).await?;
            }
            events.push(AuditEvent::for_commitment(
                CommitmentAction::Expire,
                now,
                commitment.creator_uuid,
                &commitment.creator_name,
                location.project_uuid,
                commitment,
            ));
        }
        tx.commit().await?;

        for event in events {
            self.auditor.record(event);
        }
        Ok(expired.len() as u64)
    }

    /// Try to confirm planned and pending commitments whose `confirm_by`
    /// has passed. Capacity shortage parks the row as `pending` for the
    /// next tick. Returns how many commitments were confirmed.
    pub async fn confirm_due(&self) -> QuotaResult<u64> {
        let now = self.clock.now();
        let due: Vec<ProjectCommitment> = sqlx::query_as(
            r#"
            SELECT * FROM project_commitments
            WHERE status IN ('planned', 'pending') AND confirm_by <= $1
            ORDER BY confirm_by, id
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut confirmed_count = 0;
        for commitment in due {
            match self.try_confirm(&commitment, now).await {
                Ok(true) => confirmed_count += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(
                        commitment = %commitment.uuid,
                        error = %err,
                        "Confirmation attempt failed"
                    );
                }
            }
        }
        Ok(confirmed_count)
    }

    async fn try_confirm(
        &self,
        commitment: &ProjectCommitment,
        now: DateTime<Utc>,
    ) -> QuotaResult<bool> {
        let mut tx = self.pool.begin().await?;
        let location = self.location(&mut tx, commitment.az_resource_id).await?;
        let amount = quota::u64_from_db(commitment.amount);

        let input = quota::fetch_capacity_check_input(
            &mut tx,
            location.resource_id,
            &location.az,
            location.has_capacity,
        )
        .await?;
        let decision = match quota::check_commitment_delta(&input, commitment.az_resource_id, amount)
        {
            Ok(()) => {
                let before = self.confirmed_sum(&mut tx, commitment.az_resource_id).await?;
                self.driver_veto(
                    &location,
                    vec![(
                        location.project_uuid,
                        ResourceCommitmentChangeset {
                            total_confirmed_before: before,
                            total_confirmed_after: before.saturating_add(amount),
                            commitments: vec![CommitmentChangeEntry {
                                uuid: commitment.uuid,
                                old_status: Some(commitment.status),
                                new_status: Some(CommitmentStatus::Confirmed),
                                amount,
                                confirm_by: commitment.confirm_by,
                                expires_at: commitment.expires_at,
                                old_expires_at: None,
                            }],
                        },
                    )],
                    false,
                )
                .await
            }
            Err(err) => Err(err),
        };

        match decision {
            Ok(()) => {
                // Guard on status: the row may have expired since listing.
                let confirmed: Option<ProjectCommitment> = sqlx::query_as(
                    "UPDATE project_commitments SET status = 'confirmed', confirmed_at = $2
                     WHERE id = $1 AND status IN ('planned', 'pending') RETURNING *",
                )
                .bind(commitment.id)
                .bind(now)
                .fetch_optional(&mut *tx)
                .await?;
                let Some(confirmed) = confirmed else {
                    tx.rollback().await?;
                    return Ok(false);
                };

                self.recompute_quotas(&mut tx, &location).await?;

                if confirmed.notify_on_confirm {
                    if let Some(mail_config) = &self.config.mail {
                        let (subject, body) = mail::render_confirmation(
                            mail_config,
                            &location.project_name,
                            &location.resource_name,
                            &location.unit,
                            &location.az,
                            &confirmed,
                        );
                        mail::enqueue(&mut tx, location.project_id, &subject, &body, now).await?;
                    }
                }
                tx.commit().await?;

                info!(
                    project = %location.project_name,
                    commitment = %confirmed.uuid,
                    "Commitment confirmed"
                );
                self.auditor.record(AuditEvent::for_commitment(
                    CommitmentAction::Confirm,
                    now,
                    confirmed.creator_uuid,
                    &confirmed.creator_name,
                    location.project_uuid,
                    &confirmed,
                ));
                Ok(true)
            }
            Err(QuotaError::CapacityExceeded(_)) => {
                sqlx::query(
                    "UPDATE project_commitments SET status = 'pending'
                     WHERE id = $1 AND status = 'planned'",
                )
                .bind(commitment.id)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                Ok(false)
            }
            Err(other) => {
                tx.rollback().await?;
                Err(other)
            }
        }
    }

    // ── Row lookups ─────────────────────────────────────────────────────

    async fn lookup_resource_row(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        service_type: &str,
        resource_name: &str,
    ) -> QuotaResult<ResourceRow> {
        let row: Option<ResourceRow> = sqlx::query_as(
            r#"
            SELECT s.id AS service_id, r.id AS resource_id,
                   r.has_capacity, r.handles_commitments
            FROM resources r
            JOIN services s ON s.id = r.service_id
            WHERE s.type = $1 AND r.name = $2
            "#,
        )
        .bind(service_type)
        .bind(resource_name)
        .fetch_optional(&mut **tx)
        .await?;
        row.ok_or_else(|| {
            QuotaError::not_found(format!(
                "resource {}/{} is not registered",
                service_type, resource_name
            ))
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ResourceRow {
    service_id: i64,
    resource_id: i64,
    has_capacity: bool,
    handles_commitments: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResourceTopology;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(y: i32, mo: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, 0, 0).unwrap()
    }

    fn confirmed_commitment(amount: i64, expires_at: DateTime<Utc>) -> ProjectCommitment {
        ProjectCommitment {
            id: 1,
            uuid: Uuid::new_v4(),
            az_resource_id: 10,
            amount,
            duration: "1 hour".into(),
            created_at: at(2026, 5, 1, 8),
            creator_uuid: Uuid::from_bytes([1; 16]),
            creator_name: "alice".into(),
            confirm_by: None,
            confirmed_at: Some(at(2026, 5, 1, 8)),
            expires_at,
            status: CommitmentStatus::Confirmed,
            transfer_status: TransferStatus::None,
            transfer_token: None,
            predecessor_id: None,
            creation_context: serde_json::json!({"reason": "create"}),
            supersede_context: None,
            notify_on_confirm: false,
        }
    }

    fn cores_config() -> ResourceConfig {
        let yaml = r#"
name: cores
topology: az-aware
has_capacity: true
commitment:
  durations: ["1 hour", "2 hours", "10 hours"]
"#;
        serde_yaml::from_str(yaml).unwrap()
    }

    fn create_request(amount: u64) -> CreateRequest {
        CreateRequest {
            service_type: "compute".into(),
            resource_name: "cores".into(),
            availability_zone: "az-one".into(),
            amount,
            duration: "2 hours".parse().unwrap(),
            confirm_by: None,
            notify_on_confirm: false,
        }
    }

    // ── Token minting ───────────────────────────────────────────────────

    #[test]
    fn test_transfer_token_is_48_lowercase_hex_chars() {
        let token = mint_transfer_token();
        assert_eq!(token.len(), 48);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        // Vanishingly unlikely to collide.
        assert_ne!(token, mint_transfer_token());
    }

    // ── Conversion arithmetic ───────────────────────────────────────────

    #[test]
    fn test_conversion_rate_reduces_weights() {
        // Weights 48 and 32 reduce to a 3:2 rate.
        assert_eq!(conversion_rate(48, 32), (3, 2));
        assert_eq!(conversion_rate(32, 48), (2, 3));
        assert_eq!(conversion_rate(5, 7), (5, 7));
        assert_eq!(conversion_rate(10, 10), (1, 1));
    }

    #[test]
    fn test_conversion_remainder_rejected() {
        let (from, to) = conversion_rate(48, 32);
        let err = check_conversion_amounts(10, 6, from, to).unwrap_err();
        match err {
            QuotaError::Conflict(msg) => {
                assert_eq!(msg, "amount 10 does not fit into conversion rate 3")
            }
            other => panic!("expected Conflict, got {:?}", other),
        }

        assert!(check_conversion_amounts(3, 2, from, to).is_ok());
        assert!(check_conversion_amounts(9, 6, from, to).is_ok());
    }

    #[test]
    fn test_conversion_wrong_target_amount_rejected() {
        let (from, to) = conversion_rate(48, 32);
        assert!(matches!(
            check_conversion_amounts(3, 3, from, to),
            Err(QuotaError::Conflict(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_convert_round_trips(
            source_weight in 1u64..1000,
            target_weight in 1u64..1000,
            steps in 1u64..1000,
        ) {
            let (from, to) = conversion_rate(source_weight, target_weight);
            let source_amount = steps * from;
            let target_amount = steps * to;
            prop_assert!(check_conversion_amounts(source_amount, target_amount, from, to).is_ok());

            // Converting back at the inverse rate restores the amount.
            let (back_from, back_to) = conversion_rate(target_weight, source_weight);
            prop_assert!(check_conversion_amounts(target_amount, source_amount, back_from, back_to).is_ok());
        }
    }

    // ── Split and merge planning ────────────────────────────────────────

    #[test]
    fn test_split_amounts() {
        assert_eq!(split_amounts(10, 9).unwrap(), (9, 1));
        assert_eq!(split_amounts(10, 1).unwrap(), (1, 9));
        assert!(split_amounts(10, 0).is_err());
        assert!(split_amounts(10, 10).is_err());
        assert!(split_amounts(10, 11).is_err());
    }

    #[test]
    fn test_split_values_inherit_everything_but_amount() {
        let predecessor = confirmed_commitment(10, at(2026, 5, 1, 9));
        let (a, b) = split_values(&predecessor, 9).unwrap();
        assert_eq!(a.amount, 9);
        assert_eq!(b.amount, 1);
        for values in [&a, &b] {
            assert_eq!(values.expires_at, predecessor.expires_at);
            assert_eq!(values.status, predecessor.status);
            assert_eq!(values.confirmed_at, predecessor.confirmed_at);
            assert_eq!(values.duration, predecessor.duration);
            assert_eq!(values.az_resource_id, predecessor.az_resource_id);
        }
    }

    #[test]
    fn test_split_rejects_terminal_states() {
        let mut predecessor = confirmed_commitment(10, at(2026, 5, 1, 9));
        predecessor.status = CommitmentStatus::Superseded;
        assert!(matches!(
            split_values(&predecessor, 4),
            Err(QuotaError::Conflict(_))
        ));
    }

    #[test]
    fn test_merge_takes_latest_expiry_and_its_duration() {
        // Amounts {10 @ 1 hour, 5 @ 2 hours} merge into 15 @ 2 hours.
        let mut a = confirmed_commitment(10, at(2026, 5, 1, 9));
        a.duration = "1 hour".into();
        let mut b = confirmed_commitment(5, at(2026, 5, 1, 10));
        b.duration = "2 hours".into();

        let merged = merge_values(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(merged.amount, 15);
        assert_eq!(merged.expires_at, at(2026, 5, 1, 10));
        assert_eq!(merged.duration, "2 hours");
        assert_eq!(merged.status, CommitmentStatus::Confirmed);
    }

    #[test]
    fn test_merge_rejects_mixed_cells_and_unconfirmed() {
        let a = confirmed_commitment(10, at(2026, 5, 1, 9));
        let mut b = confirmed_commitment(5, at(2026, 5, 1, 10));
        b.az_resource_id = 11;
        assert!(matches!(
            merge_values(&[a.clone(), b]),
            Err(QuotaError::Conflict(_))
        ));

        let mut c = confirmed_commitment(5, at(2026, 5, 1, 10));
        c.status = CommitmentStatus::Planned;
        c.confirmed_at = None;
        assert!(matches!(
            merge_values(&[a.clone(), c]),
            Err(QuotaError::Conflict(_))
        ));

        assert!(merge_values(&[a]).is_err());
    }

    #[test]
    fn test_split_then_merge_restores_the_original() {
        let original = confirmed_commitment(10, at(2026, 5, 1, 9));
        let (a_values, b_values) = split_values(&original, 3).unwrap();

        let materialize = |values: &CommitmentValues, id: i64| ProjectCommitment {
            id,
            uuid: Uuid::new_v4(),
            az_resource_id: values.az_resource_id,
            amount: values.amount as i64,
            duration: values.duration.clone(),
            created_at: values.created_at,
            creator_uuid: values.creator_uuid,
            creator_name: values.creator_name.clone(),
            confirm_by: values.confirm_by,
            confirmed_at: values.confirmed_at,
            expires_at: values.expires_at,
            status: values.status,
            transfer_status: TransferStatus::None,
            transfer_token: None,
            predecessor_id: Some(original.id),
            creation_context: serde_json::json!({"reason": "split"}),
            supersede_context: None,
            notify_on_confirm: values.notify_on_confirm,
        };

        let merged = merge_values(&[materialize(&a_values, 2), materialize(&b_values, 3)]).unwrap();
        assert_eq!(merged, CommitmentValues::from(&original));
    }

    proptest! {
        #[test]
        fn prop_split_conserves_amount(total in 2u64..1_000_000, carve in 1u64..1_000_000) {
            prop_assume!(carve < total);
            let (a, b) = split_amounts(total, carve).unwrap();
            prop_assert_eq!(a + b, total);
            prop_assert!(a > 0 && b > 0);
        }
    }

    // ── Deletion window ─────────────────────────────────────────────────

    #[test]
    fn test_delete_window() {
        let commitment = confirmed_commitment(10, at(2026, 6, 1, 8));
        // Created 2026-05-01 08:00; grace runs out 24h later.
        assert!(!delete_requires_elevation(&commitment, at(2026, 5, 1, 20)));
        assert!(!delete_requires_elevation(&commitment, at(2026, 5, 2, 8)));
        assert!(delete_requires_elevation(&commitment, at(2026, 5, 2, 9)));
    }

    #[test]
    fn test_delete_window_requires_create_reason() {
        let mut commitment = confirmed_commitment(10, at(2026, 6, 1, 8));
        commitment.creation_context = serde_json::json!({"reason": "split"});
        assert!(delete_requires_elevation(&commitment, at(2026, 5, 1, 9)));
    }

    // ── Renewal window ──────────────────────────────────────────────────

    #[test]
    fn test_renewal_window() {
        let commitment = confirmed_commitment(10, at(2026, 7, 1, 0));
        // Fine: expires within three months.
        assert!(validate_renewal(&commitment, at(2026, 5, 1, 0)).is_ok());
        // Too early: more than three months out.
        assert!(matches!(
            validate_renewal(&commitment, at(2026, 3, 1, 0)),
            Err(QuotaError::Conflict(_))
        ));
        // Too late: already past expiry.
        assert!(matches!(
            validate_renewal(&commitment, at(2026, 7, 1, 0)),
            Err(QuotaError::Conflict(_))
        ));
    }

    // ── Create validation ───────────────────────────────────────────────

    #[test]
    fn test_validate_create_happy_path() {
        let resource = cores_config();
        let azs = vec!["az-one".to_string(), "az-two".to_string()];
        let req = create_request(6);
        assert!(validate_create(&resource, &azs, &req, at(2026, 5, 1, 8)).is_ok());
    }

    #[test]
    fn test_validate_create_rejects_zero_amount_and_bad_az() {
        let resource = cores_config();
        let azs = vec!["az-one".to_string()];

        let req = create_request(0);
        assert!(matches!(
            validate_create(&resource, &azs, &req, at(2026, 5, 1, 8)),
            Err(QuotaError::Invalid(_))
        ));

        let mut req = create_request(5);
        req.availability_zone = "az-nine".into();
        assert!(matches!(
            validate_create(&resource, &azs, &req, at(2026, 5, 1, 8)),
            Err(QuotaError::Invalid(_))
        ));

        // Flat resources only accept the sentinel AZ.
        let mut flat = cores_config();
        flat.topology = ResourceTopology::Flat;
        let mut req = create_request(5);
        req.availability_zone = "az-one".into();
        assert!(validate_create(&flat, &azs, &req, at(2026, 5, 1, 8)).is_err());
        req.availability_zone = AZ_ANY.into();
        assert!(validate_create(&flat, &azs, &req, at(2026, 5, 1, 8)).is_ok());
    }

    #[test]
    fn test_validate_create_rejects_unknown_duration() {
        let resource = cores_config();
        let azs = vec!["az-one".to_string()];
        let mut req = create_request(5);
        req.duration = "3 hours".parse().unwrap();
        assert!(matches!(
            validate_create(&resource, &azs, &req, at(2026, 5, 1, 8)),
            Err(QuotaError::Invalid(_))
        ));
    }

    #[test]
    fn test_validate_create_rejects_notify_on_immediate_confirmation() {
        let resource = cores_config();
        let azs = vec!["az-one".to_string()];
        let mut req = create_request(5);
        req.notify_on_confirm = true;
        assert!(matches!(
            validate_create(&resource, &azs, &req, at(2026, 5, 1, 8)),
            Err(QuotaError::Conflict(_))
        ));

        // With a confirm_by date the notification is fine.
        req.confirm_by = Some(at(2026, 5, 15, 8));
        assert!(validate_create(&resource, &azs, &req, at(2026, 5, 1, 8)).is_ok());
    }

    #[test]
    fn test_validate_create_confirm_by_must_not_precede_now_or_min_date() {
        let mut resource = cores_config();
        let azs = vec!["az-one".to_string()];

        let mut req = create_request(5);
        req.confirm_by = Some(at(2026, 4, 1, 8));
        assert!(validate_create(&resource, &azs, &req, at(2026, 5, 1, 8)).is_err());

        resource.commitment.as_mut().unwrap().min_confirm_date = Some(at(2026, 6, 1, 0));
        let mut req = create_request(5);
        req.confirm_by = Some(at(2026, 5, 15, 0));
        assert!(validate_create(&resource, &azs, &req, at(2026, 5, 1, 8)).is_err());
        req.confirm_by = Some(at(2026, 6, 2, 0));
        assert!(validate_create(&resource, &azs, &req, at(2026, 5, 1, 8)).is_ok());
    }
}
