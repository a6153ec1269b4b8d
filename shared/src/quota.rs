/// Quota computation
/// Pure arithmetic over a fetched snapshot: capacity floors from
/// max(committed, usage), growth-policy fair share with deterministic
/// remainder distribution, administrative ceilings, and the capacity check
/// behind every commitment confirmation. The persistence wrapper at the
/// bottom runs inside the caller's transaction.

use std::collections::HashMap;

use sqlx::{Postgres, Transaction};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::{QuotaError, QuotaResult};

/// BIGINT columns hold the u64 domain values; negative values from a
/// corrupted row clamp to zero rather than wrapping.
pub fn u64_from_db(v: i64) -> u64 {
    v.max(0) as u64
}

pub fn db_from_u64(v: u64) -> i64 {
    v.min(i64::MAX as u64) as i64
}

// ═══════════════════════════════════════════════════════════════════════════
// SNAPSHOT TYPES
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct ResourceSnapshot {
    pub resource_id: i64,
    pub growth_multiplier: f64,
    pub azs: Vec<AzSnapshot>,
}

#[derive(Debug, Clone)]
pub struct AzSnapshot {
    pub az: String,
    pub raw_capacity: u64,
    pub projects: Vec<ProjectAzSnapshot>,
}

#[derive(Debug, Clone)]
pub struct ProjectAzSnapshot {
    pub project_uuid: Uuid,
    pub project_az_resource_id: i64,
    pub project_resource_id: i64,
    pub usage: u64,
    /// Recent peak usage driving the growth policy; falls back to `usage`
    /// when the scraper has not reported one.
    pub historical_usage: Option<u64>,
    pub committed: u64,
    pub forbidden: bool,
    pub max_quota: Option<u64>,
}

impl ProjectAzSnapshot {
    /// The capacity floor: what this project is entitled to no matter what.
    pub fn floor(&self) -> u64 {
        self.committed.max(self.usage)
    }

    fn recent_usage(&self) -> u64 {
        self.historical_usage.unwrap_or(self.usage)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuotaPlan {
    /// Per-AZ published assignment, keyed by project_az_resources.id.
    pub az_assignments: Vec<AzAssignment>,
    /// Project totals, keyed by project_resources.id; each equals the sum of
    /// that project's AZ assignments.
    pub project_totals: HashMap<i64, u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AzAssignment {
    pub project_az_resource_id: i64,
    pub project_resource_id: i64,
    pub quota: u64,
}

// ═══════════════════════════════════════════════════════════════════════════
// COMPUTATION
// ═══════════════════════════════════════════════════════════════════════════

fn checked_sum(values: impl Iterator<Item = u64>, what: &str) -> QuotaResult<u64> {
    let mut total: u64 = 0;
    for v in values {
        total = total
            .checked_add(v)
            .ok_or_else(|| QuotaError::Overflow(format!("sum of {} exceeds u64", what)))?;
    }
    Ok(total)
}

/// Growth target before fair-share scaling: multiplier × recent usage,
/// never below the floor. Forbidden projects stay pinned at their floor.
fn desired_quota(project: &ProjectAzSnapshot, multiplier: f64) -> u64 {
    if project.forbidden {
        return project.floor();
    }
    let grown = multiplier * project.recent_usage() as f64;
    let grown = if grown >= u64::MAX as f64 {
        u64::MAX
    } else {
        grown as u64
    };
    grown.max(project.floor())
}

/// Distribute quota within one AZ. Floors are always granted; the remaining
/// capacity is split across growth demands proportionally, with the integer
/// remainder handed out one unit at a time in ascending project UUID order.
pub fn compute_az_quotas(
    az: &AzSnapshot,
    multiplier: f64,
) -> QuotaResult<Vec<(i64, u64)>> {
    let floors = checked_sum(az.projects.iter().map(|p| p.floor()), "capacity floors")?;
    let remaining = az.raw_capacity.saturating_sub(floors);

    let extras: Vec<u64> = az
        .projects
        .iter()
        .map(|p| desired_quota(p, multiplier) - p.floor())
        .collect();
    let total_extra = checked_sum(extras.iter().copied(), "growth demands")?;

    let mut shares: Vec<u64> = if total_extra <= remaining {
        extras.clone()
    } else {
        // Proportional shares in u128 to dodge intermediate overflow.
        let mut shares: Vec<u64> = extras
            .iter()
            .map(|&extra| {
                ((remaining as u128 * extra as u128) / total_extra as u128) as u64
            })
            .collect();

        let assigned: u64 = shares.iter().sum();
        let mut leftover = remaining - assigned;

        // Deterministic remainder distribution: ascending project UUID.
        let mut order: Vec<usize> = (0..az.projects.len()).collect();
        order.sort_by_key(|&i| az.projects[i].project_uuid);
        while leftover > 0 {
            let mut gave_any = false;
            for &i in &order {
                if leftover == 0 {
                    break;
                }
                if shares[i] < extras[i] {
                    shares[i] += 1;
                    leftover -= 1;
                    gave_any = true;
                }
            }
            if !gave_any {
                break;
            }
        }
        shares
    };

    let mut result = Vec::with_capacity(az.projects.len());
    for (project, share) in az.projects.iter().zip(shares.drain(..)) {
        let mut quota = project
            .floor()
            .checked_add(share)
            .ok_or_else(|| QuotaError::Overflow("project quota exceeds u64".into()))?;
        if let Some(ceiling) = project.max_quota {
            quota = quota.min(ceiling);
        }
        result.push((project.project_az_resource_id, quota));
    }
    Ok(result)
}

/// Compute target quotas for every project of one resource across all AZs.
pub fn compute_resource_quotas(snapshot: &ResourceSnapshot) -> QuotaResult<QuotaPlan> {
    let mut plan = QuotaPlan::default();
    let mut resource_ids: HashMap<i64, i64> = HashMap::new();
    for az in &snapshot.azs {
        for p in &az.projects {
            resource_ids.insert(p.project_az_resource_id, p.project_resource_id);
        }
    }

    for az in &snapshot.azs {
        for (par_id, quota) in compute_az_quotas(az, snapshot.growth_multiplier)? {
            let project_resource_id = resource_ids[&par_id];
            let total = plan.project_totals.entry(project_resource_id).or_insert(0);
            *total = total
                .checked_add(quota)
                .ok_or_else(|| QuotaError::Overflow("project total exceeds u64".into()))?;
            plan.az_assignments.push(AzAssignment {
                project_az_resource_id: par_id,
                project_resource_id,
                quota,
            });
        }
    }
    Ok(plan)
}

// ═══════════════════════════════════════════════════════════════════════════
// CAPACITY CHECK (invariant: Σ max(committed, usage) ≤ raw_capacity)
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct CapacityCheckInput {
    pub raw_capacity: u64,
    pub enforced: bool,
    pub projects: Vec<ProjectFloor>,
}

#[derive(Debug, Clone)]
pub struct ProjectFloor {
    /// project_az_resources.id identifying the (project, resource, AZ) cell.
    pub az_resource_id: i64,
    pub committed: u64,
    pub usage: u64,
}

/// Would granting `delta` more committed capacity to `target` keep the
/// invariant intact?
pub fn check_commitment_delta(
    input: &CapacityCheckInput,
    target: i64,
    delta: u64,
) -> QuotaResult<()> {
    if !input.enforced {
        return Ok(());
    }

    let mut total: u64 = 0;
    let mut target_seen = false;
    for project in &input.projects {
        let committed = if project.az_resource_id == target {
            target_seen = true;
            project
                .committed
                .checked_add(delta)
                .ok_or_else(|| QuotaError::Overflow("committed amount exceeds u64".into()))?
        } else {
            project.committed
        };
        total = total
            .checked_add(committed.max(project.usage))
            .ok_or_else(|| QuotaError::Overflow("sum of capacity floors exceeds u64".into()))?;
    }
    if !target_seen {
        total = total
            .checked_add(delta)
            .ok_or_else(|| QuotaError::Overflow("sum of capacity floors exceeds u64".into()))?;
    }

    if total > input.raw_capacity {
        return Err(QuotaError::CapacityExceeded(format!(
            "additional commitment of {} would raise demand to {} against capacity {}",
            delta, total, input.raw_capacity
        )));
    }
    Ok(())
}

/// Would moving `amount` of committed capacity from `source` to `target`
/// (a commitment transfer between projects in the same AZ) keep the
/// invariant intact? The source floor may stay put when its usage exceeds
/// its commitments, so this is not symmetric with a plain delta check.
pub fn check_transfer(
    input: &CapacityCheckInput,
    source: i64,
    target: i64,
    amount: u64,
) -> QuotaResult<()> {
    let mut adjusted = input.clone();
    for project in &mut adjusted.projects {
        if project.az_resource_id == source {
            project.committed = project.committed.saturating_sub(amount);
        }
    }
    check_commitment_delta(&adjusted, target, amount)
}

// ═══════════════════════════════════════════════════════════════════════════
// PERSISTENCE
// ═══════════════════════════════════════════════════════════════════════════

#[derive(sqlx::FromRow)]
struct ProjectAzJoinRow {
    par_id: i64,
    project_resource_id: i64,
    az: String,
    usage: i64,
    historical_usage: Option<i64>,
    forbidden: bool,
    max_quota_from_local_admin: Option<i64>,
    max_quota_from_outside_admin: Option<i64>,
    project_uuid: Uuid,
}

const PROJECT_AZ_JOIN_SQL: &str = r#"
    SELECT par.id AS par_id,
           par.project_resource_id,
           par.az,
           par.usage,
           par.historical_usage,
           pr.forbidden,
           pr.max_quota_from_local_admin,
           pr.max_quota_from_outside_admin,
           p.uuid AS project_uuid
    FROM project_az_resources par
    JOIN project_resources pr ON pr.id = par.project_resource_id
    JOIN project_services ps ON ps.id = pr.project_service_id
    JOIN projects p ON p.id = ps.project_id
    WHERE pr.resource_id = $1
"#;

const CONFIRMED_SUMS_SQL: &str = r#"
    SELECT c.az_resource_id, SUM(c.amount)::BIGINT
    FROM project_commitments c
    JOIN project_az_resources par ON par.id = c.az_resource_id
    JOIN project_resources pr ON pr.id = par.project_resource_id
    WHERE pr.resource_id = $1 AND c.status = 'confirmed'
    GROUP BY c.az_resource_id
"#;

/// Walk the project_services → project_resources → project_az_resources
/// chain for one (project, resource, AZ) cell, creating missing links, and
/// return the cell id.
pub async fn ensure_project_az_cell(
    tx: &mut Transaction<'_, Postgres>,
    project_id: i64,
    service_id: i64,
    resource_id: i64,
    az: &str,
) -> QuotaResult<i64> {
    let (ps_id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO project_services (project_id, service_id)
        VALUES ($1, $2)
        ON CONFLICT (project_id, service_id) DO UPDATE SET project_id = EXCLUDED.project_id
        RETURNING id
        "#,
    )
    .bind(project_id)
    .bind(service_id)
    .fetch_one(&mut **tx)
    .await?;

    let (pr_id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO project_resources (project_service_id, resource_id)
        VALUES ($1, $2)
        ON CONFLICT (project_service_id, resource_id)
            DO UPDATE SET project_service_id = EXCLUDED.project_service_id
        RETURNING id
        "#,
    )
    .bind(ps_id)
    .bind(resource_id)
    .fetch_one(&mut **tx)
    .await?;

    let (par_id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO project_az_resources (project_resource_id, az)
        VALUES ($1, $2)
        ON CONFLICT (project_resource_id, az)
            DO UPDATE SET project_resource_id = EXCLUDED.project_resource_id
        RETURNING id
        "#,
    )
    .bind(pr_id)
    .bind(az)
    .fetch_one(&mut **tx)
    .await?;

    Ok(par_id)
}

/// Build the in-memory snapshot for one resource from the current rows.
pub async fn fetch_resource_snapshot(
    tx: &mut Transaction<'_, Postgres>,
    resource_id: i64,
    growth_multiplier: f64,
) -> QuotaResult<ResourceSnapshot> {
    let capacities: Vec<(String, i64)> =
        sqlx::query_as("SELECT az, raw_capacity FROM az_resources WHERE resource_id = $1")
            .bind(resource_id)
            .fetch_all(&mut **tx)
            .await?;

    let rows: Vec<ProjectAzJoinRow> = sqlx::query_as(PROJECT_AZ_JOIN_SQL)
        .bind(resource_id)
        .fetch_all(&mut **tx)
        .await?;

    let committed: HashMap<i64, u64> = sqlx::query_as::<_, (i64, i64)>(CONFIRMED_SUMS_SQL)
        .bind(resource_id)
        .fetch_all(&mut **tx)
        .await?
        .into_iter()
        .map(|(id, sum)| (id, u64_from_db(sum)))
        .collect();

    let mut azs: Vec<AzSnapshot> = capacities
        .into_iter()
        .map(|(az, raw_capacity)| AzSnapshot {
            az,
            raw_capacity: u64_from_db(raw_capacity),
            projects: Vec::new(),
        })
        .collect();

    for row in rows {
        let Some(az) = azs.iter_mut().find(|a| a.az == row.az) else {
            // Usage reported for an AZ the capacity scraper has not seen yet.
            continue;
        };
        let max_quota = match (
            row.max_quota_from_outside_admin,
            row.max_quota_from_local_admin,
        ) {
            (Some(a), Some(b)) => Some(u64_from_db(a.min(b))),
            (Some(a), None) => Some(u64_from_db(a)),
            (None, Some(b)) => Some(u64_from_db(b)),
            (None, None) => None,
        };
        az.projects.push(ProjectAzSnapshot {
            project_uuid: row.project_uuid,
            project_az_resource_id: row.par_id,
            project_resource_id: row.project_resource_id,
            usage: u64_from_db(row.usage),
            historical_usage: row.historical_usage.map(u64_from_db),
            committed: committed.get(&row.par_id).copied().unwrap_or(0),
            forbidden: row.forbidden,
            max_quota,
        });
    }

    Ok(ResourceSnapshot {
        resource_id,
        growth_multiplier,
        azs,
    })
}

/// Recompute and persist target quotas for one resource. An `Overflow`
/// result is logged and the previous quotas remain untouched; every other
/// error aborts the surrounding transaction.
pub async fn recompute_resource_quotas(
    tx: &mut Transaction<'_, Postgres>,
    resource_id: i64,
    growth_multiplier: f64,
) -> QuotaResult<()> {
    let snapshot = fetch_resource_snapshot(tx, resource_id, growth_multiplier).await?;
    let plan = match compute_resource_quotas(&snapshot) {
        Ok(plan) => plan,
        Err(QuotaError::Overflow(detail)) => {
            warn!(
                resource_id,
                detail, "Quota computation overflowed; keeping previous quotas"
            );
            return Ok(());
        }
        Err(other) => return Err(other),
    };

    for assignment in &plan.az_assignments {
        sqlx::query("UPDATE project_az_resources SET quota = $1 WHERE id = $2")
            .bind(db_from_u64(assignment.quota))
            .bind(assignment.project_az_resource_id)
            .execute(&mut **tx)
            .await?;
    }
    for (project_resource_id, total) in &plan.project_totals {
        sqlx::query("UPDATE project_resources SET quota = $1 WHERE id = $2")
            .bind(db_from_u64(*total))
            .bind(project_resource_id)
            .execute(&mut **tx)
            .await?;
    }

    debug!(
        resource_id,
        assignments = plan.az_assignments.len(),
        "Target quotas recomputed"
    );
    Ok(())
}

/// Fetch the capacity-check input for one (resource, AZ) cell.
pub async fn fetch_capacity_check_input(
    tx: &mut Transaction<'_, Postgres>,
    resource_id: i64,
    az: &str,
    enforced: bool,
) -> QuotaResult<CapacityCheckInput> {
    let raw_capacity: Option<(i64,)> =
        sqlx::query_as("SELECT raw_capacity FROM az_resources WHERE resource_id = $1 AND az = $2")
            .bind(resource_id)
            .bind(az)
            .fetch_optional(&mut **tx)
            .await?;
    let raw_capacity = u64_from_db(raw_capacity.map(|r| r.0).unwrap_or(0));

    let rows: Vec<(i64, i64, Option<i64>)> = sqlx::query_as(
        r#"
        SELECT par.id, par.usage, sums.committed
        FROM project_az_resources par
        JOIN project_resources pr ON pr.id = par.project_resource_id
        LEFT JOIN (
            SELECT az_resource_id, SUM(amount)::BIGINT AS committed
            FROM project_commitments
            WHERE status = 'confirmed'
            GROUP BY az_resource_id
        ) sums ON sums.az_resource_id = par.id
        WHERE pr.resource_id = $1 AND par.az = $2
        "#,
    )
    .bind(resource_id)
    .bind(az)
    .fetch_all(&mut **tx)
    .await?;

    Ok(CapacityCheckInput {
        raw_capacity,
        enforced,
        projects: rows
            .into_iter()
            .map(|(id, usage, committed)| ProjectFloor {
                az_resource_id: id,
                usage: u64_from_db(usage),
                committed: u64_from_db(committed.unwrap_or(0)),
            })
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn project(
        uuid_byte: u8,
        par_id: i64,
        usage: u64,
        committed: u64,
    ) -> ProjectAzSnapshot {
        ProjectAzSnapshot {
            project_uuid: Uuid::from_bytes([uuid_byte; 16]),
            project_az_resource_id: par_id,
            project_resource_id: par_id + 100,
            usage,
            historical_usage: None,
            committed,
            forbidden: false,
            max_quota: None,
        }
    }

    #[test]
    fn test_floors_always_granted() {
        let az = AzSnapshot {
            az: "az-one".into(),
            raw_capacity: 100,
            projects: vec![project(1, 1, 30, 0), project(2, 2, 10, 50)],
        };
        let quotas = compute_az_quotas(&az, 1.0).unwrap();
        assert_eq!(quotas, vec![(1, 30), (2, 50)]);
    }

    #[test]
    fn test_growth_multiplier_grants_headroom() {
        let az = AzSnapshot {
            az: "az-one".into(),
            raw_capacity: 100,
            projects: vec![project(1, 1, 20, 0)],
        };
        // 1.5 × 20 = 30, and there is room for it.
        let quotas = compute_az_quotas(&az, 1.5).unwrap();
        assert_eq!(quotas, vec![(1, 30)]);
    }

    #[test]
    fn test_growth_scales_down_to_fit_capacity() {
        let az = AzSnapshot {
            az: "az-one".into(),
            raw_capacity: 66,
            projects: vec![project(1, 1, 20, 0), project(2, 2, 40, 0)],
        };
        // Floors 60, remaining 6, demands 10 and 20 → shares 2 and 4.
        let quotas = compute_az_quotas(&az, 1.5).unwrap();
        assert_eq!(quotas, vec![(1, 22), (2, 44)]);
    }

    #[test]
    fn test_remainder_goes_to_ascending_uuid() {
        let az = AzSnapshot {
            az: "az-one".into(),
            raw_capacity: 63,
            projects: vec![project(9, 1, 20, 0), project(1, 2, 40, 0)],
        };
        // Floors 60, remaining 3, demands 10 and 20 → bases 1 and 2,
        // leftover 0. Shrink capacity by one to force a remainder:
        let quotas = compute_az_quotas(&az, 1.5).unwrap();
        assert_eq!(quotas.iter().map(|q| q.1).sum::<u64>(), 63);

        let az = AzSnapshot {
            raw_capacity: 64,
            ..az
        };
        // Remaining 4: bases 1 and 2, leftover 1 goes to the lower UUID,
        // which is par_id 2 here.
        let quotas = compute_az_quotas(&az, 1.5).unwrap();
        assert_eq!(quotas, vec![(1, 21), (2, 43)]);
    }

    #[test]
    fn test_forbidden_project_pinned_to_floor() {
        let mut capped = project(1, 1, 20, 0);
        capped.forbidden = true;
        let az = AzSnapshot {
            az: "az-one".into(),
            raw_capacity: 100,
            projects: vec![capped, project(2, 2, 20, 0)],
        };
        let quotas = compute_az_quotas(&az, 2.0).unwrap();
        assert_eq!(quotas, vec![(1, 20), (2, 40)]);
    }

    #[test]
    fn test_admin_ceiling_applies() {
        let mut limited = project(1, 1, 10, 0);
        limited.max_quota = Some(12);
        let az = AzSnapshot {
            az: "az-one".into(),
            raw_capacity: 100,
            projects: vec![limited],
        };
        let quotas = compute_az_quotas(&az, 3.0).unwrap();
        assert_eq!(quotas, vec![(1, 12)]);
    }

    #[test]
    fn test_historical_usage_drives_growth() {
        let mut p = project(1, 1, 5, 0);
        p.historical_usage = Some(20);
        let az = AzSnapshot {
            az: "az-one".into(),
            raw_capacity: 100,
            projects: vec![p],
        };
        let quotas = compute_az_quotas(&az, 1.5).unwrap();
        assert_eq!(quotas, vec![(1, 30)]);
    }

    #[test]
    fn test_overcommitted_az_grants_only_floors() {
        let az = AzSnapshot {
            az: "az-one".into(),
            raw_capacity: 10,
            projects: vec![project(1, 1, 30, 0), project(2, 2, 0, 25)],
        };
        let quotas = compute_az_quotas(&az, 2.0).unwrap();
        assert_eq!(quotas, vec![(1, 30), (2, 25)]);
    }

    #[test]
    fn test_overflow_detected() {
        let az = AzSnapshot {
            az: "az-one".into(),
            raw_capacity: u64::MAX,
            projects: vec![project(1, 1, 0, u64::MAX), project(2, 2, 0, 1)],
        };
        assert!(matches!(
            compute_az_quotas(&az, 1.0),
            Err(QuotaError::Overflow(_))
        ));
    }

    #[test]
    fn test_resource_totals_sum_az_assignments() {
        let mut p1a = project(1, 1, 10, 0);
        let mut p1b = project(1, 3, 5, 0);
        // Same project_resource across two AZs.
        p1a.project_resource_id = 500;
        p1b.project_resource_id = 500;
        let snapshot = ResourceSnapshot {
            resource_id: 7,
            growth_multiplier: 1.0,
            azs: vec![
                AzSnapshot {
                    az: "az-one".into(),
                    raw_capacity: 50,
                    projects: vec![p1a],
                },
                AzSnapshot {
                    az: "az-two".into(),
                    raw_capacity: 50,
                    projects: vec![p1b],
                },
            ],
        };
        let plan = compute_resource_quotas(&snapshot).unwrap();
        assert_eq!(plan.project_totals[&500], 15);
        assert_eq!(plan.az_assignments.len(), 2);
    }

    // ── Capacity check ──────────────────────────────────────────────────

    fn scenario_one_input() -> CapacityCheckInput {
        // Resource compute/cores in az-one: capacity 10, berlin usage 2,
        // other projects usage 4.
        CapacityCheckInput {
            raw_capacity: 10,
            enforced: true,
            projects: vec![
                ProjectFloor {
                    az_resource_id: 1,
                    committed: 0,
                    usage: 2,
                },
                ProjectFloor {
                    az_resource_id: 2,
                    committed: 0,
                    usage: 4,
                },
            ],
        }
    }

    #[test]
    fn test_capacity_check_scenario() {
        let mut input = scenario_one_input();
        // amount=6 for berlin fits: max(6,2) + 4 = 10 <= 10.
        assert!(check_commitment_delta(&input, 1, 6).is_ok());

        // After confirmation, one more unit does not fit.
        input.projects[0].committed = 6;
        assert!(matches!(
            check_commitment_delta(&input, 1, 1),
            Err(QuotaError::CapacityExceeded(_))
        ));
    }

    #[test]
    fn test_capacity_check_skipped_when_not_enforced() {
        let mut input = scenario_one_input();
        input.enforced = false;
        assert!(check_commitment_delta(&input, 1, 1_000_000).is_ok());
    }

    #[test]
    fn test_capacity_check_target_without_existing_row() {
        let input = scenario_one_input();
        // Target cell 99 has no row yet; its delta still counts.
        assert!(check_commitment_delta(&input, 99, 4).is_ok());
        assert!(check_commitment_delta(&input, 99, 5).is_err());
    }

    // ── Property tests ──────────────────────────────────────────────────

    proptest! {
        #[test]
        fn prop_quotas_never_undercut_floors_without_ceiling(
            capacity in 0u64..10_000,
            demands in prop::collection::vec((0u64..500, 0u64..500), 1..8),
        ) {
            let projects: Vec<ProjectAzSnapshot> = demands
                .iter()
                .enumerate()
                .map(|(i, &(usage, committed))| project(i as u8, i as i64, usage, committed))
                .collect();
            let az = AzSnapshot { az: "az".into(), raw_capacity: capacity, projects };
            let quotas = compute_az_quotas(&az, 1.5).unwrap();
            for (p, (_, quota)) in az.projects.iter().zip(quotas.iter()) {
                prop_assert!(*quota >= p.floor());
            }
        }

        #[test]
        fn prop_growth_fits_within_capacity(
            capacity in 0u64..10_000,
            demands in prop::collection::vec((0u64..500, 0u64..500), 1..8),
        ) {
            let projects: Vec<ProjectAzSnapshot> = demands
                .iter()
                .enumerate()
                .map(|(i, &(usage, committed))| project(i as u8, i as i64, usage, committed))
                .collect();
            let az = AzSnapshot { az: "az".into(), raw_capacity: capacity, projects };
            let quotas = compute_az_quotas(&az, 2.0).unwrap();

            let floors: u64 = az.projects.iter().map(|p| p.floor()).sum();
            let total: u64 = quotas.iter().map(|q| q.1).sum();
            // Growth never allocates past capacity; only floors may.
            prop_assert!(total <= capacity.max(floors));
        }

        #[test]
        fn prop_distribution_is_deterministic(
            capacity in 0u64..10_000,
            demands in prop::collection::vec((0u64..500, 0u64..500), 1..8),
        ) {
            let projects: Vec<ProjectAzSnapshot> = demands
                .iter()
                .enumerate()
                .map(|(i, &(usage, committed))| project(i as u8, i as i64, usage, committed))
                .collect();
            let az = AzSnapshot { az: "az".into(), raw_capacity: capacity, projects };
            prop_assert_eq!(
                compute_az_quotas(&az, 1.3).unwrap(),
                compute_az_quotas(&az, 1.3).unwrap()
            );
        }
    }
}
