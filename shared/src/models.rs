use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Sentinel availability zone used by resources with flat topology.
pub const AZ_ANY: &str = "any";

// ═══════════════════════════════════════════════════════════════════════════
// SERVICES, RESOURCES, CAPACITY
// ═══════════════════════════════════════════════════════════════════════════

/// A backend service class (e.g. "compute"). Identity is its type string.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Service {
    pub id: i64,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub service_type: String,
    pub liquid_version: i64,
}

/// Whether a resource is tracked per availability zone or cluster-wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ResourceTopology {
    Flat,
    AzAware,
}

impl std::fmt::Display for ResourceTopology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceTopology::Flat => write!(f, "flat"),
            ResourceTopology::AzAware => write!(f, "az-aware"),
        }
    }
}

impl ResourceTopology {
    /// Check that a given AZ name is acceptable for this topology.
    pub fn accepts_az(&self, az: &str) -> bool {
        match self {
            ResourceTopology::Flat => az == AZ_ANY,
            ResourceTopology::AzAware => az != AZ_ANY && !az.is_empty(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Resource {
    pub id: i64,
    pub service_id: i64,
    pub name: String,
    pub unit: String,
    pub topology: ResourceTopology,
    pub has_capacity: bool,
    pub has_quota: bool,
    pub handles_commitments: bool,
}

/// One capacity/usage snapshot row per (resource, AZ).
/// Mutated only by the capacity scraper.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AzResource {
    pub id: i64,
    pub resource_id: i64,
    pub az: String,
    pub raw_capacity: i64,
    pub usage: i64,
}

// ═══════════════════════════════════════════════════════════════════════════
// TENANCY
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Domain {
    pub id: i64,
    pub uuid: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Project {
    pub id: i64,
    pub uuid: Uuid,
    pub domain_id: i64,
    pub name: String,
    pub recipient: Option<String>,
}

/// Scheduler row for the usage scraper, one per (project, service) pair.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProjectService {
    pub id: i64,
    pub project_id: i64,
    pub service_id: i64,
    pub scraped_at: Option<DateTime<Utc>>,
    pub next_scrape_at: DateTime<Utc>,
    pub stale: bool,
    pub scrape_error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProjectResource {
    pub id: i64,
    pub project_service_id: i64,
    pub resource_id: i64,
    pub quota: Option<i64>,
    pub max_quota_from_local_admin: Option<i64>,
    pub max_quota_from_outside_admin: Option<i64>,
    pub forbidden: bool,
}

impl ProjectResource {
    /// Effective administrative ceiling, if any admin has set one.
    pub fn max_quota(&self) -> Option<i64> {
        match (
            self.max_quota_from_outside_admin,
            self.max_quota_from_local_admin,
        ) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }
}

/// Usage snapshot per (project resource, AZ). Mutated only by the usage
/// scraper; `quota` holds the published per-AZ share for az-aware resources.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProjectAzResource {
    pub id: i64,
    pub project_resource_id: i64,
    pub az: String,
    pub usage: i64,
    pub physical_usage: Option<i64>,
    pub historical_usage: Option<i64>,
    pub quota: Option<i64>,
}

// ═══════════════════════════════════════════════════════════════════════════
// COMMITMENTS
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "commitment_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CommitmentStatus {
    Planned,
    Pending,
    Confirmed,
    Superseded,
    Expired,
}

impl CommitmentStatus {
    /// Terminal states can never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CommitmentStatus::Superseded | CommitmentStatus::Expired)
    }

    /// Active commitments appear in listings and can be operated on.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for CommitmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CommitmentStatus::Planned => "planned",
            CommitmentStatus::Pending => "pending",
            CommitmentStatus::Confirmed => "confirmed",
            CommitmentStatus::Superseded => "superseded",
            CommitmentStatus::Expired => "expired",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "transfer_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    None,
    Unlisted,
    Public,
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransferStatus::None => "none",
            TransferStatus::Unlisted => "unlisted",
            TransferStatus::Public => "public",
        };
        write!(f, "{}", s)
    }
}

/// Why a commitment came into existence or was superseded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitmentReason {
    Create,
    Split,
    Merge,
    Convert,
    Renew,
}

/// Workflow context stored in the JSONB columns. The schema is open:
/// unknown keys survive a read-modify-write cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitmentContext {
    pub reason: CommitmentReason,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_commitment_uuids: Vec<Uuid>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl CommitmentContext {
    pub fn new(reason: CommitmentReason) -> Self {
        Self {
            reason,
            related_commitment_uuids: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_related(reason: CommitmentReason, related: Vec<Uuid>) -> Self {
        Self {
            reason,
            related_commitment_uuids: related,
            extra: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProjectCommitment {
    pub id: i64,
    pub uuid: Uuid,
    pub az_resource_id: i64,
    pub amount: i64,
    pub duration: String,
    pub created_at: DateTime<Utc>,
    pub creator_uuid: Uuid,
    pub creator_name: String,
    pub confirm_by: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub status: CommitmentStatus,
    pub transfer_status: TransferStatus,
    pub transfer_token: Option<String>,
    pub predecessor_id: Option<i64>,
    pub creation_context: serde_json::Value,
    pub supersede_context: Option<serde_json::Value>,
    pub notify_on_confirm: bool,
}

impl ProjectCommitment {
    /// The parsed creation context, falling back to `create` when the stored
    /// JSON predates the current schema.
    pub fn creation_reason(&self) -> CommitmentReason {
        serde_json::from_value::<CommitmentContext>(self.creation_context.clone())
            .map(|c| c.reason)
            .unwrap_or(CommitmentReason::Create)
    }

    /// Confirmed commitments count toward the capacity floor.
    pub fn counts_toward_capacity(&self) -> bool {
        self.status == CommitmentStatus::Confirmed
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SCHEDULERS
// ═══════════════════════════════════════════════════════════════════════════

/// Scheduler row for the capacity scraper, one per backend capacity driver.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ClusterCapacitor {
    pub id: i64,
    pub capacitor_id: String,
    pub next_scrape_at: DateTime<Utc>,
    pub scrape_error: String,
}

/// Deferred per-project notification with retry accounting.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MailNotification {
    pub id: i64,
    pub project_id: i64,
    pub subject: String,
    pub body: String,
    pub next_submission_at: DateTime<Utc>,
    pub failed_submissions: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topology_accepts_az() {
        assert!(ResourceTopology::Flat.accepts_az(AZ_ANY));
        assert!(!ResourceTopology::Flat.accepts_az("az-one"));
        assert!(ResourceTopology::AzAware.accepts_az("az-one"));
        assert!(!ResourceTopology::AzAware.accepts_az(AZ_ANY));
        assert!(!ResourceTopology::AzAware.accepts_az(""));
    }

    #[test]
    fn test_status_serde_is_lowercase() {
        let s = serde_json::to_string(&CommitmentStatus::Confirmed).unwrap();
        assert_eq!(s, r#""confirmed""#);
        let s = serde_json::to_string(&TransferStatus::Unlisted).unwrap();
        assert_eq!(s, r#""unlisted""#);
    }

    #[test]
    fn test_status_terminality() {
        assert!(CommitmentStatus::Superseded.is_terminal());
        assert!(CommitmentStatus::Expired.is_terminal());
        assert!(CommitmentStatus::Planned.is_active());
        assert!(CommitmentStatus::Pending.is_active());
        assert!(CommitmentStatus::Confirmed.is_active());
    }

    #[test]
    fn test_commitment_context_keeps_unknown_keys() {
        let raw = serde_json::json!({
            "reason": "split",
            "related_commitment_uuids": ["8a7b9c1e-0000-4000-8000-000000000001"],
            "operator_note": "requested by customer"
        });
        let ctx: CommitmentContext = serde_json::from_value(raw).unwrap();
        assert_eq!(ctx.reason, CommitmentReason::Split);
        assert_eq!(ctx.related_commitment_uuids.len(), 1);

        let back = serde_json::to_value(&ctx).unwrap();
        assert_eq!(back["operator_note"], "requested by customer");
    }

    #[test]
    fn test_max_quota_combines_admin_ceilings() {
        let mut pr = ProjectResource {
            id: 1,
            project_service_id: 1,
            resource_id: 1,
            quota: None,
            max_quota_from_local_admin: Some(100),
            max_quota_from_outside_admin: Some(80),
            forbidden: false,
        };
        assert_eq!(pr.max_quota(), Some(80));
        pr.max_quota_from_outside_admin = None;
        assert_eq!(pr.max_quota(), Some(100));
        pr.max_quota_from_local_admin = None;
        assert_eq!(pr.max_quota(), None);
    }
}
