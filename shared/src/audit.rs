/// Audit adapter
/// Records successful state transitions as structured CADF-style events for
/// an external write-only sink. Events are emitted only after the enclosing
/// transaction has committed; a failed operation leaves no trace here.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::models::ProjectCommitment;

pub const COMMITMENT_TYPE_URI: &str = "service/resources/commitment";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommitmentAction {
    Create,
    Delete,
    Split,
    Merge,
    Convert,
    Renew,
    UpdateDuration,
    StartTransfer,
    AcceptTransfer,
    Confirm,
    Expire,
}

impl std::fmt::Display for CommitmentAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CommitmentAction::Create => "create",
            CommitmentAction::Delete => "delete",
            CommitmentAction::Split => "split",
            CommitmentAction::Merge => "merge",
            CommitmentAction::Convert => "convert",
            CommitmentAction::Renew => "renew",
            CommitmentAction::UpdateDuration => "update-duration",
            CommitmentAction::StartTransfer => "start-transfer",
            CommitmentAction::AcceptTransfer => "accept-transfer",
            CommitmentAction::Confirm => "confirm",
            CommitmentAction::Expire => "expire",
        };
        write!(f, "{}", s)
    }
}

/// A CADF envelope with the full commitment object attached as JSON.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub id: Uuid,
    pub event_time: String,
    pub action: CommitmentAction,
    pub outcome: String,
    pub initiator: AuditInitiator,
    pub target: AuditTarget,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditInitiator {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditTarget {
    pub type_uri: String,
    pub id: Uuid,
    pub project_id: Uuid,
    pub attachments: Vec<serde_json::Value>,
}

impl AuditEvent {
    pub fn for_commitment(
        action: CommitmentAction,
        at: DateTime<Utc>,
        initiator_uuid: Uuid,
        initiator_name: &str,
        project_uuid: Uuid,
        commitment: &ProjectCommitment,
    ) -> Self {
        let attachment = serde_json::to_value(commitment).unwrap_or(serde_json::Value::Null);
        AuditEvent {
            id: Uuid::new_v4(),
            event_time: at.to_rfc3339_opts(SecondsFormat::Millis, true),
            action,
            outcome: "success".to_string(),
            initiator: AuditInitiator {
                id: initiator_uuid,
                name: initiator_name.to_string(),
            },
            target: AuditTarget {
                type_uri: COMMITMENT_TYPE_URI.to_string(),
                id: commitment.uuid,
                project_id: project_uuid,
                attachments: vec![attachment],
            },
        }
    }
}

/// Write-only event sink.
pub trait Auditor: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Default sink: one structured log line per event.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAuditor;

impl Auditor for LogAuditor {
    fn record(&self, event: AuditEvent) {
        match serde_json::to_string(&event) {
            Ok(payload) => tracing::info!(target: "audit", action = %event.action, %payload, "audit event"),
            Err(err) => tracing::error!(target: "audit", error = %err, "failed to serialize audit event"),
        }
    }
}

/// Test sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct CapturingAuditor {
    events: std::sync::Mutex<Vec<AuditEvent>>,
}

impl CapturingAuditor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl Auditor for CapturingAuditor {
    fn record(&self, event: AuditEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CommitmentStatus, TransferStatus};
    use chrono::TimeZone;

    fn sample_commitment() -> ProjectCommitment {
        ProjectCommitment {
            id: 1,
            uuid: Uuid::from_bytes([7; 16]),
            az_resource_id: 10,
            amount: 25,
            duration: "2 hours".into(),
            created_at: Utc.with_ymd_and_hms(2026, 5, 1, 8, 0, 0).unwrap(),
            creator_uuid: Uuid::from_bytes([1; 16]),
            creator_name: "alice".into(),
            confirm_by: None,
            confirmed_at: None,
            expires_at: Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap(),
            status: CommitmentStatus::Confirmed,
            transfer_status: TransferStatus::None,
            transfer_token: None,
            predecessor_id: None,
            creation_context: serde_json::json!({"reason": "create"}),
            supersede_context: None,
            notify_on_confirm: false,
        }
    }

    #[test]
    fn test_event_carries_commitment_attachment() {
        let commitment = sample_commitment();
        let event = AuditEvent::for_commitment(
            CommitmentAction::Create,
            Utc.with_ymd_and_hms(2026, 5, 1, 8, 0, 0).unwrap(),
            Uuid::from_bytes([1; 16]),
            "alice",
            Uuid::from_bytes([2; 16]),
            &commitment,
        );
        assert_eq!(event.target.type_uri, COMMITMENT_TYPE_URI);
        assert_eq!(event.target.attachments.len(), 1);
        assert_eq!(event.target.attachments[0]["amount"], 25);
        assert_eq!(event.outcome, "success");
    }

    #[test]
    fn test_capturing_auditor_records_in_order() {
        let auditor = CapturingAuditor::new();
        let commitment = sample_commitment();
        for action in [CommitmentAction::Create, CommitmentAction::Split] {
            auditor.record(AuditEvent::for_commitment(
                action,
                Utc::now(),
                Uuid::nil(),
                "alice",
                Uuid::nil(),
                &commitment,
            ));
        }
        let events = auditor.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, CommitmentAction::Create);
        assert_eq!(events[1].action, CommitmentAction::Split);
    }
}
