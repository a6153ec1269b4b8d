/// Request and response bodies for the HTTP surface. Translation into core
/// operations happens here so handlers stay thin.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::commitment::CreateRequest;
use shared::models::TransferStatus;
use shared::reports::CommitmentReport;

use crate::error::ApiError;

#[derive(Debug, Clone, Deserialize)]
pub struct NewCommitmentRequest {
    pub service_type: String,
    pub resource_name: String,
    pub availability_zone: String,
    pub amount: u64,
    pub duration: String,
    #[serde(default)]
    pub confirm_by: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notify_on_confirm: bool,
}

impl NewCommitmentRequest {
    pub fn into_create_request(self) -> Result<CreateRequest, ApiError> {
        let duration = self
            .duration
            .parse()
            .map_err(|err: String| ApiError::unprocessable(format!("invalid duration: {}", err)))?;
        Ok(CreateRequest {
            service_type: self.service_type,
            resource_name: self.resource_name,
            availability_zone: self.availability_zone,
            amount: self.amount,
            duration,
            confirm_by: self.confirm_by,
            notify_on_confirm: self.notify_on_confirm,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct CommitmentResponse {
    pub commitment: CommitmentReport,
}

#[derive(Debug, Serialize)]
pub struct CommitmentListResponse {
    pub commitments: Vec<CommitmentReport>,
}

#[derive(Debug, Serialize)]
pub struct SplitResponse {
    pub commitments: Vec<CommitmentReport>,
}

#[derive(Debug, Serialize)]
pub struct CanConfirmResponse {
    pub result: bool,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub service: Option<String>,
    pub resource: Option<String>,
    #[serde(default)]
    pub include_inactive: bool,
}

#[derive(Debug, Deserialize)]
pub struct StartTransferRequest {
    pub amount: u64,
    pub transfer_status: TransferStatus,
}

#[derive(Debug, Deserialize)]
pub struct ConvertRequest {
    pub source_amount: u64,
    pub target_service_type: String,
    pub target_resource_name: String,
    pub target_amount: u64,
}

#[derive(Debug, Deserialize)]
pub struct MergeRequest {
    pub commitment_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateDurationRequest {
    pub duration: String,
}

#[derive(Debug, Deserialize)]
pub struct MaxQuotaEntry {
    pub service_type: String,
    pub resource_name: String,
    /// None lifts the ceiling.
    pub max_quota: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub database: String,
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_commitment_request_parses_duration() {
        let body: NewCommitmentRequest = serde_json::from_value(serde_json::json!({
            "service_type": "compute",
            "resource_name": "cores",
            "availability_zone": "az-one",
            "amount": 6,
            "duration": "10 hours"
        }))
        .unwrap();
        let req = body.into_create_request().unwrap();
        assert_eq!(req.amount, 6);
        assert_eq!(req.duration.to_string(), "10 hours");
        assert!(req.confirm_by.is_none());
        assert!(!req.notify_on_confirm);
    }

    #[test]
    fn test_new_commitment_request_rejects_bad_duration() {
        let body: NewCommitmentRequest = serde_json::from_value(serde_json::json!({
            "service_type": "compute",
            "resource_name": "cores",
            "availability_zone": "az-one",
            "amount": 6,
            "duration": "ten hours"
        }))
        .unwrap();
        assert!(body.into_create_request().is_err());
    }

    #[test]
    fn test_transfer_status_deserializes_lowercase() {
        let req: StartTransferRequest = serde_json::from_value(serde_json::json!({
            "amount": 9,
            "transfer_status": "unlisted"
        }))
        .unwrap();
        assert_eq!(req.transfer_status, TransferStatus::Unlisted);
    }
}
