/// Liquid driver facade
/// Uniform RPC surface to each backend service: service info, capacity
/// reports, per-project usage reports, and the commitment-change hook that
/// lets a backend veto commitment transitions.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::errors::QuotaError;
use crate::models::{CommitmentStatus, ResourceTopology};

#[derive(Error, Debug)]
pub enum LiquidError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(String),
    #[error("backend returned error: {0}")]
    Backend(String),
    #[error("invalid response format: {0}")]
    InvalidResponse(String),
    #[error("network timeout")]
    Timeout,
}

impl From<LiquidError> for QuotaError {
    fn from(err: LiquidError) -> Self {
        QuotaError::Driver(err.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// WIRE TYPES
// ═══════════════════════════════════════════════════════════════════════════

/// Result of `get_info`. A version increment signals a schema change;
/// callers re-read their cached copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub version: i64,
    pub resources: HashMap<String, ResourceInfo>,
    #[serde(default)]
    pub rates: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInfo {
    pub unit: String,
    pub topology: ResourceTopology,
    pub has_capacity: bool,
    pub has_quota: bool,
    #[serde(default)]
    pub handles_commitments: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapacityReport {
    pub resources: HashMap<String, ResourceCapacityReport>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceCapacityReport {
    pub per_az: HashMap<String, AzCapacity>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AzCapacity {
    pub capacity: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageReport {
    pub resources: HashMap<String, ResourceUsageReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsageReport {
    pub per_az: HashMap<String, AzUsage>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzUsage {
    pub usage: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_usage: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub historical_usage: Option<u64>,
}

/// The commitment-change payload. For resources that handle commitments
/// themselves, the backend's decision on this payload is authoritative;
/// dry runs and actual writes carry identical payloads apart from `dry_run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitmentChangeRequest {
    pub az: String,
    pub info_version: i64,
    pub by_project: HashMap<Uuid, ProjectCommitmentChangeset>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectCommitmentChangeset {
    pub by_resource: HashMap<String, ResourceCommitmentChangeset>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceCommitmentChangeset {
    pub total_confirmed_before: u64,
    pub total_confirmed_after: u64,
    pub commitments: Vec<CommitmentChangeEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitmentChangeEntry {
    pub uuid: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_status: Option<CommitmentStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_status: Option<CommitmentStatus>,
    pub amount: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirm_by: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeCommitmentsResponse {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ChangeCommitmentsResponse {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.into()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// DRIVER TRAIT
// ═══════════════════════════════════════════════════════════════════════════

#[async_trait]
pub trait LiquidDriver: Send + Sync {
    async fn get_info(&self) -> Result<ServiceInfo, LiquidError>;

    async fn get_capacity_report(&self, azs: &[String]) -> Result<CapacityReport, LiquidError>;

    async fn get_usage_report(
        &self,
        project: Uuid,
        azs: &[String],
    ) -> Result<UsageReport, LiquidError>;

    async fn change_commitments(
        &self,
        req: &CommitmentChangeRequest,
    ) -> Result<ChangeCommitmentsResponse, LiquidError>;
}

// ═══════════════════════════════════════════════════════════════════════════
// HTTP CLIENT
// ═══════════════════════════════════════════════════════════════════════════

/// Production driver implementation speaking HTTP+JSON to a liquid endpoint.
pub struct HttpLiquidClient {
    endpoint: String,
    client: reqwest::Client,
    request_timeout: Duration,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReportRequestBody<'a> {
    availability_zones: &'a [String],
}

impl HttpLiquidClient {
    pub fn new(endpoint: String, timeout_secs: u64) -> Self {
        let request_timeout = Duration::from_secs(timeout_secs);
        let client = reqwest::ClientBuilder::new()
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        HttpLiquidClient {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
            request_timeout,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: String) -> Result<T, LiquidError> {
        debug!("GET {}", url);
        let response = self
            .client
            .get(&url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(classify_reqwest_error)?;
        decode_response(response).await
    }

    async fn post_json<B: Serialize, T: serde::de::DeserializeOwned>(
        &self,
        url: String,
        body: &B,
    ) -> Result<T, LiquidError> {
        debug!("POST {}", url);
        let response = self
            .client
            .post(&url)
            .timeout(self.request_timeout)
            .json(body)
            .send()
            .await
            .map_err(classify_reqwest_error)?;
        decode_response(response).await
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> LiquidError {
    if err.is_timeout() {
        LiquidError::Timeout
    } else {
        LiquidError::RequestFailed(err.to_string())
    }
}

async fn decode_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, LiquidError> {
    if !response.status().is_success() {
        return Err(LiquidError::Backend(format!(
            "HTTP {}: {}",
            response.status(),
            response.text().await.unwrap_or_default()
        )));
    }
    response
        .json()
        .await
        .map_err(|e| LiquidError::InvalidResponse(e.to_string()))
}

#[async_trait]
impl LiquidDriver for HttpLiquidClient {
    async fn get_info(&self) -> Result<ServiceInfo, LiquidError> {
        self.get_json(format!("{}/v1/info", self.endpoint)).await
    }

    async fn get_capacity_report(&self, azs: &[String]) -> Result<CapacityReport, LiquidError> {
        self.post_json(
            format!("{}/v1/report-capacity", self.endpoint),
            &ReportRequestBody {
                availability_zones: azs,
            },
        )
        .await
    }

    async fn get_usage_report(
        &self,
        project: Uuid,
        azs: &[String],
    ) -> Result<UsageReport, LiquidError> {
        self.post_json(
            format!("{}/v1/projects/{}/report-usage", self.endpoint, project),
            &ReportRequestBody {
                availability_zones: azs,
            },
        )
        .await
    }

    async fn change_commitments(
        &self,
        req: &CommitmentChangeRequest,
    ) -> Result<ChangeCommitmentsResponse, LiquidError> {
        self.post_json(format!("{}/v1/change-commitments", self.endpoint), req)
            .await
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// DRIVER REGISTRY
// ═══════════════════════════════════════════════════════════════════════════

/// One driver per configured service type.
pub struct DriverRegistry {
    drivers: HashMap<String, std::sync::Arc<dyn LiquidDriver>>,
}

impl DriverRegistry {
    pub fn empty() -> Self {
        DriverRegistry {
            drivers: HashMap::new(),
        }
    }

    /// Build HTTP clients for every service in the cluster config.
    pub fn from_config(config: &crate::config::ClusterConfig) -> Self {
        let mut drivers: HashMap<String, std::sync::Arc<dyn LiquidDriver>> = HashMap::new();
        for service in &config.services {
            drivers.insert(
                service.service_type.clone(),
                std::sync::Arc::new(HttpLiquidClient::new(
                    service.liquid.endpoint.clone(),
                    service.liquid.timeout_secs,
                )),
            );
        }
        DriverRegistry { drivers }
    }

    /// Register or replace a driver; tests use this to install mocks.
    pub fn insert(&mut self, service_type: impl Into<String>, driver: std::sync::Arc<dyn LiquidDriver>) {
        self.drivers.insert(service_type.into(), driver);
    }

    pub fn get(&self, service_type: &str) -> Option<std::sync::Arc<dyn LiquidDriver>> {
        self.drivers.get(service_type).cloned()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// MOCK CLIENT
// ═══════════════════════════════════════════════════════════════════════════

/// In-memory driver for tests: preset reports, scripted failures, and a
/// recording of every commitment-change payload it receives.
pub struct MockLiquidClient {
    state: Mutex<MockState>,
}

struct MockState {
    info: ServiceInfo,
    capacity: CapacityReport,
    usage_by_project: HashMap<Uuid, UsageReport>,
    change_response: ChangeCommitmentsResponse,
    change_requests: Vec<CommitmentChangeRequest>,
    fail_next: Option<String>,
}

impl Default for MockLiquidClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLiquidClient {
    pub fn new() -> Self {
        MockLiquidClient {
            state: Mutex::new(MockState {
                info: ServiceInfo {
                    version: 1,
                    resources: HashMap::new(),
                    rates: serde_json::Value::Null,
                },
                capacity: CapacityReport::default(),
                usage_by_project: HashMap::new(),
                change_response: ChangeCommitmentsResponse::accepted(),
                change_requests: Vec::new(),
                fail_next: None,
            }),
        }
    }

    pub fn set_info(&self, info: ServiceInfo) {
        self.state.lock().unwrap().info = info;
    }

    pub fn set_capacity(&self, report: CapacityReport) {
        self.state.lock().unwrap().capacity = report;
    }

    pub fn set_usage(&self, project: Uuid, report: UsageReport) {
        self.state
            .lock()
            .unwrap()
            .usage_by_project
            .insert(project, report);
    }

    pub fn set_change_response(&self, response: ChangeCommitmentsResponse) {
        self.state.lock().unwrap().change_response = response;
    }

    /// Make the next call fail with a transient error.
    pub fn fail_next(&self, message: impl Into<String>) {
        self.state.lock().unwrap().fail_next = Some(message.into());
    }

    pub fn recorded_change_requests(&self) -> Vec<CommitmentChangeRequest> {
        self.state.lock().unwrap().change_requests.clone()
    }

    fn take_failure(&self) -> Option<LiquidError> {
        self.state
            .lock()
            .unwrap()
            .fail_next
            .take()
            .map(LiquidError::RequestFailed)
    }
}

#[async_trait]
impl LiquidDriver for MockLiquidClient {
    async fn get_info(&self) -> Result<ServiceInfo, LiquidError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        Ok(self.state.lock().unwrap().info.clone())
    }

    async fn get_capacity_report(&self, _azs: &[String]) -> Result<CapacityReport, LiquidError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        Ok(self.state.lock().unwrap().capacity.clone())
    }

    async fn get_usage_report(
        &self,
        project: Uuid,
        _azs: &[String],
    ) -> Result<UsageReport, LiquidError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let state = self.state.lock().unwrap();
        state
            .usage_by_project
            .get(&project)
            .cloned()
            .ok_or_else(|| LiquidError::Backend(format!("unknown project: {}", project)))
    }

    async fn change_commitments(
        &self,
        req: &CommitmentChangeRequest,
    ) -> Result<ChangeCommitmentsResponse, LiquidError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let mut state = self.state.lock().unwrap();
        state.change_requests.push(req.clone());
        Ok(state.change_response.clone())
    }
}
