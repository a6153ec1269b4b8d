/// Mail notification queue
/// Deferred per-project notifications written inside commitment
/// transactions and delivered later by the collector's mail worker.

use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use thiserror::Error;

use crate::config::MailConfig;
use crate::errors::QuotaResult;
use crate::models::{MailNotification, Project, ProjectCommitment};

/// Retry interval after a transient delivery failure.
pub const RETRY_INTERVAL_SECS: i64 = 120;

#[derive(Error, Debug)]
pub enum MailError {
    /// The project has no usable recipient; the row is dropped, not retried.
    #[error("undeliverable mail: {0}")]
    Undeliverable(String),
    #[error("mail delivery failed: {0}")]
    Transient(String),
}

/// Replace `{{placeholder}}` markers in a template.
pub fn render_template(template: &str, substitutions: &[(&str, String)]) -> String {
    let mut rendered = template.to_string();
    for (key, value) in substitutions {
        rendered = rendered.replace(&format!("{{{{{}}}}}", key), value);
    }
    rendered
}

/// Render subject and body for a confirmed commitment.
pub fn render_confirmation(
    config: &MailConfig,
    project_name: &str,
    resource: &str,
    unit: &str,
    az: &str,
    commitment: &ProjectCommitment,
) -> (String, String) {
    let substitutions = [
        ("project", project_name.to_string()),
        ("resource", resource.to_string()),
        ("unit", unit.to_string()),
        ("amount", commitment.amount.to_string()),
        ("az", az.to_string()),
        ("duration", commitment.duration.clone()),
        ("commitment", commitment.uuid.to_string()),
    ];
    (
        render_template(&config.subject_template, &substitutions),
        render_template(&config.body_template, &substitutions),
    )
}

/// Queue a notification inside the caller's transaction.
pub async fn enqueue(
    tx: &mut Transaction<'_, Postgres>,
    project_id: i64,
    subject: &str,
    body: &str,
    now: DateTime<Utc>,
) -> QuotaResult<i64> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO mail_notifications (project_id, subject, body, next_submission_at)
        VALUES ($1, $2, $3, $4)
        RETURNING id
        "#,
    )
    .bind(project_id)
    .bind(subject)
    .bind(body)
    .bind(now)
    .fetch_one(&mut **tx)
    .await?;
    Ok(id)
}

/// Claim the next due notification, pushing `next_submission_at` forward in
/// the same statement so concurrent workers cannot take the same row.
pub async fn claim_next_due(
    pool: &PgPool,
    now: DateTime<Utc>,
) -> QuotaResult<Option<MailNotification>> {
    let row: Option<MailNotification> = sqlx::query_as(
        r#"
        UPDATE mail_notifications
        SET next_submission_at = $2
        WHERE id = (
            SELECT id FROM mail_notifications
            WHERE next_submission_at <= $1
            ORDER BY id
            LIMIT 1
            FOR UPDATE SKIP LOCKED
        )
        RETURNING *
        "#,
    )
    .bind(now)
    .bind(now + chrono::Duration::seconds(RETRY_INTERVAL_SECS))
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn delete(pool: &PgPool, id: i64) -> QuotaResult<()> {
    sqlx::query("DELETE FROM mail_notifications WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Record a transient failure: bump the counter and schedule the retry.
pub async fn record_failure(pool: &PgPool, id: i64, now: DateTime<Utc>) -> QuotaResult<()> {
    sqlx::query(
        r#"
        UPDATE mail_notifications
        SET failed_submissions = failed_submissions + 1,
            next_submission_at = $2
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(now + chrono::Duration::seconds(RETRY_INTERVAL_SECS))
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn queue_depth(pool: &PgPool) -> QuotaResult<i64> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM mail_notifications")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

// ═══════════════════════════════════════════════════════════════════════════
// DELIVERY CLIENT
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize)]
struct OutgoingMail<'a> {
    recipient: &'a str,
    subject: &'a str,
    body: &'a str,
}

#[async_trait]
pub trait MailClient: Send + Sync {
    /// Deliver one message. The recipient comes from current project
    /// metadata, resolved at delivery time rather than enqueue time.
    async fn deliver(&self, project: &Project, subject: &str, body: &str)
        -> Result<(), MailError>;
}

/// Posts messages to an HTTP mail gateway.
pub struct HttpMailClient {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpMailClient {
    pub fn new(endpoint: String) -> Self {
        let client = reqwest::ClientBuilder::new()
            .timeout(StdDuration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        HttpMailClient { endpoint, client }
    }
}

#[async_trait]
impl MailClient for HttpMailClient {
    async fn deliver(
        &self,
        project: &Project,
        subject: &str,
        body: &str,
    ) -> Result<(), MailError> {
        let recipient = project
            .recipient
            .as_deref()
            .filter(|r| !r.is_empty())
            .ok_or_else(|| {
                MailError::Undeliverable(format!("project {} has no recipient", project.name))
            })?;

        let response = self
            .client
            .post(&self.endpoint)
            .json(&OutgoingMail {
                recipient,
                subject,
                body,
            })
            .send()
            .await
            .map_err(|e| MailError::Transient(e.to_string()))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            // A permanent rejection of the recipient is not worth retrying.
            reqwest::StatusCode::UNPROCESSABLE_ENTITY => Err(MailError::Undeliverable(format!(
                "gateway rejected recipient for project {}",
                project.name
            ))),
            status => Err(MailError::Transient(format!("gateway returned {}", status))),
        }
    }
}

/// Scriptable client for tests.
pub struct MockMailClient {
    outcomes: std::sync::Mutex<Vec<Result<(), MailError>>>,
    delivered: std::sync::Mutex<Vec<(String, String)>>,
}

impl Default for MockMailClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMailClient {
    pub fn new() -> Self {
        MockMailClient {
            outcomes: std::sync::Mutex::new(Vec::new()),
            delivered: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Queue the outcome for the next delivery; defaults to success.
    pub fn push_outcome(&self, outcome: Result<(), MailError>) {
        self.outcomes.lock().unwrap().push(outcome);
    }

    pub fn delivered(&self) -> Vec<(String, String)> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailClient for MockMailClient {
    async fn deliver(
        &self,
        project: &Project,
        subject: &str,
        body: &str,
    ) -> Result<(), MailError> {
        if project.recipient.as_deref().unwrap_or("").is_empty() {
            return Err(MailError::Undeliverable(format!(
                "project {} has no recipient",
                project.name
            )));
        }
        let outcome = {
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.is_empty() {
                Ok(())
            } else {
                outcomes.remove(0)
            }
        };
        if outcome.is_ok() {
            self.delivered
                .lock()
                .unwrap()
                .push((subject.to_string(), body.to_string()));
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CommitmentStatus, TransferStatus};
    use uuid::Uuid;

    #[test]
    fn test_render_template_replaces_all_markers() {
        let rendered = render_template(
            "{{project}}: {{amount}} of {{resource}}",
            &[
                ("project", "berlin".to_string()),
                ("amount", "10".to_string()),
                ("resource", "cores".to_string()),
            ],
        );
        assert_eq!(rendered, "berlin: 10 of cores");
    }

    #[test]
    fn test_render_template_leaves_unknown_markers() {
        let rendered = render_template("{{x}} {{y}}", &[("x", "1".to_string())]);
        assert_eq!(rendered, "1 {{y}}");
    }

    #[test]
    fn test_render_confirmation() {
        let config = MailConfig {
            endpoint: None,
            subject_template: "Commitment confirmed in {{project}}".to_string(),
            body_template: "{{amount}} {{unit}} of {{resource}} for {{duration}}".to_string(),
        };
        let commitment = ProjectCommitment {
            id: 1,
            uuid: Uuid::nil(),
            az_resource_id: 1,
            amount: 10,
            duration: "2 hours".into(),
            created_at: Utc::now(),
            creator_uuid: Uuid::nil(),
            creator_name: "alice".into(),
            confirm_by: None,
            confirmed_at: None,
            expires_at: Utc::now(),
            status: CommitmentStatus::Confirmed,
            transfer_status: TransferStatus::None,
            transfer_token: None,
            predecessor_id: None,
            creation_context: serde_json::json!({"reason": "create"}),
            supersede_context: None,
            notify_on_confirm: true,
        };
        let (subject, body) =
            render_confirmation(&config, "berlin", "cores", "", "az-one", &commitment);
        assert_eq!(subject, "Commitment confirmed in berlin");
        assert_eq!(body, "10  of cores for 2 hours");
    }

    #[tokio::test]
    async fn test_mock_client_classifies_missing_recipient() {
        let client = MockMailClient::new();
        let project = Project {
            id: 1,
            uuid: Uuid::nil(),
            domain_id: 1,
            name: "berlin".into(),
            recipient: None,
        };
        let result = client.deliver(&project, "s", "b").await;
        assert!(matches!(result, Err(MailError::Undeliverable(_))));
        assert!(client.delivered().is_empty());
    }

    #[tokio::test]
    async fn test_mock_client_scripted_transient_then_success() {
        let client = MockMailClient::new();
        client.push_outcome(Err(MailError::Transient("gateway 503".into())));
        let project = Project {
            id: 1,
            uuid: Uuid::nil(),
            domain_id: 1,
            name: "berlin".into(),
            recipient: Some("ops@berlin.example".into()),
        };
        assert!(client.deliver(&project, "s", "b").await.is_err());
        assert!(client.deliver(&project, "s", "b").await.is_ok());
        assert_eq!(client.delivered().len(), 1);
    }
}
