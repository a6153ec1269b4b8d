/// Mail delivery worker
/// Polls mail_notifications in id order, resolves the recipient from the
/// current project row and delivers through the mail client. Undeliverable
/// rows are dropped; transient failures retry with the queue's fixed
/// two-minute delay.

use std::sync::Arc;
use std::time::Duration;

use shared::clock::SharedClock;
use shared::errors::QuotaResult;
use shared::mail::{self, MailClient, MailError};
use shared::models::{MailNotification, Project};
use sqlx::PgPool;
use tracing::{error, info, warn};

pub struct MailWorker {
    pool: PgPool,
    client: Arc<dyn MailClient>,
    clock: SharedClock,
    poll_interval_secs: u64,
    max_retries: Option<i64>,
}

impl MailWorker {
    pub fn new(
        pool: PgPool,
        client: Arc<dyn MailClient>,
        clock: SharedClock,
        poll_interval_secs: u64,
        max_retries: Option<i64>,
    ) -> Self {
        MailWorker {
            pool,
            client,
            clock,
            poll_interval_secs,
            max_retries,
        }
    }

    pub async fn run(self) {
        loop {
            match self.deliver_next().await {
                Ok(true) => {}
                Ok(false) => {
                    tokio::time::sleep(Duration::from_secs(self.poll_interval_secs)).await
                }
                Err(err) => {
                    error!(error = %err, "Mail delivery cycle failed");
                    tokio::time::sleep(Duration::from_secs(self.poll_interval_secs)).await;
                }
            }
        }
    }

    /// Deliver one due notification. Returns false when the queue is idle.
    async fn deliver_next(&self) -> QuotaResult<bool> {
        let now = self.clock.now();
        let Some(notification) = mail::claim_next_due(&self.pool, now).await? else {
            return Ok(false);
        };

        let project: Option<Project> = sqlx::query_as("SELECT * FROM projects WHERE id = $1")
            .bind(notification.project_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(project) = project else {
            warn!(
                notification = notification.id,
                "Dropping notification for deleted project"
            );
            mail::delete(&self.pool, notification.id).await?;
            return Ok(true);
        };

        match self
            .client
            .deliver(&project, &notification.subject, &notification.body)
            .await
        {
            Ok(()) => {
                info!(
                    project = %project.name,
                    subject = %notification.subject,
                    "Notification delivered"
                );
                mail::delete(&self.pool, notification.id).await?;
            }
            Err(MailError::Undeliverable(reason)) => {
                warn!(
                    project = %project.name,
                    reason = %reason,
                    "Dropping undeliverable notification"
                );
                mail::delete(&self.pool, notification.id).await?;
            }
            Err(MailError::Transient(reason)) => {
                if self.retries_exhausted(&notification) {
                    error!(
                        project = %project.name,
                        failed_submissions = notification.failed_submissions,
                        reason = %reason,
                        "Dropping notification after exhausting retries"
                    );
                    mail::delete(&self.pool, notification.id).await?;
                } else {
                    warn!(
                        project = %project.name,
                        failed_submissions = notification.failed_submissions + 1,
                        reason = %reason,
                        "Notification delivery failed, will retry"
                    );
                    mail::record_failure(&self.pool, notification.id, self.clock.now()).await?;
                }
            }
        }
        Ok(true)
    }

    fn retries_exhausted(&self, notification: &MailNotification) -> bool {
        match self.max_retries {
            Some(max) => notification.failed_submissions + 1 > max,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use shared::clock::SystemClock;
    use shared::mail::MockMailClient;

    fn worker(max_retries: Option<i64>) -> MailWorker {
        MailWorker {
            pool: PgPool::connect_lazy("postgresql://localhost/unused").unwrap(),
            client: Arc::new(MockMailClient::new()),
            clock: Arc::new(SystemClock),
            poll_interval_secs: 10,
            max_retries,
        }
    }

    fn notification(failed_submissions: i64) -> MailNotification {
        MailNotification {
            id: 1,
            project_id: 1,
            subject: "s".into(),
            body: "b".into(),
            next_submission_at: Utc::now(),
            failed_submissions,
        }
    }

    #[tokio::test]
    async fn test_retries_unbounded_by_default() {
        let worker = worker(None);
        assert!(!worker.retries_exhausted(&notification(1_000_000)));
    }

    #[tokio::test]
    async fn test_retries_bounded_when_configured() {
        let worker = worker(Some(3));
        assert!(!worker.retries_exhausted(&notification(0)));
        assert!(!worker.retries_exhausted(&notification(2)));
        assert!(worker.retries_exhausted(&notification(3)));
    }
}
