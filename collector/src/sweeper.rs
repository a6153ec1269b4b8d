/// Expiry sweeper
/// A singleton loop that expires overdue commitments and tries to confirm
/// planned/pending ones whose confirm_by has passed. Both halves run once
/// per tick; a confirmation blocked on capacity is retried next tick.

use std::sync::Arc;
use std::time::Duration;

use shared::commitment::CommitmentService;
use tracing::{error, info};

pub struct ExpirySweeper {
    commitments: Arc<CommitmentService>,
    interval_secs: u64,
}

impl ExpirySweeper {
    pub fn new(commitments: Arc<CommitmentService>, interval_secs: u64) -> Self {
        ExpirySweeper {
            commitments,
            interval_secs,
        }
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.sweep_once().await;
        }
    }

    async fn sweep_once(&self) {
        match self.commitments.expire_overdue().await {
            Ok(0) => {}
            Ok(expired) => info!(expired, "Expired overdue commitments"),
            Err(err) => error!(error = %err, "Expiry sweep failed"),
        }

        match self.commitments.confirm_due().await {
            Ok(0) => {}
            Ok(confirmed) => info!(confirmed, "Confirmed due commitments"),
            Err(err) => error!(error = %err, "Confirmation sweep failed"),
        }
    }
}
