/// Exponential backoff for scrape failures
/// Scheduler rows carry no failure counter, so each worker keeps an
/// in-memory tracker keyed by row id and folds the computed delay into the
/// row's next_scrape_at.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_interval_secs: u64,
    max_interval_secs: u64,
    attempts: u32,
}

impl ExponentialBackoff {
    pub fn new(base_interval_secs: u64, max_interval_secs: u64) -> Self {
        ExponentialBackoff {
            base_interval_secs,
            max_interval_secs,
            attempts: 0,
        }
    }

    /// Record a failure and return how long to wait before the next try:
    /// base × 2^(attempts - 1), capped at the maximum interval.
    pub fn on_failure(&mut self) -> Duration {
        self.attempts += 1;
        let interval = self
            .base_interval_secs
            .saturating_mul(2_u64.saturating_pow(self.attempts.saturating_sub(1)))
            .min(self.max_interval_secs);
        Duration::from_secs(interval)
    }

    pub fn on_success(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Per-row backoff state for one scraper worker.
#[derive(Debug)]
pub struct BackoffTracker {
    base_interval_secs: u64,
    max_interval_secs: u64,
    rows: HashMap<i64, ExponentialBackoff>,
}

impl BackoffTracker {
    pub fn new(base_interval_secs: u64, max_interval_secs: u64) -> Self {
        BackoffTracker {
            base_interval_secs,
            max_interval_secs,
            rows: HashMap::new(),
        }
    }

    /// Record a failure for the row and return the retry delay.
    pub fn on_failure(&mut self, row_id: i64, error: &str) -> Duration {
        let backoff = self
            .rows
            .entry(row_id)
            .or_insert_with(|| ExponentialBackoff::new(self.base_interval_secs, self.max_interval_secs));
        let delay = backoff.on_failure();
        warn!(
            row_id,
            attempt = backoff.attempts(),
            retry_in_secs = delay.as_secs(),
            error,
            "Scrape failed, backing off"
        );
        delay
    }

    /// Forget the row's failure history after a successful scrape.
    pub fn on_success(&mut self, row_id: i64) {
        if let Some(backoff) = self.rows.remove(&row_id) {
            if backoff.attempts() > 0 {
                info!(
                    row_id,
                    attempts = backoff.attempts(),
                    "Scrape recovered"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = ExponentialBackoff::new(60, 1800);
        assert_eq!(backoff.on_failure().as_secs(), 60);
        assert_eq!(backoff.on_failure().as_secs(), 120);
        assert_eq!(backoff.on_failure().as_secs(), 240);
        assert_eq!(backoff.on_failure().as_secs(), 480);
        assert_eq!(backoff.on_failure().as_secs(), 960);
        assert_eq!(backoff.on_failure().as_secs(), 1800);
        assert_eq!(backoff.on_failure().as_secs(), 1800);
    }

    #[test]
    fn test_backoff_resets_on_success() {
        let mut backoff = ExponentialBackoff::new(60, 1800);
        backoff.on_failure();
        backoff.on_failure();
        assert_eq!(backoff.attempts(), 2);
        backoff.on_success();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.on_failure().as_secs(), 60);
    }

    #[test]
    fn test_tracker_keeps_rows_independent() {
        let mut tracker = BackoffTracker::new(60, 1800);
        assert_eq!(tracker.on_failure(1, "boom").as_secs(), 60);
        assert_eq!(tracker.on_failure(1, "boom").as_secs(), 120);
        // A different row starts fresh.
        assert_eq!(tracker.on_failure(2, "boom").as_secs(), 60);

        tracker.on_success(1);
        assert_eq!(tracker.on_failure(1, "boom").as_secs(), 60);
        // Row 2 was untouched by row 1's recovery.
        assert_eq!(tracker.on_failure(2, "boom").as_secs(), 120);
    }
}
