use once_cell::sync::Lazy;
use prometheus::{
    opts, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Registry, TextEncoder,
};

macro_rules! counter_vec {
    ($name:expr, $help:expr, $labels:expr) => {
        Lazy::new(|| IntCounterVec::new(opts!($name, $help), $labels).unwrap())
    };
}
macro_rules! histogram_vec {
    ($name:expr, $help:expr, $labels:expr) => {
        Lazy::new(|| {
            HistogramVec::new(
                HistogramOpts::new($name, $help).buckets(LATENCY_BUCKETS.to_vec()),
                $labels,
            )
            .unwrap()
        })
    };
}
macro_rules! gauge {
    ($name:expr, $help:expr) => {
        Lazy::new(|| IntGauge::new($name, $help).unwrap())
    };
}

const LATENCY_BUCKETS: [f64; 11] = [
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

// ── HTTP ────────────────────────────────────────────────────────────────────
pub static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = counter_vec!(
    "http_requests_total",
    "Total HTTP requests",
    &["method", "path", "status"]
);
pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = histogram_vec!(
    "http_request_duration_seconds",
    "HTTP request latency",
    &["method", "path"]
);

// ── Commitments ─────────────────────────────────────────────────────────────
pub static COMMITMENT_OPERATIONS: Lazy<IntCounterVec> = counter_vec!(
    "commitment_operations_total",
    "Commitment lifecycle operations by outcome",
    &["operation", "outcome"]
);

// ── Queues and scrapers (gauges refreshed on /metrics) ──────────────────────
pub static MAIL_QUEUE_DEPTH: Lazy<IntGauge> =
    gauge!("mail_queue_depth", "Pending mail notifications");
pub static MAIL_FAILED_SUBMISSIONS: Lazy<IntGauge> = gauge!(
    "mail_failed_submissions_max",
    "Highest failure count among queued notifications"
);
pub static PROJECT_SCRAPE_ERRORS: Lazy<IntGauge> = gauge!(
    "project_scrape_errors",
    "Project/service pairs whose last usage scrape failed"
);
pub static CAPACITOR_SCRAPE_ERRORS: Lazy<IntGauge> = gauge!(
    "capacitor_scrape_errors",
    "Capacity drivers whose last scrape failed"
);

pub fn register_all(registry: &Registry) -> prometheus::Result<()> {
    registry.register(Box::new(HTTP_REQUESTS_TOTAL.clone()))?;
    registry.register(Box::new(HTTP_REQUEST_DURATION.clone()))?;
    registry.register(Box::new(COMMITMENT_OPERATIONS.clone()))?;
    registry.register(Box::new(MAIL_QUEUE_DEPTH.clone()))?;
    registry.register(Box::new(MAIL_FAILED_SUBMISSIONS.clone()))?;
    registry.register(Box::new(PROJECT_SCRAPE_ERRORS.clone()))?;
    registry.register(Box::new(CAPACITOR_SCRAPE_ERRORS.clone()))?;
    Ok(())
}

pub fn record_operation(operation: &str, outcome: &str) {
    COMMITMENT_OPERATIONS
        .with_label_values(&[operation, outcome])
        .inc();
}

pub fn render(registry: &Registry) -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&registry.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_all_and_render() {
        let registry = Registry::new_custom(Some("test".into()), None).unwrap();
        register_all(&registry).unwrap();
        record_operation("create", "success");

        let rendered = render(&registry);
        assert!(rendered.contains("test_commitment_operations_total"));
        assert!(rendered.contains("test_mail_queue_depth"));
    }
}
