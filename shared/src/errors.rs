use thiserror::Error;

/// The error taxonomy shared by every subsystem. The API maps each kind to
/// exactly one HTTP status at the boundary; the collector swallows `Driver`
/// into scheduler rows and lets everything else bubble up.
#[derive(Error, Debug)]
pub enum QuotaError {
    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("driver error: {0}")]
    Driver(String),

    #[error("arithmetic overflow: {0}")]
    Overflow(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type QuotaResult<T> = Result<T, QuotaError>;

impl QuotaError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        QuotaError::Invalid(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        QuotaError::NotFound(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        QuotaError::Forbidden(msg.into())
    }

    pub fn capacity_exceeded(msg: impl Into<String>) -> Self {
        QuotaError::CapacityExceeded(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        QuotaError::Conflict(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        QuotaError::Internal(msg.into())
    }

    /// Whether a scraper should record this error and retry with backoff
    /// instead of bubbling it up.
    pub fn is_transient(&self) -> bool {
        matches!(self, QuotaError::Driver(_))
    }
}

impl From<sqlx::Error> for QuotaError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => QuotaError::NotFound("no matching row".into()),
            other => QuotaError::Internal(format!("database error: {}", other)),
        }
    }
}

impl From<serde_json::Error> for QuotaError {
    fn from(err: serde_json::Error) -> Self {
        QuotaError::Internal(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_driver_errors_are_transient() {
        assert!(QuotaError::Driver("connection reset".into()).is_transient());
        assert!(!QuotaError::capacity_exceeded("full").is_transient());
        assert!(!QuotaError::internal("bug").is_transient());
    }

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err: QuotaError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, QuotaError::NotFound(_)));
    }

    #[test]
    fn test_display_includes_detail() {
        let err = QuotaError::capacity_exceeded("resource compute/cores in az-one");
        assert_eq!(
            err.to_string(),
            "capacity exceeded: resource compute/cores in az-one"
        );
    }
}
