use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use shared::QuotaError;
use uuid::Uuid;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: String,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    code: u16,
    timestamp: String,
    correlation_id: String,
}

impl ApiError {
    pub fn new(status: StatusCode, error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
            message: message.into(),
        }
    }

    pub fn unprocessable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, "InvalidRequest", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NotFound", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "Forbidden", message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

/// The single place where the domain taxonomy turns into HTTP statuses.
impl From<QuotaError> for ApiError {
    fn from(err: QuotaError) -> Self {
        match err {
            QuotaError::Invalid(msg) => {
                Self::new(StatusCode::UNPROCESSABLE_ENTITY, "InvalidRequest", msg)
            }
            QuotaError::NotFound(msg) => Self::new(StatusCode::NOT_FOUND, "NotFound", msg),
            QuotaError::Forbidden(msg) => Self::new(StatusCode::FORBIDDEN, "Forbidden", msg),
            QuotaError::CapacityExceeded(msg) => {
                Self::new(StatusCode::CONFLICT, "CapacityExceeded", msg)
            }
            QuotaError::Conflict(msg) => Self::new(StatusCode::CONFLICT, "Conflict", msg),
            QuotaError::Driver(msg) => Self::new(StatusCode::BAD_GATEWAY, "DriverError", msg),
            QuotaError::Overflow(msg) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "InternalServerError", msg)
            }
            QuotaError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error surfaced to API");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "InternalServerError",
                    "internal server error",
                )
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let correlation_id = Uuid::new_v4().to_string();
        let payload = ErrorResponse {
            error: self.error,
            message: self.message,
            code: self.status.as_u16(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            correlation_id: correlation_id.clone(),
        };

        let mut response = (self.status, Json(payload)).into_response();
        if let Ok(value) = HeaderValue::from_str(&correlation_id) {
            response
                .headers_mut()
                .insert(header::HeaderName::from_static("x-correlation-id"), value);
        }
        response
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy_maps_to_single_statuses() {
        let cases = [
            (QuotaError::invalid("x"), StatusCode::UNPROCESSABLE_ENTITY),
            (QuotaError::not_found("x"), StatusCode::NOT_FOUND),
            (QuotaError::forbidden("x"), StatusCode::FORBIDDEN),
            (QuotaError::capacity_exceeded("x"), StatusCode::CONFLICT),
            (QuotaError::conflict("x"), StatusCode::CONFLICT),
            (QuotaError::Driver("x".into()), StatusCode::BAD_GATEWAY),
            (QuotaError::Overflow("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (QuotaError::internal("x"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn test_internal_details_do_not_leak() {
        let api_err = ApiError::from(QuotaError::internal("connection string leaked"));
        assert_eq!(api_err.message, "internal server error");
    }
}
