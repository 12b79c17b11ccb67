//! HTTP boundary translation of the error taxonomy.
//!
//! Handlers return [`ApiError`]; this is the single place where domain
//! errors become status codes and JSON bodies. Internal detail stays
//! out of responses: storage and provider failures render as a generic
//! 500.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use logsink_core::SinkError;
use serde_json::json;
use tracing::error;

/// A domain error crossing the HTTP boundary.
#[derive(Debug)]
pub struct ApiError(pub SinkError);

impl From<SinkError> for ApiError {
    fn from(err: SinkError) -> Self {
        Self(err)
    }
}

impl ApiError {
    /// Status code for each taxonomy entry.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match &self.0 {
            SinkError::InvalidInput(_) | SinkError::Precondition { .. } => StatusCode::BAD_REQUEST,
            SinkError::Unauthenticated => StatusCode::UNAUTHORIZED,
            SinkError::Blocked { .. } => StatusCode::FORBIDDEN,
            SinkError::NotFound(_) => StatusCode::NOT_FOUND,
            SinkError::Conflict(_) | SinkError::Busy(_) => StatusCode::CONFLICT,
            SinkError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            SinkError::Storage(_) | SinkError::Provider(_) | SinkError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            },
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self.0 {
            SinkError::Blocked { pattern, reason } => json!({
                "error": "Log entry blocked by blacklist",
                "reason": reason.clone().unwrap_or_else(|| "blacklisted".to_string()),
                "pattern": pattern,
            }),
            SinkError::Storage(detail) | SinkError::Internal(detail) => {
                error!(detail = %detail, "internal error crossing HTTP boundary");
                json!({"error": "Internal server error"})
            },
            SinkError::Provider(detail) => {
                error!(detail = %detail, "provider error crossing HTTP boundary");
                json!({"error": "Internal server error"})
            },
            other => json!({"error": other.to_string()}),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_map() {
        assert_eq!(
            ApiError(SinkError::invalid("x")).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError(SinkError::Unauthenticated).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError(SinkError::Blocked {
                pattern: "p".into(),
                reason: None
            })
            .status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError(SinkError::not_found("log")).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError(SinkError::precondition("pending", "open")).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError(SinkError::Conflict("dup".into())).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError(SinkError::Busy("cleanup")).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError(SinkError::Unavailable("off".into())).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError(SinkError::Storage("boom".into())).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
