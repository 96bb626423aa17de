//! HTTP error type bridging the domain error taxonomy to responses.
//!
//! The error *name* is the contract; the HTTP status is the conventional
//! mapping from [`ErrorCode`]. Transient errors carry a `Retry-After`
//! hint so clients know the same idempotency key is safe to retry.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use booking_rush_core::{ErrorCode, StoreError};
use serde::Serialize;
use std::fmt;

/// An API-level error: a taxonomy code plus a user-facing message.
#[derive(Debug)]
pub struct ApiError {
    code: ErrorCode,
    message: String,
    source: Option<anyhow::Error>,
}

impl ApiError {
    /// Creates an error with an explicit code.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Attaches the underlying cause for logging.
    #[must_use]
    pub fn with_source(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source);
        self
    }

    /// A 500 with a generic message; the cause stays in the logs.
    #[must_use]
    pub fn internal(source: anyhow::Error) -> Self {
        Self::new(ErrorCode::Internal, "an internal error occurred").with_source(source)
    }

    /// The taxonomy code.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        self.code
    }

    /// The HTTP status this error maps to.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// The user-facing message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The `{code, message}` JSON body of this error.
    #[must_use]
    pub fn body(&self) -> serde_json::Value {
        serde_json::json!({
            "code": self.code.as_str(),
            "message": self.message,
        })
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Error response body.
#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(
                code = %self.code,
                message = %self.message,
                source = self.source.as_ref().map(|e| e.to_string()),
                "request failed"
            );
        }

        let body = ErrorBody {
            code: self.code.as_str(),
            message: self.message,
        };
        let mut response = (status, Json(body)).into_response();
        if self.code.is_retryable() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound => Self::new(ErrorCode::NotFound, "not found"),
            StoreError::Conflict(actual) => Self::new(
                ErrorCode::StateConflict,
                format!("operation conflicts with current state: {actual}"),
            ),
            StoreError::Database(_) | StoreError::Serialization(_) => {
                Self::internal(anyhow::anyhow!(error))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_drive_status_and_body() {
        let err = ApiError::new(ErrorCode::InsufficientSeats, "only 1 seat left");
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(err.body()["code"], "INSUFFICIENT_SEATS");
    }

    #[test]
    fn store_not_found_maps_to_404() {
        let err: ApiError = StoreError::NotFound.into();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }
}
