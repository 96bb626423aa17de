//! Header extractors for the reservation endpoints.

use crate::api::AppState;
use crate::error::ApiError;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use booking_rush_core::ErrorCode;

/// The optional `Idempotency-Key` header.
///
/// Any mutation may carry one; when present it must be 16–128 characters.
#[derive(Debug, Clone)]
pub struct IdempotencyKeyHeader(pub Option<String>);

#[axum::async_trait]
impl FromRequestParts<AppState> for IdempotencyKeyHeader {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(value) = parts.headers.get("Idempotency-Key") else {
            return Ok(Self(None));
        };
        let key = value
            .to_str()
            .map_err(|_| {
                ApiError::new(ErrorCode::Validation, "Idempotency-Key is not valid text")
            })?
            .to_string();
        if key.len() < 16 || key.len() > 128 {
            return Err(ApiError::new(
                ErrorCode::Validation,
                "Idempotency-Key must be between 16 and 128 characters",
            ));
        }
        Ok(Self(Some(key)))
    }
}

/// The optional `X-Queue-Pass` header, required while admission control is
/// active for the target event.
#[derive(Debug, Clone)]
pub struct QueuePassHeader(pub Option<String>);

#[axum::async_trait]
impl FromRequestParts<AppState> for QueuePassHeader {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let pass = parts
            .headers
            .get("X-Queue-Pass")
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string);
        Ok(Self(pass))
    }
}
