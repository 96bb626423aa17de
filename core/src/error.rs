//! Error taxonomy of the reservation pipeline.
//!
//! The public API contract is the error *name*; HTTP status numbers are
//! advisory. [`ErrorCode`] enumerates the names, stores surface
//! [`StoreError`], and each component crate layers its own `thiserror` enum
//! on top.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error codes of the public reservation API.
///
/// The string form (e.g. `INSUFFICIENT_SEATS`) is the contract; the HTTP
/// status is the conventional mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The zone does not have enough available seats.
    InsufficientSeats,
    /// The per-user, per-event ticket limit would be exceeded.
    QuotaExceeded,
    /// An idempotency key was reused with a different request.
    IdempotencyConflict,
    /// The original request under this idempotency key is still in flight.
    InProgress,
    /// Virtual queuing is active and no queue pass was presented.
    QueueRequired,
    /// The presented queue pass is invalid, expired or already consumed.
    PassInvalid,
    /// The reservation TTL elapsed before the operation.
    Expired,
    /// The zone's sale window is not open.
    SaleClosed,
    /// The referenced entity does not exist.
    NotFound,
    /// The caller is sending requests faster than admission allows.
    RateLimited,
    /// Missing or invalid authentication context.
    Unauthorized,
    /// The operation is not legal in the booking's current state.
    StateConflict,
    /// The request failed validation before touching any state.
    Validation,
    /// Unexpected server-side failure; safe to retry with the same key.
    Internal,
}

impl ErrorCode {
    /// Returns the wire name of this code.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InsufficientSeats => "INSUFFICIENT_SEATS",
            Self::QuotaExceeded => "QUOTA_EXCEEDED",
            Self::IdempotencyConflict => "IDEMPOTENCY_CONFLICT",
            Self::InProgress => "IN_PROGRESS",
            Self::QueueRequired => "QUEUE_REQUIRED",
            Self::PassInvalid => "PASS_INVALID",
            Self::Expired => "EXPIRED",
            Self::SaleClosed => "SALE_CLOSED",
            Self::NotFound => "NOT_FOUND",
            Self::RateLimited => "RATE_LIMITED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::StateConflict => "STATE_CONFLICT",
            Self::Validation => "VALIDATION",
            Self::Internal => "INTERNAL",
        }
    }

    /// Conventional HTTP status for this code.
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::InsufficientSeats
            | Self::QuotaExceeded
            | Self::IdempotencyConflict
            | Self::InProgress
            | Self::StateConflict => 409,
            Self::QueueRequired | Self::PassInvalid => 403,
            Self::Expired | Self::SaleClosed => 410,
            Self::NotFound => 404,
            Self::RateLimited => 429,
            Self::Unauthorized => 401,
            Self::Validation => 400,
            Self::Internal => 500,
        }
    }

    /// Whether a client may retry the same request (under the same
    /// idempotency key) and expect it to eventually succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::InProgress | Self::RateLimited | Self::Internal)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by durable stores (bookings, outbox, idempotency, DLQ).
#[derive(Error, Debug)]
pub enum StoreError {
    /// The requested row does not exist.
    #[error("row not found")]
    NotFound,

    /// A conditional update found the row in a different state.
    #[error("state conflict: {0}")]
    Conflict(String),

    /// Connection or query failure.
    #[error("database error: {0}")]
    Database(String),

    /// Payload (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_to_contract_names() {
        assert_eq!(ErrorCode::InsufficientSeats.as_str(), "INSUFFICIENT_SEATS");
        assert_eq!(ErrorCode::QuotaExceeded.http_status(), 409);
        assert_eq!(ErrorCode::Expired.http_status(), 410);
        assert_eq!(ErrorCode::QueueRequired.http_status(), 403);
        assert_eq!(ErrorCode::RateLimited.http_status(), 429);
    }

    #[test]
    fn only_transient_codes_are_retryable() {
        assert!(ErrorCode::Internal.is_retryable());
        assert!(!ErrorCode::IdempotencyConflict.is_retryable());
        assert!(!ErrorCode::InsufficientSeats.is_retryable());
    }
}
