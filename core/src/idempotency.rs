//! Idempotency records and the dedup store contract.
//!
//! Every mutation request may carry an `Idempotency-Key`. The store maps
//! `key → (fingerprint, response snapshot)` with a TTL and a short per-key
//! claim so that concurrent duplicates serialize behind the original. The
//! bounded-wait policy lives in the server pipeline; the store only exposes
//! claim/complete/abandon.

use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A captured response, replayed verbatim for duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResponse {
    /// HTTP status of the original response.
    pub status: u16,
    /// JSON body of the original response.
    pub body: serde_json::Value,
}

/// A completed idempotency entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// The caller-chosen key.
    pub key: String,
    /// Hash of the original request; duplicates must match it.
    pub fingerprint: String,
    /// The response to replay.
    pub response: StoredResponse,
    /// When the original completed.
    pub created_at: DateTime<Utc>,
    /// When the record stops shielding duplicates.
    pub expires_at: DateTime<Utc>,
}

/// Outcome of claiming a key.
#[derive(Debug, Clone, PartialEq)]
pub enum IdempotencyBegin {
    /// The key is ours; the caller must `complete` or `abandon` it.
    Acquired,
    /// A prior request completed under this key.
    Completed(IdempotencyRecord),
    /// The original request is still in flight.
    InFlight,
}

/// Store of idempotency claims and completed responses.
///
/// Implementations: `PostgresIdempotencyStore` (durable) and
/// `InMemoryIdempotencyStore` (testing). Expired entries behave as absent.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Attempts to claim `key`. Exactly one concurrent caller gets
    /// [`IdempotencyBegin::Acquired`]; the rest observe the in-flight claim
    /// or the completed record.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] on infrastructure failure.
    async fn begin(&self, key: &str, now: DateTime<Utc>) -> Result<IdempotencyBegin, StoreError>;

    /// Completes a claimed key with the response snapshot, retained for
    /// `ttl`.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if the claim vanished,
    /// [`StoreError::Database`] on infrastructure failure.
    async fn complete(
        &self,
        key: &str,
        fingerprint: &str,
        response: StoredResponse,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Releases a claim whose request failed before producing a response,
    /// so a retry can start fresh.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] on infrastructure failure.
    async fn abandon(&self, key: &str) -> Result<(), StoreError>;
}
