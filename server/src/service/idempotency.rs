//! The idempotency pipeline wrapped around every mutating endpoint.
//!
//! Contract (per key):
//!
//! - First request claims the key, runs the operation, stores
//!   `(fingerprint, response)` with the configured TTL.
//! - A duplicate with the **same** fingerprint replays the stored response
//!   verbatim.
//! - A duplicate with a **different** fingerprint fails
//!   `IDEMPOTENCY_CONFLICT`.
//! - A concurrent duplicate waits (bounded) for the original, then replays
//!   it, or fails `IN_PROGRESS` when the wait elapses.
//!
//! Client-error responses (4xx) are stored too: the duplicate of a
//! rejected request is the same rejection, byte for byte. Server errors
//! abandon the claim so a retry can start fresh.

use crate::error::ApiError;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use booking_rush_core::{Clock, ErrorCode, IdempotencyBegin, IdempotencyStore, StoredResponse};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

/// How often a waiting duplicate re-checks the original's progress.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Executes mutations at most once per idempotency key.
pub struct IdempotencyPipeline {
    store: Arc<dyn IdempotencyStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    wait: Duration,
}

impl IdempotencyPipeline {
    /// Creates a pipeline. `ttl` must be at least the reservation TTL
    /// (validated at config load); `wait` bounds how long a concurrent
    /// duplicate blocks on the original.
    #[must_use]
    pub fn new(
        store: Arc<dyn IdempotencyStore>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
        wait: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            ttl,
            wait,
        }
    }

    /// Runs `operation` under `key`, or replays its stored outcome.
    /// Without a key the operation simply runs.
    ///
    /// # Errors
    ///
    /// `IDEMPOTENCY_CONFLICT` on fingerprint mismatch, `IN_PROGRESS` when
    /// the bounded wait elapses, or whatever the operation itself fails
    /// with.
    pub async fn execute<F, Fut>(
        &self,
        key: Option<&str>,
        fingerprint: &str,
        operation: F,
    ) -> Result<StoredResponse, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<StoredResponse, ApiError>>,
    {
        let Some(key) = key else {
            return operation().await;
        };

        // Consumed exactly once, on the iteration that wins the claim.
        let mut operation = Some(operation);
        let deadline = tokio::time::Instant::now() + self.wait;
        loop {
            match self.store.begin(key, self.clock.now()).await.map_err(|e| {
                ApiError::internal(anyhow::anyhow!("idempotency store: {e}"))
            })? {
                IdempotencyBegin::Acquired => {
                    let Some(operation) = operation.take() else {
                        return Err(ApiError::internal(anyhow::anyhow!(
                            "idempotency claim acquired twice"
                        )));
                    };
                    return self.run_claimed(key, fingerprint, operation).await;
                }
                IdempotencyBegin::Completed(record) => {
                    if record.fingerprint != fingerprint {
                        metrics::counter!("idempotency.conflicts").increment(1);
                        return Err(ApiError::new(
                            ErrorCode::IdempotencyConflict,
                            "idempotency key reused with a different request",
                        ));
                    }
                    metrics::counter!("idempotency.replays").increment(1);
                    tracing::debug!(key, "replaying stored idempotent response");
                    return Ok(record.response);
                }
                IdempotencyBegin::InFlight => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(ApiError::new(
                            ErrorCode::InProgress,
                            "original request still in progress",
                        ));
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }
    }

    async fn run_claimed<F, Fut>(
        &self,
        key: &str,
        fingerprint: &str,
        operation: F,
    ) -> Result<StoredResponse, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<StoredResponse, ApiError>>,
    {
        match operation().await {
            Ok(response) => {
                self.store_outcome(key, fingerprint, &response).await;
                Ok(response)
            }
            Err(error) if error.status().is_client_error() => {
                // A rejected request is still an outcome worth replaying.
                let response = StoredResponse {
                    status: error.status().as_u16(),
                    body: error.body(),
                };
                self.store_outcome(key, fingerprint, &response).await;
                Ok(response)
            }
            Err(error) => {
                // Server-side failure: free the key so a retry can start
                // fresh under the same idempotency key.
                if let Err(abandon_error) = self.store.abandon(key).await {
                    tracing::warn!(key, error = %abandon_error, "failed to abandon claim");
                }
                Err(error)
            }
        }
    }

    async fn store_outcome(&self, key: &str, fingerprint: &str, response: &StoredResponse) {
        if let Err(error) = self
            .store
            .complete(key, fingerprint, response.clone(), self.clock.now(), self.ttl)
            .await
        {
            tracing::warn!(key, error = %error, "failed to store idempotent response");
        }
    }
}

/// Stable request fingerprint: SHA-256 over the caller, route and body.
#[must_use]
pub fn fingerprint(user: &str, route: &str, body: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user.as_bytes());
    hasher.update(b"\n");
    hasher.update(route.as_bytes());
    hasher.update(b"\n");
    hasher.update(body.to_string().as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use booking_rush_testing::{InMemoryIdempotencyStore, test_clock};

    fn pipeline() -> IdempotencyPipeline {
        IdempotencyPipeline::new(
            Arc::new(InMemoryIdempotencyStore::new()),
            Arc::new(test_clock()),
            Duration::from_secs(600),
            Duration::from_millis(200),
        )
    }

    fn ok_response(n: u64) -> StoredResponse {
        StoredResponse {
            status: 201,
            body: serde_json::json!({ "n": n }),
        }
    }

    #[tokio::test]
    async fn duplicate_replays_without_rerunning() {
        let pipeline = pipeline();
        let fp = fingerprint("user-1", "POST /bookings/reserve", &serde_json::json!({"q": 2}));

        let first = pipeline
            .execute(Some("k1"), &fp, || async { Ok(ok_response(1)) })
            .await
            .unwrap();
        let second = pipeline
            .execute(Some("k1"), &fp, || async {
                panic!("operation must not run twice")
            })
            .await
            .unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn different_fingerprint_conflicts() {
        let pipeline = pipeline();
        pipeline
            .execute(Some("k1"), "fp-a", || async { Ok(ok_response(1)) })
            .await
            .unwrap();

        let err = pipeline
            .execute(Some("k1"), "fp-b", || async { Ok(ok_response(2)) })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::IdempotencyConflict);
    }

    #[tokio::test]
    async fn client_errors_are_replayed_as_outcomes() {
        let pipeline = pipeline();
        let first = pipeline
            .execute(Some("k1"), "fp", || async {
                Err(ApiError::new(
                    ErrorCode::InsufficientSeats,
                    "requested 3, available 1",
                ))
            })
            .await
            .unwrap();
        assert_eq!(first.status, 409);

        let replay = pipeline
            .execute(Some("k1"), "fp", || async {
                panic!("operation must not run twice")
            })
            .await
            .unwrap();
        assert_eq!(replay, first);
    }

    #[tokio::test]
    async fn server_errors_free_the_key() {
        let pipeline = pipeline();
        let err = pipeline
            .execute(Some("k1"), "fp", || async {
                Err(ApiError::internal(anyhow::anyhow!("store down")))
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Internal);

        // The retry gets to run.
        let retried = pipeline
            .execute(Some("k1"), "fp", || async { Ok(ok_response(2)) })
            .await
            .unwrap();
        assert_eq!(retried.body["n"], 2);
    }

    #[tokio::test]
    async fn concurrent_duplicate_waits_for_the_original() {
        let pipeline = Arc::new(pipeline());

        let slow = {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move {
                pipeline
                    .execute(Some("k1"), "fp", || async {
                        tokio::time::sleep(Duration::from_millis(80)).await;
                        Ok(ok_response(1))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let duplicate = pipeline
            .execute(Some("k1"), "fp", || async {
                panic!("duplicate must not run")
            })
            .await
            .unwrap();

        assert_eq!(duplicate, slow.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn wait_is_bounded() {
        let pipeline = Arc::new(pipeline());

        let _slow = {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move {
                pipeline
                    .execute(Some("k1"), "fp", || async {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                        Ok(ok_response(1))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = pipeline
            .execute(Some("k1"), "fp", || async { Ok(ok_response(2)) })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InProgress);
    }

    #[test]
    fn fingerprints_are_stable_and_body_sensitive() {
        let body = serde_json::json!({"quantity": 2});
        let a = fingerprint("u1", "POST /bookings/reserve", &body);
        let b = fingerprint("u1", "POST /bookings/reserve", &body);
        let c = fingerprint("u1", "POST /bookings/reserve", &serde_json::json!({"quantity": 3}));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
