//! Exponential backoff with jitter and retryability classification.
//!
//! Transient failures (broker unavailable, store timeout, 5xx) are retried
//! with exponentially growing, jittered delays. Permanent failures
//! (validation, not-found, unauthorized, duplicate) are surfaced
//! immediately and never retried.
//!
//! # Example
//!
//! ```rust
//! use booking_rush_runtime::retry::{BackoffPolicy, Retryability, retry};
//!
//! # async fn example() -> Result<(), String> {
//! let policy = BackoffPolicy::default().with_max_attempts(3);
//!
//! let value = retry(
//!     &policy,
//!     |err: &String| {
//!         if err.contains("timeout") {
//!             Retryability::Retryable
//!         } else {
//!             Retryability::Fatal
//!         }
//!     },
//!     || async { Ok::<_, String>(42) },
//! )
//! .await?;
//!
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;

/// Whether a failure is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retryability {
    /// Transient; retry with backoff.
    Retryable,
    /// Permanent; fail immediately.
    Fatal,
}

/// Exponential backoff configuration.
///
/// Delay before attempt `n` (0-based retry index) is
/// `base * factor^n`, capped at `cap`, scaled by a jitter factor in
/// `[0.5, 1.0]` when jitter is enabled.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound on any single delay.
    pub cap: Duration,
    /// Growth factor per retry.
    pub factor: f64,
    /// Total attempts, including the first (minimum 1).
    pub max_attempts: u32,
    /// Randomize delays to decorrelate competing retriers.
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(30),
            factor: 2.0,
            max_attempts: 5,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Sets the delay before the first retry.
    #[must_use]
    pub const fn with_base(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    /// Sets the cap on any single delay.
    #[must_use]
    pub const fn with_cap(mut self, cap: Duration) -> Self {
        self.cap = cap;
        self
    }

    /// Sets the total number of attempts (minimum 1).
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = if max_attempts == 0 { 1 } else { max_attempts };
        self
    }

    /// Disables jitter (deterministic delays, mainly for tests).
    #[must_use]
    pub const fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Raw (unjittered) delay before retry number `retry_index` (0-based).
    #[must_use]
    pub fn delay_for(&self, retry_index: u32) -> Duration {
        #[allow(clippy::cast_precision_loss)]
        let exp = self.base.as_millis() as f64 * self.factor.powi(retry_index.min(63) as i32);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let delay = Duration::from_millis(exp.min(u64::MAX as f64) as u64);
        delay.min(self.cap)
    }

    /// Jittered delay before retry number `retry_index`.
    #[must_use]
    pub fn jittered_delay_for(&self, retry_index: u32) -> Duration {
        let delay = self.delay_for(retry_index);
        if !self.jitter {
            return delay;
        }
        let scale: f64 = rand::thread_rng().gen_range(0.5..=1.0);
        delay.mul_f64(scale)
    }
}

/// Runs `operation`, retrying classified-retryable failures with backoff.
///
/// Returns the first success, the first fatal error, or the last error once
/// `policy.max_attempts` is exhausted.
///
/// # Errors
///
/// Propagates the operation's error per the policy above.
pub async fn retry<F, Fut, T, E, C>(
    policy: &BackoffPolicy,
    classify: C,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    C: Fn(&E) -> Retryability,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                if classify(&err) == Retryability::Fatal {
                    tracing::warn!(error = %err, "permanent failure, not retrying");
                    return Err(err);
                }

                attempt += 1;
                if attempt >= max_attempts {
                    tracing::error!(
                        attempts = attempt,
                        error = %err,
                        "retries exhausted"
                    );
                    return Err(err);
                }

                let delay = policy.jittered_delay_for(attempt - 1);
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "transient failure, backing off"
                );
                sleep(delay).await;
            }
        }
    }
}
