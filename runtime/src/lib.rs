//! # Booking Rush Runtime
//!
//! Shared execution primitives for the background workers of the
//! reservation pipeline:
//!
//! - [`retry`]: exponential backoff with jitter and retryability
//!   classification, used by the outbox dispatcher and the saga
//!   orchestrator's step retries.
//! - [`health`]: process liveness/readiness state. Fatal errors (an
//!   unreachable durable store, a corrupt invariant) trip readiness so the
//!   instance is removed from the pool until healthy.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod health;
pub mod retry;

pub use health::HealthState;
pub use retry::{BackoffPolicy, Retryability, retry};
