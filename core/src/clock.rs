//! Clock abstraction for testable time.

use chrono::{DateTime, Utc};

/// Source of the current time.
///
/// Everything that stamps or compares timestamps takes a `Clock` so tests
/// can drive TTL expiry deterministically.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
