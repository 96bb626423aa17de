//! Process liveness and readiness state.
//!
//! Readiness is a latch, not a probe: handlers that hit a fatal condition
//! (unreachable durable store, corrupt invariant) trip it, the load
//! balancer stops routing to the instance, and an operator or a successful
//! recovery restores it. Liveness stays true as long as the process runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared readiness latch. Cheap to clone; all clones observe the same
/// state.
#[derive(Debug, Clone)]
pub struct HealthState {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    ready: AtomicBool,
    reason: std::sync::Mutex<Option<String>>,
}

impl HealthState {
    /// A healthy, ready state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                ready: AtomicBool::new(true),
                reason: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Whether the instance should receive traffic.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Acquire)
    }

    /// Trips readiness with a reason. Idempotent; the first reason wins.
    pub fn trip(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.inner.ready.swap(false, Ordering::AcqRel) {
            tracing::error!(reason = %reason, "readiness tripped, instance leaving the pool");
            if let Ok(mut slot) = self.inner.reason.lock() {
                *slot = Some(reason);
            }
        }
    }

    /// Restores readiness after recovery.
    pub fn restore(&self) {
        if !self.inner.ready.swap(true, Ordering::AcqRel) {
            tracing::info!("readiness restored");
            if let Ok(mut slot) = self.inner.reason.lock() {
                *slot = None;
            }
        }
    }

    /// The reason readiness is tripped, if it is.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.inner.reason.lock().ok().and_then(|slot| slot.clone())
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_ready() {
        let health = HealthState::new();
        assert!(health.is_ready());
        assert!(health.reason().is_none());
    }

    #[test]
    fn trip_and_restore_roundtrip() {
        let health = HealthState::new();
        health.trip("event store unreachable");
        assert!(!health.is_ready());
        assert_eq!(health.reason().as_deref(), Some("event store unreachable"));

        health.restore();
        assert!(health.is_ready());
        assert!(health.reason().is_none());
    }

    #[test]
    fn first_trip_reason_wins() {
        let health = HealthState::new();
        health.trip("first");
        health.trip("second");
        assert_eq!(health.reason().as_deref(), Some("first"));
    }

    #[test]
    fn clones_share_state() {
        let health = HealthState::new();
        let clone = health.clone();
        health.trip("down");
        assert!(!clone.is_ready());
    }
}
