//! Zone counters and the atomic inventory contract.
//!
//! The inventory store is the primary defense against overselling. Every
//! mutation preserves `available + reserved + sold == total`, and the
//! implementation guarantees that no concurrent observer can see a state
//! that violates it (the engine in `booking-rush-inventory` linearizes all
//! mutations per process on a single command loop).

use crate::types::{BookingId, ShowId, ZoneId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// The inventory key: a `(show, zone)` pair.
///
/// Reservation payloads must carry both ids; a bare `zone_id` is never
/// accepted as an inventory key.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ZoneKey {
    /// The show this zone belongs to.
    pub show_id: ShowId,
    /// The zone within the show.
    pub zone_id: ZoneId,
}

impl ZoneKey {
    /// Creates a key from its parts.
    #[must_use]
    pub const fn new(show_id: ShowId, zone_id: ZoneId) -> Self {
        Self { show_id, zone_id }
    }
}

impl fmt::Display for ZoneKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.show_id, self.zone_id)
    }
}

/// Per-zone seat counters.
///
/// Invariant: `available + reserved + sold == total` at every observation
/// point, all counters non-negative (enforced by `u32`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneCounters {
    /// Total seats published for this zone.
    pub total: u32,
    /// Seats free to reserve.
    pub available: u32,
    /// Seats held by live reservations.
    pub reserved: u32,
    /// Seats in confirmed bookings.
    pub sold: u32,
    /// Monotonic mutation counter.
    pub version: u64,
}

impl ZoneCounters {
    /// Counters for a freshly published zone: everything available.
    #[must_use]
    pub const fn fresh(total: u32) -> Self {
        Self {
            total,
            available: total,
            reserved: 0,
            sold: 0,
            version: 0,
        }
    }

    /// Whether the conservation invariant holds.
    #[must_use]
    pub const fn is_conserved(&self) -> bool {
        self.available as u64 + self.reserved as u64 + self.sold as u64 == self.total as u64
    }
}

/// The interval during which a zone accepts reservations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleWindow {
    /// First instant reservations are accepted.
    pub opens_at: DateTime<Utc>,
    /// First instant reservations are rejected again.
    pub closes_at: DateTime<Utc>,
}

impl SaleWindow {
    /// Whether `now` falls inside the window.
    #[must_use]
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        now >= self.opens_at && now < self.closes_at
    }
}

/// Result of a reserve attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// Seats deducted (or an identical hold already existed); counters
    /// after the deduction.
    Reserved(ZoneCounters),
    /// Not enough seats; nothing changed.
    Insufficient {
        /// Seats that were available at the decision instant.
        available: u32,
    },
    /// The zone's sale window is not open; nothing changed.
    SaleClosed,
}

/// Result of confirming a hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// Hold moved `reserved → sold` (or already was); counters after.
    Confirmed(ZoneCounters),
    /// The hold's TTL elapsed and it was swept back to `available`.
    Expired,
    /// No live hold under this key. Callers must re-check durable state
    /// before treating this as an error.
    NotFound,
}

/// Result of releasing a hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Hold moved `reserved → available`; counters after.
    Released(ZoneCounters),
    /// No live hold under this key; releasing an expired or already
    /// released hold is a no-op.
    NotFound,
}

/// Inventory failures that are not normal outcomes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InventoryError {
    /// The zone was never seeded from the catalog.
    #[error("unknown zone {0}")]
    UnknownZone(ZoneKey),

    /// The hold key is live with different `(zone, quantity)` parameters.
    #[error("hold {hold_key} already exists with different parameters")]
    HoldConflict {
        /// The conflicting hold key.
        hold_key: BookingId,
    },

    /// The engine task is gone; the instance is unhealthy.
    #[error("inventory engine unavailable: {0}")]
    Unavailable(String),
}

/// The atomic check-and-deduct primitive over zone counters.
///
/// All operations are atomic per zone: each either applies all of its
/// effects or none, and no interleaving can observe a non-conserving state.
/// `Reserve`/`Confirm`/`Release` are idempotent by `hold_key` per the
/// operation contracts below.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Publishes a zone with `total_seats` all available. Re-seeding an
    /// existing zone is a no-op.
    ///
    /// # Errors
    ///
    /// [`InventoryError::Unavailable`] if the engine is down.
    async fn seed(
        &self,
        zone: ZoneKey,
        total_seats: u32,
        sale_window: Option<SaleWindow>,
    ) -> Result<(), InventoryError>;

    /// Atomically moves `quantity` seats `available → reserved` and records
    /// a hold `{hold_key, quantity, now + ttl}`, or changes nothing.
    ///
    /// Idempotent: a repeat with the same `hold_key` and identical
    /// `(zone, quantity)` within the TTL returns the original snapshot
    /// without further deduction.
    ///
    /// # Errors
    ///
    /// [`InventoryError::UnknownZone`] for unseeded zones,
    /// [`InventoryError::HoldConflict`] when the key is live with different
    /// parameters, [`InventoryError::Unavailable`] if the engine is down.
    async fn reserve(
        &self,
        zone: ZoneKey,
        hold_key: BookingId,
        quantity: u32,
        ttl: Duration,
    ) -> Result<ReserveOutcome, InventoryError>;

    /// Atomically moves the hold's seats `reserved → sold` and removes the
    /// hold. Repeated confirmation after success is a no-op `Confirmed`.
    ///
    /// # Errors
    ///
    /// [`InventoryError::UnknownZone`], [`InventoryError::Unavailable`].
    async fn confirm(
        &self,
        zone: ZoneKey,
        hold_key: BookingId,
    ) -> Result<ConfirmOutcome, InventoryError>;

    /// Atomically moves the hold's seats `reserved → available` and removes
    /// the hold. Idempotent.
    ///
    /// # Errors
    ///
    /// [`InventoryError::UnknownZone`], [`InventoryError::Unavailable`].
    async fn release(
        &self,
        zone: ZoneKey,
        hold_key: BookingId,
    ) -> Result<ReleaseOutcome, InventoryError>;

    /// Current counters for a zone, or `None` if unseeded.
    ///
    /// # Errors
    ///
    /// [`InventoryError::Unavailable`].
    async fn snapshot(&self, zone: ZoneKey) -> Result<Option<ZoneCounters>, InventoryError>;

    /// Replaces a zone's counters with values re-derived from durable
    /// truth, dropping holds already accounted for. Reconciler only.
    ///
    /// # Errors
    ///
    /// [`InventoryError::UnknownZone`], [`InventoryError::Unavailable`].
    async fn rebuild(&self, zone: ZoneKey, counters: ZoneCounters) -> Result<(), InventoryError>;

    /// All seeded zones.
    ///
    /// # Errors
    ///
    /// [`InventoryError::Unavailable`].
    async fn zones(&self) -> Result<Vec<ZoneKey>, InventoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_counters_are_conserved() {
        let counters = ZoneCounters::fresh(500);
        assert!(counters.is_conserved());
        assert_eq!(counters.available, 500);
    }

    #[test]
    fn conservation_detects_drift() {
        let mut counters = ZoneCounters::fresh(10);
        counters.available = 9;
        assert!(!counters.is_conserved());
    }

    #[test]
    fn sale_window_bounds_are_half_open() {
        let now = Utc::now();
        let window = SaleWindow {
            opens_at: now,
            closes_at: now + chrono::Duration::hours(1),
        };
        assert!(window.contains(now));
        assert!(!window.contains(now + chrono::Duration::hours(1)));
        assert!(!window.contains(now - chrono::Duration::seconds(1)));
    }
}
