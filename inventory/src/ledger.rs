//! Per-zone ledger: counters, live holds, and the transition rules.
//!
//! Every transition preserves `available + reserved + sold == total`; the
//! engine loop calls these methods one at a time, which is what makes each
//! of them atomic from the callers' point of view.

use booking_rush_core::{
    BookingId, ConfirmOutcome, InventoryError, ReleaseOutcome, ReserveOutcome, SaleWindow,
    ZoneCounters, ZoneKey,
};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// A live claim on `quantity` seats, keyed by booking id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Hold {
    pub quantity: u32,
    pub expires_at: DateTime<Utc>,
}

/// One zone's complete in-memory state.
#[derive(Debug)]
pub(crate) struct Zone {
    pub counters: ZoneCounters,
    pub sale_window: Option<SaleWindow>,
    holds: HashMap<BookingId, Hold>,
    /// Keys whose holds were confirmed; repeat confirms are no-ops.
    confirmed: HashSet<BookingId>,
    /// Keys whose holds expired and were swept back to available.
    expired: HashSet<BookingId>,
}

impl Zone {
    pub fn new(total_seats: u32, sale_window: Option<SaleWindow>) -> Self {
        Self {
            counters: ZoneCounters::fresh(total_seats),
            sale_window,
            holds: HashMap::new(),
            confirmed: HashSet::new(),
            expired: HashSet::new(),
        }
    }

    /// Releases every hold whose TTL elapsed. Returns how many were swept.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let due: Vec<BookingId> = self
            .holds
            .iter()
            .filter(|(_, hold)| hold.expires_at <= now)
            .map(|(key, _)| *key)
            .collect();

        for key in &due {
            if let Some(hold) = self.holds.remove(key) {
                self.counters.reserved -= hold.quantity;
                self.counters.available += hold.quantity;
                self.counters.version += 1;
                self.expired.insert(*key);
                debug_assert!(self.counters.is_conserved());
            }
        }
        due.len()
    }

    /// Atomic check-and-deduct. See `InventoryStore::reserve` for the
    /// contract.
    pub fn reserve(
        &mut self,
        hold_key: BookingId,
        quantity: u32,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<ReserveOutcome, InventoryError> {
        self.sweep(now);

        if let Some(window) = self.sale_window {
            if !window.contains(now) {
                return Ok(ReserveOutcome::SaleClosed);
            }
        }

        if let Some(existing) = self.holds.get(&hold_key) {
            if existing.quantity == quantity {
                // Same hold replayed within TTL: original snapshot, no
                // further deduction.
                return Ok(ReserveOutcome::Reserved(self.counters));
            }
            return Err(InventoryError::HoldConflict { hold_key });
        }

        if self.counters.available < quantity {
            return Ok(ReserveOutcome::Insufficient {
                available: self.counters.available,
            });
        }

        self.counters.available -= quantity;
        self.counters.reserved += quantity;
        self.counters.version += 1;
        self.expired.remove(&hold_key);
        self.holds.insert(
            hold_key,
            Hold {
                quantity,
                expires_at: now + ttl,
            },
        );
        debug_assert!(self.counters.is_conserved());

        Ok(ReserveOutcome::Reserved(self.counters))
    }

    /// Moves a hold's seats `reserved → sold`. See
    /// `InventoryStore::confirm` for the contract.
    pub fn confirm(&mut self, hold_key: BookingId, now: DateTime<Utc>) -> ConfirmOutcome {
        self.sweep(now);

        if let Some(hold) = self.holds.remove(&hold_key) {
            self.counters.reserved -= hold.quantity;
            self.counters.sold += hold.quantity;
            self.counters.version += 1;
            self.confirmed.insert(hold_key);
            debug_assert!(self.counters.is_conserved());
            return ConfirmOutcome::Confirmed(self.counters);
        }

        if self.confirmed.contains(&hold_key) {
            return ConfirmOutcome::Confirmed(self.counters);
        }

        if self.expired.contains(&hold_key) {
            return ConfirmOutcome::Expired;
        }

        ConfirmOutcome::NotFound
    }

    /// Moves a hold's seats `reserved → available`. Idempotent; releasing a
    /// swept (expired) or unknown hold is a no-op.
    pub fn release(&mut self, hold_key: BookingId, now: DateTime<Utc>) -> ReleaseOutcome {
        self.sweep(now);

        match self.holds.remove(&hold_key) {
            Some(hold) => {
                self.counters.reserved -= hold.quantity;
                self.counters.available += hold.quantity;
                self.counters.version += 1;
                debug_assert!(self.counters.is_conserved());
                ReleaseOutcome::Released(self.counters)
            }
            None => ReleaseOutcome::NotFound,
        }
    }

    /// Replaces this zone's counters with values re-derived from durable
    /// truth. Live holds are kept: they mirror durable reserved bookings by
    /// key and stay authoritative for their TTLs.
    pub fn rebuild(&mut self, counters: ZoneCounters) {
        let version = self.counters.version + 1;
        self.counters = ZoneCounters { version, ..counters };
    }

    #[cfg(test)]
    pub fn hold(&self, key: &BookingId) -> Option<&Hold> {
        self.holds.get(key)
    }
}

/// The full ledger: every seeded zone.
#[derive(Debug, Default)]
pub(crate) struct Ledger {
    zones: HashMap<ZoneKey, Zone>,
}

impl Ledger {
    pub fn seed(&mut self, key: ZoneKey, total_seats: u32, sale_window: Option<SaleWindow>) {
        // Re-seeding a published zone must not clobber live counters.
        self.zones
            .entry(key)
            .or_insert_with(|| Zone::new(total_seats, sale_window));
    }

    pub fn zone_mut(&mut self, key: ZoneKey) -> Result<&mut Zone, InventoryError> {
        self.zones
            .get_mut(&key)
            .ok_or(InventoryError::UnknownZone(key))
    }

    pub fn snapshot(&self, key: ZoneKey) -> Option<ZoneCounters> {
        self.zones.get(&key).map(|zone| zone.counters)
    }

    pub fn keys(&self) -> Vec<ZoneKey> {
        self.zones.keys().copied().collect()
    }

    /// Sweeps every zone; returns the number of holds released.
    pub fn sweep_all(&mut self, now: DateTime<Utc>) -> usize {
        self.zones.values_mut().map(|zone| zone.sweep(now)).sum()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    const TTL: Duration = Duration::from_secs(600);

    #[test]
    fn reserve_deducts_and_records_hold() {
        let mut zone = Zone::new(10, None);
        let key = BookingId::new();

        let outcome = zone.reserve(key, 3, at(0), TTL).unwrap();
        let ReserveOutcome::Reserved(counters) = outcome else {
            panic!("expected Reserved, got {outcome:?}");
        };
        assert_eq!(
            (counters.available, counters.reserved, counters.sold),
            (7, 3, 0)
        );
        assert_eq!(zone.hold(&key).unwrap().quantity, 3);
    }

    #[test]
    fn reserve_replay_returns_original_snapshot() {
        let mut zone = Zone::new(10, None);
        let key = BookingId::new();

        zone.reserve(key, 3, at(0), TTL).unwrap();
        let replay = zone.reserve(key, 3, at(1), TTL).unwrap();
        let ReserveOutcome::Reserved(counters) = replay else {
            panic!("expected Reserved");
        };
        // No further deduction.
        assert_eq!(counters.available, 7);
        assert_eq!(counters.reserved, 3);
    }

    #[test]
    fn reserve_replay_with_different_quantity_conflicts() {
        let mut zone = Zone::new(10, None);
        let key = BookingId::new();

        zone.reserve(key, 3, at(0), TTL).unwrap();
        let err = zone.reserve(key, 4, at(1), TTL).unwrap_err();
        assert!(matches!(err, InventoryError::HoldConflict { .. }));
    }

    #[test]
    fn insufficient_leaves_counters_untouched() {
        let mut zone = Zone::new(2, None);
        let outcome = zone.reserve(BookingId::new(), 3, at(0), TTL).unwrap();
        assert_eq!(outcome, ReserveOutcome::Insufficient { available: 2 });
        assert_eq!(zone.counters.available, 2);
        assert_eq!(zone.counters.version, 0);
    }

    #[test]
    fn exactly_available_plus_one_fails() {
        let mut zone = Zone::new(5, None);
        zone.reserve(BookingId::new(), 2, at(0), TTL).unwrap();
        // available is now 3; ask for 4.
        let outcome = zone.reserve(BookingId::new(), 4, at(1), TTL).unwrap();
        assert_eq!(outcome, ReserveOutcome::Insufficient { available: 3 });
    }

    #[test]
    fn confirm_moves_reserved_to_sold_and_is_idempotent() {
        let mut zone = Zone::new(10, None);
        let key = BookingId::new();
        zone.reserve(key, 2, at(0), TTL).unwrap();

        let first = zone.confirm(key, at(1));
        let ConfirmOutcome::Confirmed(counters) = first else {
            panic!("expected Confirmed");
        };
        assert_eq!(
            (counters.available, counters.reserved, counters.sold),
            (8, 0, 2)
        );

        let second = zone.confirm(key, at(2));
        assert!(matches!(second, ConfirmOutcome::Confirmed(_)));
        assert_eq!(zone.counters.sold, 2);
    }

    #[test]
    fn confirm_of_unknown_hold_is_not_found() {
        let mut zone = Zone::new(10, None);
        assert_eq!(zone.confirm(BookingId::new(), at(0)), ConfirmOutcome::NotFound);
    }

    #[test]
    fn expired_hold_is_swept_and_confirm_reports_expired() {
        let mut zone = Zone::new(10, None);
        let key = BookingId::new();
        zone.reserve(key, 4, at(0), Duration::from_secs(60)).unwrap();

        // One second past the TTL: any touch sweeps the hold.
        let outcome = zone.confirm(key, at(61));
        assert_eq!(outcome, ConfirmOutcome::Expired);
        assert_eq!(zone.counters.available, 10);
        assert_eq!(zone.counters.reserved, 0);
    }

    #[test]
    fn release_after_expiry_is_a_noop() {
        let mut zone = Zone::new(10, None);
        let key = BookingId::new();
        zone.reserve(key, 4, at(0), Duration::from_secs(60)).unwrap();
        zone.sweep(at(120));

        assert_eq!(zone.release(key, at(121)), ReleaseOutcome::NotFound);
        assert_eq!(zone.counters.available, 10);
    }

    #[test]
    fn release_returns_seats_and_is_idempotent() {
        let mut zone = Zone::new(10, None);
        let key = BookingId::new();
        zone.reserve(key, 4, at(0), TTL).unwrap();

        let first = zone.release(key, at(1));
        assert!(matches!(first, ReleaseOutcome::Released(_)));
        assert_eq!(zone.counters.available, 10);

        assert_eq!(zone.release(key, at(2)), ReleaseOutcome::NotFound);
        assert_eq!(zone.counters.available, 10);
    }

    #[test]
    fn sale_window_gates_reservation() {
        let window = SaleWindow {
            opens_at: at(100),
            closes_at: at(200),
        };
        let mut zone = Zone::new(10, Some(window));

        assert_eq!(
            zone.reserve(BookingId::new(), 1, at(50), TTL).unwrap(),
            ReserveOutcome::SaleClosed
        );
        assert!(matches!(
            zone.reserve(BookingId::new(), 1, at(150), TTL).unwrap(),
            ReserveOutcome::Reserved(_)
        ));
        assert_eq!(
            zone.reserve(BookingId::new(), 1, at(250), TTL).unwrap(),
            ReserveOutcome::SaleClosed
        );
    }

    #[test]
    fn reseeding_does_not_clobber_live_state() {
        let mut ledger = Ledger::default();
        let key = ZoneKey::new(booking_rush_core::ShowId::new(), booking_rush_core::ZoneId::new());
        ledger.seed(key, 10, None);
        ledger
            .zone_mut(key)
            .unwrap()
            .reserve(BookingId::new(), 4, at(0), TTL)
            .unwrap();

        ledger.seed(key, 10, None);
        assert_eq!(ledger.snapshot(key).unwrap().available, 6);
    }

    /// A random interleaving of reserve/confirm/release/sweep commands
    /// never breaks conservation and never oversells.
    #[derive(Debug, Clone)]
    enum Op {
        Reserve { slot: usize, quantity: u32 },
        Confirm { slot: usize },
        Release { slot: usize },
        Sweep { advance_secs: u32 },
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..8usize, 1..5u32).prop_map(|(slot, quantity)| Op::Reserve { slot, quantity }),
            (0..8usize).prop_map(|slot| Op::Confirm { slot }),
            (0..8usize).prop_map(|slot| Op::Release { slot }),
            (0..120u32).prop_map(|advance_secs| Op::Sweep { advance_secs }),
        ]
    }

    proptest! {
        #[test]
        fn conservation_holds_under_any_interleaving(
            total in 1..50u32,
            ops in prop::collection::vec(op_strategy(), 1..120),
        ) {
            let mut zone = Zone::new(total, None);
            let keys: Vec<BookingId> = (0..8).map(|_| BookingId::new()).collect();
            let mut now = at(0);

            for op in ops {
                match op {
                    Op::Reserve { slot, quantity } => {
                        let _ = zone.reserve(keys[slot], quantity, now, Duration::from_secs(60));
                    }
                    Op::Confirm { slot } => {
                        let _ = zone.confirm(keys[slot], now);
                    }
                    Op::Release { slot } => {
                        let _ = zone.release(keys[slot], now);
                    }
                    Op::Sweep { advance_secs } => {
                        now += chrono::Duration::seconds(i64::from(advance_secs));
                        zone.sweep(now);
                    }
                }
                prop_assert!(zone.counters.is_conserved());
                prop_assert!(zone.counters.total == total);
            }
        }
    }
}
