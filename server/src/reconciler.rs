//! The inventory reconciler: a periodic audit of engine counters against
//! durable booking truth.
//!
//! For each seeded zone it derives what the counters *should* be,
//! `available := total − confirmed_sold − active_reserved`, and rebuilds
//! the zone from durable truth when the drift exceeds the tolerance. A
//! self-healing audit, not a hot-path guard: small transient drift from
//! in-flight requests is expected and logged, not corrected.

use crate::config::BackgroundConfig;
use booking_rush_core::{BookingStore, InventoryStore, ZoneCounters, ZoneKey, ZoneUsage};
use std::collections::HashMap;
use std::sync::Arc;

/// Periodically re-derives zone counters from the booking store.
pub struct Reconciler {
    bookings: Arc<dyn BookingStore>,
    inventory: Arc<dyn InventoryStore>,
    config: BackgroundConfig,
}

impl Reconciler {
    /// Creates a reconciler.
    #[must_use]
    pub fn new(
        bookings: Arc<dyn BookingStore>,
        inventory: Arc<dyn InventoryStore>,
        config: BackgroundConfig,
    ) -> Self {
        Self {
            bookings,
            inventory,
            config,
        }
    }

    /// Runs audit cycles forever.
    pub async fn run(self) {
        let mut tick = tokio::time::interval(self.config.reconciler_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            self.reconcile().await;
        }
    }

    /// One audit cycle; returns how many zones were rebuilt. Public so
    /// tests can drive it deterministically.
    pub async fn reconcile(&self) -> usize {
        let usage: HashMap<ZoneKey, ZoneUsage> = match self.bookings.zone_usage().await {
            Ok(usage) => usage.into_iter().map(|u| (u.zone, u)).collect(),
            Err(error) => {
                tracing::error!(error = %error, "reconciler could not read durable usage");
                return 0;
            }
        };
        let zones = match self.inventory.zones().await {
            Ok(zones) => zones,
            Err(error) => {
                tracing::error!(error = %error, "reconciler could not list zones");
                return 0;
            }
        };

        let mut rebuilt = 0;
        for zone in zones {
            let snapshot = match self.inventory.snapshot(zone).await {
                Ok(Some(snapshot)) => snapshot,
                Ok(None) => continue,
                Err(error) => {
                    tracing::error!(zone = %zone, error = %error, "snapshot failed");
                    continue;
                }
            };

            let (active_reserved, sold) = usage
                .get(&zone)
                .map_or((0, 0), |u| (u.active_reserved, u.sold));
            let expected_available = snapshot
                .total
                .saturating_sub(sold)
                .saturating_sub(active_reserved);

            let drift = snapshot.available.abs_diff(expected_available)
                .max(snapshot.reserved.abs_diff(active_reserved))
                .max(snapshot.sold.abs_diff(sold));
            if drift == 0 {
                continue;
            }

            tracing::warn!(
                zone = %zone,
                drift,
                engine_available = snapshot.available,
                engine_reserved = snapshot.reserved,
                engine_sold = snapshot.sold,
                db_reserved = active_reserved,
                db_sold = sold,
                "inventory counters drift from durable truth"
            );
            metrics::counter!("reconciler.drift_detected").increment(1);

            if drift <= self.config.reconciler_tolerance {
                continue;
            }

            let counters = ZoneCounters {
                total: snapshot.total,
                available: expected_available,
                reserved: active_reserved,
                sold,
                version: snapshot.version,
            };
            match self.inventory.rebuild(zone, counters).await {
                Ok(()) => {
                    rebuilt += 1;
                    metrics::counter!("reconciler.zones_rebuilt").increment(1);
                    tracing::warn!(zone = %zone, "zone rebuilt from durable truth");
                }
                Err(error) => {
                    tracing::error!(zone = %zone, error = %error, "zone rebuild failed");
                }
            }
        }
        rebuilt
    }
}
