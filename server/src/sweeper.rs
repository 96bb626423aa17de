//! The expiry sweeper: reserved bookings past their TTL become `expired`
//! and their seats go back to the pool.
//!
//! Idempotent by construction: the conditional durable transition means a
//! booking already moved by a concurrent confirm, cancel or another
//! sweeper instance is skipped.

use crate::config::BackgroundConfig;
use crate::service::ReservationService;
use booking_rush_core::{BookingStore, Clock};
use std::sync::Arc;

/// Sweeps expired reservations on a fixed cadence.
pub struct ExpirySweeper {
    service: Arc<ReservationService>,
    bookings: Arc<dyn BookingStore>,
    clock: Arc<dyn Clock>,
    config: BackgroundConfig,
}

impl ExpirySweeper {
    /// Creates a sweeper.
    #[must_use]
    pub fn new(
        service: Arc<ReservationService>,
        clock: Arc<dyn Clock>,
        config: BackgroundConfig,
    ) -> Self {
        let bookings = service.bookings();
        Self {
            service,
            bookings,
            clock,
            config,
        }
    }

    /// Runs sweep cycles forever.
    pub async fn run(self) {
        let mut tick = tokio::time::interval(self.config.sweeper_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            self.sweep().await;
        }
    }

    /// One sweep cycle; returns how many bookings were expired. Public so
    /// tests can drive it deterministically.
    pub async fn sweep(&self) -> usize {
        let due = match self
            .bookings
            .due_expirations(self.clock.now(), self.config.sweeper_batch)
            .await
        {
            Ok(due) => due,
            Err(error) => {
                tracing::error!(error = %error, "expiry sweep could not list due bookings");
                return 0;
            }
        };

        let mut expired = 0;
        for booking in due {
            match self.service.expire(&booking).await {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(error) => {
                    tracing::error!(
                        booking_id = %booking.booking_id,
                        error = %error,
                        "failed to expire booking"
                    );
                }
            }
        }

        if expired > 0 {
            tracing::info!(expired, "expiry sweep released stale reservations");
        }
        expired
    }
}
