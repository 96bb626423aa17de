//! The reservation service: reserve / confirm / cancel / read.
//!
//! Composes the atomic inventory engine, the booking store (with its
//! transactional outbox) and the catalog. The ordering inside `reserve` is
//! the contract: quota before deduct, deduct before the durable write, and
//! a compensating release if the durable write fails after the deduct. If
//! both the write and the release fail, the hold's TTL is the backstop;
//! the engine sweeps it back to `available` on its own.

use crate::config::Config;
use crate::service::catalog::PriceCatalog;
use booking_rush_core::{
    Booking, BookingId, BookingStatus, BookingStore, BookingUpdate, Clock, ConfirmOutcome,
    ErrorCode, EventId, InventoryError, InventoryStore, Money, NewOutboxMessage, Page, PaymentId,
    ReleaseOutcome, ReserveOutcome, SagaId, ShowId, StoreError, UserId, ZoneId, ZoneKey,
};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Input to [`ReservationService::reserve`].
#[derive(Debug, Clone)]
pub struct ReserveRequest {
    /// The authenticated user.
    pub user_id: UserId,
    /// Event being booked.
    pub event_id: EventId,
    /// Show within the event.
    pub show_id: ShowId,
    /// Zone within the show.
    pub zone_id: ZoneId,
    /// Seats requested.
    pub quantity: u32,
    /// Client-supplied unit price; resolved from the catalog when absent.
    pub unit_price: Option<Money>,
    /// Caller's dedup key, recorded on the booking.
    pub idempotency_key: Option<String>,
}

/// Reservation pipeline failures.
#[derive(Error, Debug)]
pub enum ReservationError {
    /// The zone cannot cover the requested quantity.
    #[error("insufficient seats: requested {requested}, available {available}")]
    InsufficientSeats {
        /// Seats asked for.
        requested: u32,
        /// Seats available at the decision instant.
        available: u32,
    },

    /// The per-user, per-event ticket limit would be exceeded.
    #[error("ticket limit of {limit} per user would be exceeded")]
    QuotaExceeded {
        /// The applicable limit.
        limit: u32,
    },

    /// The zone's sale window is not open.
    #[error("sale is not open for this zone")]
    SaleClosed,

    /// No such booking (or not this user's booking).
    #[error("booking not found")]
    NotFound,

    /// The reservation TTL elapsed.
    #[error("reservation expired")]
    Expired,

    /// The operation is not legal in the booking's current state.
    #[error("operation not allowed while booking is {status}")]
    InvalidState {
        /// The booking's actual state.
        status: BookingStatus,
    },

    /// The idempotency key is already bound to another booking.
    #[error("idempotency key already used")]
    IdempotencyConflict,

    /// The request failed validation before touching any state.
    #[error("{0}")]
    Validation(String),

    /// Durable store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Inventory engine failure.
    #[error(transparent)]
    Inventory(#[from] InventoryError),
}

impl ReservationError {
    /// The taxonomy code for this failure.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InsufficientSeats { .. } => ErrorCode::InsufficientSeats,
            Self::QuotaExceeded { .. } => ErrorCode::QuotaExceeded,
            Self::SaleClosed => ErrorCode::SaleClosed,
            Self::NotFound => ErrorCode::NotFound,
            Self::Expired => ErrorCode::Expired,
            Self::InvalidState { .. } => ErrorCode::StateConflict,
            Self::IdempotencyConflict => ErrorCode::IdempotencyConflict,
            Self::Validation(_) => ErrorCode::Validation,
            Self::Store(StoreError::NotFound) => ErrorCode::NotFound,
            Self::Store(StoreError::Conflict(_)) => ErrorCode::StateConflict,
            Self::Inventory(InventoryError::UnknownZone(_)) => ErrorCode::NotFound,
            Self::Store(_) | Self::Inventory(_) => ErrorCode::Internal,
        }
    }
}

/// The reservation service (the public mutation surface of the core).
pub struct ReservationService {
    bookings: Arc<dyn BookingStore>,
    inventory: Arc<dyn InventoryStore>,
    catalog: Arc<dyn PriceCatalog>,
    clock: Arc<dyn Clock>,
    config: Arc<Config>,
}

impl ReservationService {
    /// Wires the service.
    #[must_use]
    pub fn new(
        bookings: Arc<dyn BookingStore>,
        inventory: Arc<dyn InventoryStore>,
        catalog: Arc<dyn PriceCatalog>,
        clock: Arc<dyn Clock>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            bookings,
            inventory,
            catalog,
            clock,
            config,
        }
    }

    /// Reserves seats: quota check, atomic deduct, durable insert with the
    /// `booking.reserved` outbox event. Fail-fast in that order.
    ///
    /// # Errors
    ///
    /// See [`ReservationError`]; `InsufficientSeats` and `QuotaExceeded`
    /// leave no trace in any store.
    pub async fn reserve(&self, request: ReserveRequest) -> Result<Booking, ReservationError> {
        if request.quantity == 0 {
            return Err(ReservationError::Validation(
                "quantity must be at least 1".to_string(),
            ));
        }

        let limit = self.config.ticket_limit(request.event_id);
        let used = self
            .bookings
            .quota_used(request.user_id, request.event_id)
            .await?;
        if used + request.quantity > limit {
            metrics::counter!("reservations.quota_rejected").increment(1);
            return Err(ReservationError::QuotaExceeded { limit });
        }

        let booking_id = BookingId::new();
        let zone = ZoneKey::new(request.show_id, request.zone_id);
        let ttl = self.config.reservation.reservation_ttl;

        match self
            .inventory
            .reserve(zone, booking_id, request.quantity, ttl)
            .await?
        {
            ReserveOutcome::Reserved(_) => {}
            ReserveOutcome::Insufficient { available } => {
                return Err(ReservationError::InsufficientSeats {
                    requested: request.quantity,
                    available,
                });
            }
            ReserveOutcome::SaleClosed => return Err(ReservationError::SaleClosed),
        }

        match self.persist_reservation(booking_id, zone, &request).await {
            Ok(booking) => Ok(booking),
            Err(error) => {
                // The deduct happened but the durable write did not:
                // compensate immediately. If the release itself fails, the
                // hold TTL sweeps the seats back.
                if let Err(release_error) = self.inventory.release(zone, booking_id).await {
                    tracing::error!(
                        %booking_id,
                        error = %release_error,
                        "compensating release failed, hold TTL is the backstop"
                    );
                }
                Err(error)
            }
        }
    }

    async fn persist_reservation(
        &self,
        booking_id: BookingId,
        zone: ZoneKey,
        request: &ReserveRequest,
    ) -> Result<Booking, ReservationError> {
        let (unit_price, currency) = match request.unit_price {
            Some(price) => {
                let currency = self
                    .catalog
                    .unit_price(zone)
                    .map_or_else(|| "THB".to_string(), |(_, currency)| currency);
                (price, currency)
            }
            None => self.catalog.unit_price(zone).ok_or_else(|| {
                ReservationError::Validation("zone has no published price".to_string())
            })?,
        };
        let total_price = unit_price
            .checked_mul(request.quantity)
            .ok_or_else(|| ReservationError::Validation("total price overflows".to_string()))?;

        let now = self.clock.now();
        let expires_at = now
            + chrono::Duration::from_std(self.config.reservation.reservation_ttl)
                .unwrap_or_else(|_| chrono::Duration::minutes(10));

        let booking = Booking {
            booking_id,
            user_id: request.user_id,
            event_id: request.event_id,
            show_id: request.show_id,
            zone_id: request.zone_id,
            quantity: request.quantity,
            unit_price,
            total_price,
            currency,
            status: BookingStatus::Reserved,
            idempotency_key: request.idempotency_key.clone(),
            reserved_at: now,
            expires_at,
            confirmed_at: None,
            cancelled_at: None,
            payment_id: None,
            confirmation_code: None,
        };

        let saga_id = SagaId::new();
        let payload = serde_json::json!({
            "event": "booking.reserved",
            "saga_id": saga_id,
            "booking": booking,
            "deadline": expires_at,
            "timestamp": now,
        });
        let outbox = NewOutboxMessage::booking_event("booking.reserved", booking_id, payload);

        self.bookings
            .insert_reserved(&booking, outbox)
            .await
            .map_err(|error| match error {
                StoreError::Conflict(_) => ReservationError::IdempotencyConflict,
                other => ReservationError::Store(other),
            })?;

        metrics::counter!("reservations.reserved").increment(1);
        tracing::info!(
            %booking_id,
            %saga_id,
            user_id = %request.user_id,
            zone = %zone,
            quantity = request.quantity,
            "booking reserved"
        );
        Ok(booking)
    }

    /// Confirms a reserved booking: inventory `reserved → sold`, then the
    /// durable flip with the `booking.confirmed` outbox event.
    ///
    /// Idempotent: confirming a confirmed booking returns its snapshot.
    /// Confirming past the TTL expires the booking and returns `Expired`.
    ///
    /// # Errors
    ///
    /// See [`ReservationError`].
    pub async fn confirm(
        &self,
        booking_id: BookingId,
        payment_id: Option<PaymentId>,
    ) -> Result<Booking, ReservationError> {
        let booking = self
            .bookings
            .fetch(booking_id)
            .await?
            .ok_or(ReservationError::NotFound)?;

        match booking.status {
            BookingStatus::Confirmed => return Ok(booking),
            BookingStatus::Cancelled => {
                return Err(ReservationError::InvalidState {
                    status: booking.status,
                });
            }
            BookingStatus::Expired => return Err(ReservationError::Expired),
            BookingStatus::Reserved => {}
        }

        let now = self.clock.now();
        if now >= booking.expires_at {
            self.expire(&booking).await?;
            return Err(ReservationError::Expired);
        }

        self.confirm_hold(&booking, now).await?;

        let confirmation_code = generate_confirmation_code();
        let payload = serde_json::json!({
            "event": "booking.confirmed",
            "booking_id": booking_id,
            "payment_id": payment_id,
            "confirmation_code": confirmation_code,
            "timestamp": now,
        });
        let update = BookingUpdate::Confirm {
            payment_id,
            confirmation_code,
            at: now,
        };
        let outbox = NewOutboxMessage::booking_event("booking.confirmed", booking_id, payload);

        match self
            .bookings
            .transition(booking_id, BookingStatus::Reserved, update, outbox)
            .await
        {
            Ok(confirmed) => {
                metrics::counter!("reservations.confirmed").increment(1);
                tracing::info!(%booking_id, "booking confirmed");
                Ok(confirmed)
            }
            // A concurrent confirm (saga worker vs. client) won; its
            // outcome is ours.
            Err(StoreError::Conflict(actual)) if actual == "confirmed" => self
                .bookings
                .fetch(booking_id)
                .await?
                .ok_or(ReservationError::NotFound),
            Err(StoreError::Conflict(actual)) => Err(ReservationError::InvalidState {
                status: BookingStatus::parse(&actual)?,
            }),
            Err(error) => Err(error.into()),
        }
    }

    /// Moves the hold to sold, healing a prematurely swept hold by
    /// re-acquiring it against durable truth.
    async fn confirm_hold(
        &self,
        booking: &Booking,
        now: DateTime<Utc>,
    ) -> Result<(), ReservationError> {
        let zone = booking.zone_key();
        match self.inventory.confirm(zone, booking.booking_id).await? {
            ConfirmOutcome::Confirmed(_) => return Ok(()),
            ConfirmOutcome::Expired | ConfirmOutcome::NotFound => {}
        }

        // The durable row says reserved-and-live, but the engine has no
        // hold (swept early, or the engine restarted). Re-acquire for the
        // remaining TTL and confirm again.
        let remaining = (booking.expires_at - now)
            .to_std()
            .unwrap_or(Duration::from_secs(1));
        match self
            .inventory
            .reserve(zone, booking.booking_id, booking.quantity, remaining)
            .await?
        {
            ReserveOutcome::Reserved(_) => {}
            ReserveOutcome::Insufficient { .. } | ReserveOutcome::SaleClosed => {
                // The seats went to someone else in the gap; the booking
                // cannot be honored.
                self.expire(booking).await?;
                return Err(ReservationError::Expired);
            }
        }
        match self.inventory.confirm(zone, booking.booking_id).await? {
            ConfirmOutcome::Confirmed(_) => Ok(()),
            ConfirmOutcome::Expired | ConfirmOutcome::NotFound => Err(
                ReservationError::Inventory(InventoryError::Unavailable(
                    "hold vanished during confirm".to_string(),
                )),
            ),
        }
    }

    /// Cancels the caller's reserved booking. Idempotent: cancelling a
    /// cancelled booking returns its snapshot.
    ///
    /// # Errors
    ///
    /// See [`ReservationError`]; confirmed and expired bookings are
    /// `InvalidState`.
    pub async fn cancel(
        &self,
        booking_id: BookingId,
        user_id: UserId,
    ) -> Result<Booking, ReservationError> {
        let booking = self
            .bookings
            .fetch(booking_id)
            .await?
            .ok_or(ReservationError::NotFound)?;
        if booking.user_id != user_id {
            return Err(ReservationError::NotFound);
        }

        match booking.status {
            BookingStatus::Cancelled => Ok(booking),
            BookingStatus::Confirmed | BookingStatus::Expired => {
                Err(ReservationError::InvalidState {
                    status: booking.status,
                })
            }
            BookingStatus::Reserved => self.do_cancel(&booking).await,
        }
    }

    async fn do_cancel(&self, booking: &Booking) -> Result<Booking, ReservationError> {
        let now = self.clock.now();
        let payload = serde_json::json!({
            "event": "booking.cancelled",
            "booking_id": booking.booking_id,
            "timestamp": now,
        });
        let outbox =
            NewOutboxMessage::booking_event("booking.cancelled", booking.booking_id, payload);

        let cancelled = match self
            .bookings
            .transition(
                booking.booking_id,
                BookingStatus::Reserved,
                BookingUpdate::Cancel { at: now },
                outbox,
            )
            .await
        {
            Ok(cancelled) => cancelled,
            Err(StoreError::Conflict(actual)) if actual == "cancelled" => self
                .bookings
                .fetch(booking.booking_id)
                .await?
                .ok_or(ReservationError::NotFound)?,
            Err(StoreError::Conflict(actual)) => {
                return Err(ReservationError::InvalidState {
                    status: BookingStatus::parse(&actual)?,
                });
            }
            Err(error) => return Err(error.into()),
        };

        self.release_hold(booking).await;
        metrics::counter!("reservations.cancelled").increment(1);
        tracing::info!(booking_id = %booking.booking_id, "booking cancelled");
        Ok(cancelled)
    }

    /// Saga compensation entry point: put the booking's seats back and
    /// record the cancellation. Tolerates every already-done state.
    ///
    /// # Errors
    ///
    /// Only infrastructure failures; "already compensated" is success.
    pub async fn release_for_saga(&self, booking_id: BookingId) -> Result<(), ReservationError> {
        let Some(booking) = self.bookings.fetch(booking_id).await? else {
            return Ok(());
        };
        match booking.status {
            BookingStatus::Reserved => {
                self.do_cancel(&booking).await?;
                Ok(())
            }
            BookingStatus::Cancelled | BookingStatus::Expired => Ok(()),
            BookingStatus::Confirmed => {
                // Sold seats are not clawed back behind the user's back;
                // the refund step and an operator own this case.
                tracing::warn!(%booking_id, "compensation requested for a confirmed booking");
                Ok(())
            }
        }
    }

    /// Expires a reserved booking past its TTL: durable flip, outbox
    /// `booking.expired`, inventory release. Idempotent; returns whether
    /// this call performed the transition.
    ///
    /// # Errors
    ///
    /// Only infrastructure failures.
    pub async fn expire(&self, booking: &Booking) -> Result<bool, ReservationError> {
        let now = self.clock.now();
        let payload = serde_json::json!({
            "event": "booking.expired",
            "booking_id": booking.booking_id,
            "timestamp": now,
        });
        let outbox =
            NewOutboxMessage::booking_event("booking.expired", booking.booking_id, payload);

        match self
            .bookings
            .transition(
                booking.booking_id,
                BookingStatus::Reserved,
                BookingUpdate::Expire,
                outbox,
            )
            .await
        {
            Ok(_) => {
                self.release_hold(booking).await;
                metrics::counter!("reservations.expired").increment(1);
                tracing::info!(booking_id = %booking.booking_id, "booking expired");
                Ok(true)
            }
            // Someone else already moved it; nothing to do.
            Err(StoreError::Conflict(_)) => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    /// Releases the booking's hold, tolerating an already-swept hold.
    async fn release_hold(&self, booking: &Booking) {
        match self
            .inventory
            .release(booking.zone_key(), booking.booking_id)
            .await
        {
            Ok(ReleaseOutcome::Released(_) | ReleaseOutcome::NotFound) => {}
            Err(error) => {
                tracing::error!(
                    booking_id = %booking.booking_id,
                    error = %error,
                    "hold release failed, hold TTL is the backstop"
                );
            }
        }
    }

    /// Loads the caller's booking.
    ///
    /// # Errors
    ///
    /// `NotFound` for missing bookings or other users' bookings.
    pub async fn get(
        &self,
        booking_id: BookingId,
        user_id: UserId,
    ) -> Result<Booking, ReservationError> {
        let booking = self
            .bookings
            .fetch(booking_id)
            .await?
            .ok_or(ReservationError::NotFound)?;
        if booking.user_id != user_id {
            return Err(ReservationError::NotFound);
        }
        Ok(booking)
    }

    /// Lists the caller's bookings, most recent first.
    ///
    /// # Errors
    ///
    /// Only infrastructure failures.
    pub async fn list(
        &self,
        user_id: UserId,
        page: Page,
    ) -> Result<Vec<Booking>, ReservationError> {
        Ok(self.bookings.list_for_user(user_id, page).await?)
    }

    /// The booking store, for components that share it.
    #[must_use]
    pub fn bookings(&self) -> Arc<dyn BookingStore> {
        Arc::clone(&self.bookings)
    }

    /// The inventory store, for components that share it.
    #[must_use]
    pub fn inventory(&self) -> Arc<dyn InventoryStore> {
        Arc::clone(&self.inventory)
    }
}

/// `BR-` plus eight random uppercase alphanumerics.
fn generate_confirmation_code() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
    let mut rng = rand::thread_rng();
    let code: String = (0..8)
        .map(|_| {
            let index = rng.gen_range(0..ALPHABET.len());
            ALPHABET[index] as char
        })
        .collect();
    format!("BR-{code}")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn confirmation_codes_are_well_formed() {
        let code = generate_confirmation_code();
        assert!(code.starts_with("BR-"));
        assert_eq!(code.len(), 11);
        assert!(code[3..].chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn error_codes_follow_the_taxonomy() {
        assert_eq!(
            ReservationError::InsufficientSeats {
                requested: 2,
                available: 1
            }
            .code(),
            ErrorCode::InsufficientSeats
        );
        assert_eq!(
            ReservationError::QuotaExceeded { limit: 4 }.code(),
            ErrorCode::QuotaExceeded
        );
        assert_eq!(ReservationError::Expired.code(), ErrorCode::Expired);
        assert_eq!(
            ReservationError::Store(StoreError::Database("down".to_string())).code(),
            ErrorCode::Internal
        );
    }
}
