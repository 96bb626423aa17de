//! The booking aggregate and its durable store contract.
//!
//! A booking moves through exactly one of three legal transitions out of
//! `reserved`:
//!
//! ```text
//! reserved ──confirm──► confirmed
//! reserved ──cancel───► cancelled
//! reserved ──expire───► expired
//! ```
//!
//! Terminal states never change. The durable store is the arbiter of
//! transition order: a transition is a conditional update on the expected
//! status, co-written with its outbox event in a single transaction.

use crate::error::StoreError;
use crate::inventory::ZoneKey;
use crate::outbox::NewOutboxMessage;
use crate::types::{BookingId, EventId, Money, Page, PaymentId, ShowId, UserId, ZoneId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    /// Seats are held; awaiting payment and confirmation.
    Reserved,
    /// Payment succeeded; seats are sold. Terminal.
    Confirmed,
    /// The user (or a saga compensation) cancelled. Terminal.
    Cancelled,
    /// The reservation TTL elapsed unconfirmed. Terminal.
    Expired,
}

impl BookingStatus {
    /// Database/wire string for this status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    /// Parses a database/wire string.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] for unknown status strings.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "reserved" => Ok(Self::Reserved),
            "confirmed" => Ok(Self::Confirmed),
            "cancelled" => Ok(Self::Cancelled),
            "expired" => Ok(Self::Expired),
            _ => Err(StoreError::Serialization(format!(
                "invalid booking status: {s}"
            ))),
        }
    }

    /// Whether this state admits no further transitions.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Reserved)
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The booking aggregate root.
///
/// Owned by the record store; values of this type are snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    /// Stable booking identifier; also the inventory hold key.
    pub booking_id: BookingId,
    /// Owner of the booking.
    pub user_id: UserId,
    /// Catalog event being booked.
    pub event_id: EventId,
    /// Show within the event.
    pub show_id: ShowId,
    /// Zone within the show.
    pub zone_id: ZoneId,
    /// Seats reserved; always at least 1.
    pub quantity: u32,
    /// Price per seat in minor units.
    pub unit_price: Money,
    /// `unit_price * quantity`, exact to the cent.
    pub total_price: Money,
    /// ISO currency code.
    pub currency: String,
    /// Current lifecycle state.
    pub status: BookingStatus,
    /// Caller-supplied dedup key, if any.
    pub idempotency_key: Option<String>,
    /// When the seats were deducted.
    pub reserved_at: DateTime<Utc>,
    /// Deadline for confirmation; always after `reserved_at`.
    pub expires_at: DateTime<Utc>,
    /// Set on transition to `confirmed`.
    pub confirmed_at: Option<DateTime<Utc>>,
    /// Set on transition to `cancelled`.
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Gateway payment id captured on confirmation.
    pub payment_id: Option<PaymentId>,
    /// Human-readable code issued on confirmation.
    pub confirmation_code: Option<String>,
}

impl Booking {
    /// The inventory key this booking holds seats in.
    #[must_use]
    pub const fn zone_key(&self) -> ZoneKey {
        ZoneKey::new(self.show_id, self.zone_id)
    }

    /// Whether the reservation window has elapsed without confirmation.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == BookingStatus::Reserved && now >= self.expires_at
    }
}

/// A legal transition out of `reserved`, applied by the store in the same
/// transaction as the outbox append.
#[derive(Debug, Clone, PartialEq)]
pub enum BookingUpdate {
    /// `reserved → confirmed` with payment evidence.
    Confirm {
        /// Gateway payment id, when the confirmation came through the
        /// payment path.
        payment_id: Option<PaymentId>,
        /// Code handed to the user.
        confirmation_code: String,
        /// Transition instant.
        at: DateTime<Utc>,
    },
    /// `reserved → cancelled`.
    Cancel {
        /// Transition instant.
        at: DateTime<Utc>,
    },
    /// `reserved → expired`. The expiry instant is already recorded in
    /// `expires_at`.
    Expire,
}

impl BookingUpdate {
    /// The status this update transitions into.
    #[must_use]
    pub const fn target_status(&self) -> BookingStatus {
        match self {
            Self::Confirm { .. } => BookingStatus::Confirmed,
            Self::Cancel { .. } => BookingStatus::Cancelled,
            Self::Expire => BookingStatus::Expired,
        }
    }

    /// Applies the transition to an in-memory snapshot.
    pub fn apply(self, booking: &mut Booking) {
        match self {
            Self::Confirm {
                payment_id,
                confirmation_code,
                at,
            } => {
                booking.status = BookingStatus::Confirmed;
                booking.confirmed_at = Some(at);
                booking.payment_id = payment_id;
                booking.confirmation_code = Some(confirmation_code);
            }
            Self::Cancel { at } => {
                booking.status = BookingStatus::Cancelled;
                booking.cancelled_at = Some(at);
            }
            Self::Expire => {
                booking.status = BookingStatus::Expired;
            }
        }
    }
}

/// Per-zone usage derived from durable bookings; input to the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneUsage {
    /// The zone.
    pub zone: ZoneKey,
    /// Seats in live (unexpired) `reserved` bookings.
    pub active_reserved: u32,
    /// Seats in `confirmed` bookings.
    pub sold: u32,
}

/// Durable store of bookings, co-writing outbox events transactionally.
///
/// Implementations: `PostgresBookingStore` (production) and
/// `InMemoryStore` (testing). Every mutating method writes the booking row
/// and the given outbox message in one atomic unit; an outbox message is
/// visible to the dispatcher iff its originating state change is durable.
#[async_trait]
pub trait BookingStore: Send + Sync {
    /// Inserts a fresh `reserved` booking together with its
    /// `booking.reserved` outbox event.
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`] if the booking id or idempotency key already
    /// exists; [`StoreError::Database`] on infrastructure failure.
    async fn insert_reserved(
        &self,
        booking: &Booking,
        outbox: NewOutboxMessage,
    ) -> Result<(), StoreError>;

    /// Applies a transition conditionally on the current status being
    /// `expected`, appending the outbox event in the same transaction.
    /// Returns the booking after the transition.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if no such booking exists;
    /// [`StoreError::Conflict`] if the booking is not in `expected` status
    /// (the message carries the actual status string).
    async fn transition(
        &self,
        booking_id: BookingId,
        expected: BookingStatus,
        update: BookingUpdate,
        outbox: NewOutboxMessage,
    ) -> Result<Booking, StoreError>;

    /// Loads one booking.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] on infrastructure failure.
    async fn fetch(&self, booking_id: BookingId) -> Result<Option<Booking>, StoreError>;

    /// Lists a user's bookings, most recent first.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] on infrastructure failure.
    async fn list_for_user(&self, user_id: UserId, page: Page)
        -> Result<Vec<Booking>, StoreError>;

    /// Sum of seat quantities in this user's `reserved` and `confirmed`
    /// bookings for the event. Input to the per-user quota check.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] on infrastructure failure.
    async fn quota_used(&self, user_id: UserId, event_id: EventId) -> Result<u32, StoreError>;

    /// Reserved bookings whose TTL elapsed at or before `now`, oldest
    /// first, limited to `limit` rows. The expiry sweeper's work list.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] on infrastructure failure.
    async fn due_expirations(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Booking>, StoreError>;

    /// Aggregated per-zone reserved/sold usage across all live bookings.
    /// The reconciler's view of durable truth.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] on infrastructure failure.
    async fn zone_usage(&self) -> Result<Vec<ZoneUsage>, StoreError>;
}
