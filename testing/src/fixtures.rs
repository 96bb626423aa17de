//! Booking fixtures for tests.

use booking_rush_core::{
    Booking, BookingId, BookingStatus, EventId, Money, ShowId, UserId, ZoneId,
};
use chrono::{DateTime, Duration, Utc};

/// A fresh `reserved` booking: 2 seats at 100 minor units each, 10-minute
/// TTL from `now`. Override fields with struct-update syntax as needed.
#[must_use]
pub fn reserved_booking(now: DateTime<Utc>) -> Booking {
    Booking {
        booking_id: BookingId::new(),
        user_id: UserId::new(),
        event_id: EventId::new(),
        show_id: ShowId::new(),
        zone_id: ZoneId::new(),
        quantity: 2,
        unit_price: Money::from_cents(100),
        total_price: Money::from_cents(200),
        currency: "THB".to_string(),
        status: BookingStatus::Reserved,
        idempotency_key: None,
        reserved_at: now,
        expires_at: now + Duration::minutes(10),
        confirmed_at: None,
        cancelled_at: None,
        payment_id: None,
        confirmation_code: None,
    }
}
