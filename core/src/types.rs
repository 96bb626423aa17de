//! Identifier newtypes, money and pagination primitives.
//!
//! Every aggregate id is a UUID wrapped in its own type so that a
//! `booking_id` can never be passed where a `zone_id` is expected. Money is
//! an integer count of minor units (cents, satang) to keep price arithmetic
//! exact to cent precision.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a fresh random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wraps an existing UUID.
            #[must_use]
            pub const fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

define_id!(
    /// Identifies a user (authenticated subject).
    UserId
);
define_id!(
    /// Identifies a catalog event (concert, game, ...).
    EventId
);
define_id!(
    /// Identifies a show (a dated performance of an event).
    ShowId
);
define_id!(
    /// Identifies a seating zone within a show.
    ZoneId
);
define_id!(
    /// Identifies a booking. Doubles as the inventory hold key.
    BookingId
);
define_id!(
    /// Identifies a saga instance.
    SagaId
);

/// Identifier issued by the payment gateway for a captured payment.
///
/// Gateway ids are opaque strings (`"pay_..."`), not UUIDs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaymentId(String);

impl PaymentId {
    /// Wraps a gateway-issued payment id.
    #[must_use]
    pub const fn new(id: String) -> Self {
        Self(id)
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PaymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for PaymentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for PaymentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// An exact amount of money in minor units (cents).
///
/// All price arithmetic is integer arithmetic; overflow is surfaced, never
/// wrapped.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    /// Zero amount.
    pub const ZERO: Self = Self(0);

    /// Creates an amount from a count of minor units.
    #[must_use]
    pub const fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    /// Returns the amount in minor units.
    #[must_use]
    pub const fn cents(&self) -> i64 {
        self.0
    }

    /// Multiplies a unit price by a quantity, surfacing overflow.
    #[must_use]
    pub const fn checked_mul(&self, quantity: u32) -> Option<Self> {
        match self.0.checked_mul(quantity as i64) {
            Some(total) => Some(Self(total)),
            None => None,
        }
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pagination window for list endpoints. Pages are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    /// 1-based page number.
    pub page: u32,
    /// Rows per page.
    pub per_page: u32,
}

impl Page {
    /// Maximum rows a single page may request.
    pub const MAX_PER_PAGE: u32 = 100;

    /// Creates a page, clamping `per_page` to [`Self::MAX_PER_PAGE`].
    #[must_use]
    pub fn new(page: u32, per_page: u32) -> Self {
        Self {
            page: page.max(1),
            per_page: per_page.clamp(1, Self::MAX_PER_PAGE),
        }
    }

    /// Row offset of the first row on this page.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        (self.page as u64 - 1) * self.per_page as u64
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(1, 20)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_types_with_stable_display() {
        let id = Uuid::new_v4();
        let booking = BookingId::from_uuid(id);
        assert_eq!(booking.to_string(), id.to_string());
        assert_eq!(booking.as_uuid(), id);
    }

    #[test]
    fn money_multiplication_is_exact() {
        let unit = Money::from_cents(100);
        assert_eq!(unit.checked_mul(2), Some(Money::from_cents(200)));
        assert_eq!(Money::from_cents(i64::MAX).checked_mul(2), None);
    }

    #[test]
    fn page_clamps_inputs() {
        let page = Page::new(0, 1000);
        assert_eq!(page.page, 1);
        assert_eq!(page.per_page, Page::MAX_PER_PAGE);
        assert_eq!(page.offset(), 0);
        assert_eq!(Page::new(3, 20).offset(), 40);
    }
}
