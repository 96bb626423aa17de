//! # Booking Rush Testing
//!
//! In-memory implementations of every store and bus trait in
//! `booking-rush-core`, plus a controllable clock and booking fixtures.
//!
//! These are the deterministic doubles the whole workspace tests against:
//! no Docker, no network, no sleeps for TTL expiry; advance the
//! [`MockClock`] instead.
//!
//! ```
//! use booking_rush_testing::{MockClock, test_clock};
//! use booking_rush_core::Clock;
//!
//! let clock = test_clock();
//! let before = clock.now();
//! clock.advance(chrono::Duration::minutes(15));
//! assert_eq!(clock.now() - before, chrono::Duration::minutes(15));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod mocks;

pub use mocks::{
    InMemoryBus, InMemoryDeadLetterStore, InMemoryIdempotencyStore, InMemoryStore, MockClock,
    test_clock,
};
