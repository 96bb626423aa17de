//! # Booking Rush Core
//!
//! Domain model and abstractions for the Booking Rush reservation pipeline.
//!
//! This crate defines the vocabulary shared by every other crate in the
//! workspace:
//!
//! - **Identifiers and money** ([`types`])
//! - **The booking aggregate and its state machine** ([`booking`])
//! - **Zone counters and the atomic inventory contract** ([`inventory`])
//! - **The transactional outbox and dead-letter records** ([`outbox`])
//! - **Idempotency records and the dedup contract** ([`idempotency`])
//! - **The message-bus abstraction and topic names** ([`bus`], [`topics`])
//! - **The error taxonomy of the public API** ([`error`])
//!
//! ## Architecture principles
//!
//! - Stores and the bus are traits; production implementations live in
//!   sibling crates (`booking-rush-postgres`, `booking-rush-inventory`,
//!   `booking-rush-redpanda`) and in-memory ones in `booking-rush-testing`.
//! - The booking aggregate is owned by the record store; in-memory views are
//!   snapshots. Inventory holds are coupled to bookings only by equality of
//!   `hold_key == booking_id`.
//! - No module-level mutable state: everything mutable lives behind an
//!   injected store.

pub mod booking;
pub mod bus;
pub mod clock;
pub mod error;
pub mod idempotency;
pub mod inventory;
pub mod outbox;
pub mod topics;
pub mod types;

pub use booking::{Booking, BookingStatus, BookingStore, BookingUpdate, ZoneUsage};
pub use bus::{BusError, BusRecord, MessageBus, RecordStream};
pub use clock::{Clock, SystemClock};
pub use error::{ErrorCode, StoreError};
pub use idempotency::{IdempotencyBegin, IdempotencyRecord, IdempotencyStore, StoredResponse};
pub use inventory::{
    ConfirmOutcome, InventoryError, InventoryStore, ReleaseOutcome, ReserveOutcome, SaleWindow,
    ZoneCounters, ZoneKey,
};
pub use outbox::{
    DeadLetter, DeadLetterStatus, DeadLetterStore, NewDeadLetter, NewOutboxMessage, OutboxMessage,
    OutboxStatus, OutboxStore,
};
pub use types::{BookingId, EventId, Money, Page, PaymentId, SagaId, ShowId, UserId, ZoneId};
