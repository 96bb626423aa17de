//! # Booking Rush Postgres
//!
//! `PostgreSQL` implementations of the durable stores:
//!
//! - [`PostgresBookingStore`]: bookings with transactional outbox co-writes
//! - [`PostgresOutboxStore`]: the dispatcher's view of pending messages
//! - [`PostgresDeadLetterStore`]: messages that exhausted their retries
//! - [`PostgresSagaStore`]: the persisted saga state machine
//! - [`PostgresIdempotencyStore`]: request dedup claims and responses
//!
//! All queries are runtime-checked (`sqlx::query` + binds); nothing here
//! needs a live database to compile. Schema DDL lives in [`schema`] and is
//! applied idempotently at startup.
//!
//! The `bookings` CHECK constraints (`quantity > 0`,
//! `total_price = unit_price * quantity`) are the secondary defense behind
//! the inventory engine: they turn logic bugs into loud failures instead of
//! silent overselling.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod booking_store;
mod dead_letter;
mod idempotency_store;
mod outbox_store;
mod saga_store;
pub mod schema;

pub use booking_store::PostgresBookingStore;
pub use dead_letter::PostgresDeadLetterStore;
pub use idempotency_store::PostgresIdempotencyStore;
pub use outbox_store::PostgresOutboxStore;
pub use saga_store::PostgresSagaStore;

use booking_rush_core::StoreError;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

/// Connects a pool with the workspace's standard options.
///
/// # Errors
///
/// Returns the underlying `sqlx` error if the database is unreachable.
pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(url)
        .await
}

/// Maps an `sqlx` error to the store error taxonomy. Unique violations
/// become conflicts; everything else is infrastructure.
pub(crate) fn store_err(error: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &error {
        if db.code().as_deref() == Some("23505") {
            return StoreError::Conflict(db.message().to_string());
        }
    }
    StoreError::Database(error.to_string())
}
