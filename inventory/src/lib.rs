//! # Booking Rush Inventory
//!
//! The atomic inventory engine: per-zone seat counters behind a
//! single-threaded command loop.
//!
//! This crate is the primary defense against overselling. All mutations of
//! a zone's counters execute on one task, one command at a time, so every
//! `Reserve` is an atomic check-and-deduct: either the whole transition
//! `available -= qty, reserved += qty, record hold` applies, or nothing
//! does. No interleaving can observe a state where
//! `available + reserved + sold != total`.
//!
//! ```text
//! callers ──mpsc──► engine task ──► Zone { counters, holds }
//!   (any number)      (exactly one)
//! ```
//!
//! The per-zone serialization point is the designed bottleneck; the
//! critical section is O(1), sized to sustain the target request rate.
//!
//! Expired holds are swept lazily whenever a command touches their zone and
//! by a periodic sweep tick on the engine task itself. Sweeping an expired
//! hold is equivalent to releasing it.
//!
//! # Example
//!
//! ```no_run
//! use booking_rush_core::{Clock, SystemClock, InventoryStore, ZoneKey, ShowId, ZoneId, BookingId};
//! use booking_rush_inventory::InventoryEngine;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), booking_rush_core::InventoryError> {
//! let inventory = InventoryEngine::spawn(Arc::new(SystemClock), Duration::from_secs(5));
//! let zone = ZoneKey::new(ShowId::new(), ZoneId::new());
//!
//! inventory.seed(zone, 500, None).await?;
//! let outcome = inventory
//!     .reserve(zone, BookingId::new(), 2, Duration::from_secs(600))
//!     .await?;
//! # let _ = outcome;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod engine;
mod ledger;

pub use engine::InventoryEngine;
