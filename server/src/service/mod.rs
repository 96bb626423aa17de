//! The reservation service and its supporting pieces.

pub mod catalog;
pub mod idempotency;
pub mod reservation;

pub use catalog::{PriceCatalog, StaticCatalog, ZoneDef};
pub use idempotency::IdempotencyPipeline;
pub use reservation::{ReservationError, ReservationService, ReserveRequest};
