//! # Booking Rush Server
//!
//! The reservation service: the public HTTP API (reserve / confirm /
//! cancel / read, virtual-queue endpoints, health probes), the saga step
//! workers, and the background machinery that keeps inventory consistent:
//! the outbox dispatcher, the expiry sweeper and the reconciler.
//!
//! Everything composes through the traits in `booking-rush-core`, so the
//! whole pipeline runs identically against Postgres + Redpanda in
//! production and against the in-memory stores in tests.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod api;
pub mod auth;
pub mod bootstrap;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod payment;
pub mod reconciler;
pub mod service;
pub mod sweeper;
pub mod workers;

pub use bootstrap::App;
pub use config::Config;
