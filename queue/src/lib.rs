//! # Booking Rush Queue
//!
//! Virtual waiting room for flash-sale admission control.
//!
//! Each event has a totally ordered admission set: FIFO by join time, ties
//! broken by user id. A release worker pops the head of the queue in
//! batches and hands each user a short-lived, MAC-signed **queue pass**;
//! the reservation endpoint validates the pass before touching inventory.
//!
//! Admission is activated when the arrival rate crosses `threshold_on` and
//! deactivated when it falls below `threshold_off` (hysteresis, so the
//! queue does not flap at the boundary).
//!
//! Passes are single-use: validation consumes them.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod pass;
mod queue;

pub use pass::{PassClaims, PassError, PassSigner, hmac_sha256};
pub use queue::{
    AdmissionState, IssuedPass, JoinError, PositionInfo, QueueConfig, QueueTicket, VirtualQueue,
};
