//! # Booking Rush Saga
//!
//! The distributed booking transaction:
//!
//! ```text
//! reserve-seats → process-payment → confirm-booking → notify
//! ```
//!
//! with compensations issued in the documented failure order:
//!
//! ```text
//! cancel-notification → release-seats (if still held) → refund-payment (if taken)
//! ```
//!
//! The saga is a **persisted state machine, not suspended code**: every
//! event tick is the pure function [`machine::advance`] of
//! `(instance, event) → (instance', outbound commands)`. The
//! [`SagaOrchestrator`] is the only place with I/O: it consumes step
//! events from the bus, ticks the machine, saves the instance, and
//! publishes the resulting commands. Restart after a crash is re-running
//! the loop.
//!
//! Every command carries a derived idempotency key
//! `"{saga_id}:{step_name}"`; workers dedup on it, which is what makes
//! compensation correct under at-least-once delivery. A compensation that
//! reports "already compensated" counts as success.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod command;
pub mod event;
pub mod instance;
pub mod machine;
pub mod orchestrator;
pub mod store;

pub use command::{CommandEnvelope, SagaCommand, StepName};
pub use event::{EventEnvelope, SagaEvent};
pub use instance::{SagaInstance, SagaStatus, StepPolicy, StepState, StepStatus};
pub use machine::advance;
pub use orchestrator::SagaOrchestrator;
pub use store::{InMemorySagaStore, SagaStore};
