//! Saga instances: the persisted state the machine ticks over.

use crate::command::StepName;
use booking_rush_core::{Booking, BookingId, Money, PaymentId, SagaId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle of a saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SagaStatus {
    /// Advancing through the forward sequence.
    Running,
    /// A step failed permanently; reverse commands are in flight.
    Compensating,
    /// All forward steps succeeded. Terminal.
    Completed,
    /// Failed, with compensations done (or exhausted). Terminal.
    Failed,
}

impl SagaStatus {
    /// Database/wire string for this status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Compensating => "compensating",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether the saga accepts further events.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Where one step stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Not dispatched yet.
    Pending,
    /// Command published; awaiting the step's event.
    Dispatched,
    /// The step's success event arrived.
    Succeeded,
    /// Failed permanently (retries exhausted or fatal).
    Failed,
}

/// One step's persisted state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    /// Which step.
    pub name: StepName,
    /// Where it stands.
    pub status: StepStatus,
    /// Dispatch attempts so far.
    pub attempts: u32,
    /// Deadline of the outstanding dispatch, if any.
    pub timeout_at: Option<DateTime<Utc>>,
}

impl StepState {
    fn pending(name: StepName) -> Self {
        Self {
            name,
            status: StepStatus::Pending,
            attempts: 0,
            timeout_at: None,
        }
    }

    fn succeeded(name: StepName) -> Self {
        Self {
            name,
            status: StepStatus::Succeeded,
            attempts: 1,
            timeout_at: None,
        }
    }
}

/// Per-step execution policy.
#[derive(Debug, Clone)]
pub struct StepPolicy {
    /// How long a dispatched step may stay silent before it times out.
    pub step_timeout: Duration,
    /// Attempts per step before the saga fails (forward) or moves on
    /// (compensation).
    pub max_retries: u32,
}

impl Default for StepPolicy {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

/// A saga instance. Spans exactly one reservation transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaInstance {
    /// Instance id; correlates commands and events.
    pub saga_id: SagaId,
    /// Saga kind; always `booking` here.
    pub name: String,
    /// The booking being driven.
    pub booking_id: BookingId,
    /// The paying user.
    pub user_id: UserId,
    /// Amount to charge (the booking's total price).
    pub amount: Money,
    /// ISO currency code.
    pub currency: String,
    /// Captured payment, once the payment step succeeds.
    pub payment_id: Option<PaymentId>,
    /// Lifecycle state.
    pub status: SagaStatus,
    /// Index into the active sequence (forward steps while `Running`,
    /// compensations while `Compensating`).
    pub current_step: usize,
    /// Forward steps in order.
    pub steps: Vec<StepState>,
    /// Compensation steps, built when compensation starts.
    pub compensations: Vec<StepState>,
    /// Correlation id stamped on every message; the booking id string.
    pub correlation_id: String,
    /// Saga-level deadline; past it the saga fails and compensates.
    pub deadline: DateTime<Utc>,
    /// Why the saga failed, if it did.
    pub failure_reason: Option<String>,
}

impl SagaInstance {
    /// Creates the instance for a booking whose seats are already held:
    /// `reserve-seats` starts succeeded, `process-payment` is next.
    #[must_use]
    pub fn for_reserved_booking(
        saga_id: SagaId,
        booking: &Booking,
        deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            saga_id,
            name: "booking".to_string(),
            booking_id: booking.booking_id,
            user_id: booking.user_id,
            amount: booking.total_price,
            currency: booking.currency.clone(),
            payment_id: None,
            status: SagaStatus::Running,
            current_step: 1,
            steps: vec![
                StepState::succeeded(StepName::ReserveSeats),
                StepState::pending(StepName::ProcessPayment),
                StepState::pending(StepName::ConfirmBooking),
                StepState::pending(StepName::Notify),
            ],
            compensations: Vec::new(),
            correlation_id: booking.booking_id.to_string(),
            deadline,
            failure_reason: None,
        }
    }

    /// The step sequence currently being driven.
    #[must_use]
    pub fn active_sequence(&self) -> &[StepState] {
        match self.status {
            SagaStatus::Compensating => &self.compensations,
            _ => &self.steps,
        }
    }

    /// The step awaiting an event, if the saga is live.
    #[must_use]
    pub fn active_step(&self) -> Option<&StepState> {
        self.active_sequence().get(self.current_step)
    }

    pub(crate) fn active_step_mut(&mut self) -> Option<&mut StepState> {
        let index = self.current_step;
        match self.status {
            SagaStatus::Compensating => self.compensations.get_mut(index),
            _ => self.steps.get_mut(index),
        }
    }

    /// Names of forward steps that succeeded, in order.
    #[must_use]
    pub fn succeeded_steps(&self) -> Vec<StepName> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Succeeded)
            .map(|s| s.name)
            .collect()
    }
}
