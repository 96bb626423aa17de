//! Saga commands: the tagged variant dispatched to step workers.

use booking_rush_core::{BookingId, Money, PaymentId, SagaId, UserId, topics};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Every step of the booking saga, forward and compensating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepName {
    /// Deduct seats from the zone (completed inline by the reservation).
    ReserveSeats,
    /// Charge the payment.
    ProcessPayment,
    /// Flip the booking to `confirmed`.
    ConfirmBooking,
    /// Tell the user the outcome.
    Notify,
    /// Compensation: return held seats.
    ReleaseSeats,
    /// Compensation: refund a captured payment.
    RefundPayment,
    /// Compensation: retract a sent notification.
    CancelNotification,
}

impl StepName {
    /// Wire name of this step (also the command-topic segment).
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ReserveSeats => "reserve-seats",
            Self::ProcessPayment => "process-payment",
            Self::ConfirmBooking => "confirm-booking",
            Self::Notify => "notify",
            Self::ReleaseSeats => "release-seats",
            Self::RefundPayment => "refund-payment",
            Self::CancelNotification => "cancel-notification",
        }
    }

    /// Whether this step undoes a forward step.
    #[must_use]
    pub const fn is_compensation(&self) -> bool {
        matches!(
            self,
            Self::ReleaseSeats | Self::RefundPayment | Self::CancelNotification
        )
    }
}

impl std::fmt::Display for StepName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The work a step worker must perform.
///
/// A tagged variant with a dispatching table on the step name, not
/// class hierarchies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SagaCommand {
    /// Hold seats for the booking. Part of the command vocabulary for
    /// completeness, but never dispatched: the reservation service takes
    /// the hold inline and the saga starts with this step succeeded.
    ReserveSeats {
        /// Seats to hold.
        quantity: u32,
    },
    /// Charge the user.
    ProcessPayment {
        /// Paying user.
        user_id: UserId,
        /// Amount in minor units.
        amount: Money,
        /// ISO currency code.
        currency: String,
    },
    /// Confirm the booking durably.
    ConfirmBooking {
        /// Payment captured by the previous step.
        payment_id: PaymentId,
    },
    /// Notify the user of the outcome.
    Notify {
        /// Outcome summary, e.g. `confirmed`.
        outcome: String,
    },
    /// Return the booking's held seats to the pool.
    ReleaseSeats {},
    /// Refund the captured payment.
    RefundPayment {
        /// Payment to refund.
        payment_id: PaymentId,
        /// Amount in minor units.
        amount: Money,
    },
    /// Retract the notification.
    CancelNotification {},
}

impl SagaCommand {
    /// The step this command belongs to.
    #[must_use]
    pub const fn step_name(&self) -> StepName {
        match self {
            Self::ReserveSeats { .. } => StepName::ReserveSeats,
            Self::ProcessPayment { .. } => StepName::ProcessPayment,
            Self::ConfirmBooking { .. } => StepName::ConfirmBooking,
            Self::Notify { .. } => StepName::Notify,
            Self::ReleaseSeats {} => StepName::ReleaseSeats,
            Self::RefundPayment { .. } => StepName::RefundPayment,
            Self::CancelNotification {} => StepName::CancelNotification,
        }
    }

    /// The topic this command is dispatched on.
    #[must_use]
    pub const fn topic(&self) -> &'static str {
        match self.step_name() {
            StepName::ReserveSeats => topics::commands::RESERVE_SEATS,
            StepName::ProcessPayment => topics::commands::PROCESS_PAYMENT,
            StepName::ConfirmBooking => topics::commands::CONFIRM_BOOKING,
            StepName::Notify => topics::commands::NOTIFY,
            StepName::ReleaseSeats => topics::commands::RELEASE_SEATS,
            StepName::RefundPayment => topics::commands::REFUND_PAYMENT,
            StepName::CancelNotification => topics::commands::CANCEL_NOTIFICATION,
        }
    }
}

/// A command plus the envelope metadata every step command carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Saga this command belongs to.
    pub saga_id: SagaId,
    /// Booking the saga is driving.
    pub booking_id: BookingId,
    /// Step name, redundant with the command for log greppability.
    pub step_name: StepName,
    /// Index of the step in its sequence.
    pub step_index: usize,
    /// `"{saga_id}:{step_name}"`; workers dedup on it.
    pub idempotency_key: String,
    /// When the orchestrator gives up waiting for the step's event.
    pub timeout_at: DateTime<Utc>,
    /// Prior attempts of this step.
    pub retry_count: u32,
    /// Attempts allowed before the saga fails (or moves on, for
    /// compensations).
    pub max_retries: u32,
    /// The work itself.
    pub command: SagaCommand,
}

impl CommandEnvelope {
    /// Derived idempotency key for a saga step.
    #[must_use]
    pub fn idempotency_key_for(saga_id: SagaId, step: StepName) -> String {
        format!("{saga_id}:{step}")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn commands_route_to_their_topics() {
        let cmd = SagaCommand::ProcessPayment {
            user_id: UserId::new(),
            amount: Money::from_cents(200),
            currency: "THB".to_string(),
        };
        assert_eq!(cmd.topic(), "saga.booking.process-payment.command");
        assert_eq!(cmd.step_name(), StepName::ProcessPayment);

        assert_eq!(
            SagaCommand::ReleaseSeats {}.topic(),
            "saga.booking.release-seats.command"
        );
    }

    #[test]
    fn envelope_roundtrips_through_json() {
        let saga_id = SagaId::new();
        let envelope = CommandEnvelope {
            saga_id,
            booking_id: BookingId::new(),
            step_name: StepName::RefundPayment,
            step_index: 2,
            idempotency_key: CommandEnvelope::idempotency_key_for(
                saga_id,
                StepName::RefundPayment,
            ),
            timeout_at: Utc::now(),
            retry_count: 1,
            max_retries: 3,
            command: SagaCommand::RefundPayment {
                payment_id: "pay_9".into(),
                amount: Money::from_cents(400),
            },
        };

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["command"]["type"], "refund-payment");
        let back: CommandEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn idempotency_key_is_saga_scoped() {
        let saga_id = SagaId::new();
        let key = CommandEnvelope::idempotency_key_for(saga_id, StepName::ProcessPayment);
        assert_eq!(key, format!("{saga_id}:process-payment"));
    }
}
