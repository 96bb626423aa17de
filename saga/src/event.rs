//! Saga step events: what workers report back to the orchestrator.

use crate::command::StepName;
use booking_rush_core::{BookingId, PaymentId, SagaId, topics};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of a dispatched step, or an orchestrator-synthesized timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "kebab-case")]
pub enum SagaEvent {
    /// Seats are held for the booking.
    SeatsReserved {},
    /// Seat reservation failed.
    SeatsReservationFailed {
        /// What went wrong.
        reason: String,
        /// Whether retrying could help.
        retryable: bool,
    },
    /// Payment captured.
    PaymentProcessed {
        /// Gateway payment id.
        payment_id: PaymentId,
    },
    /// Payment declined or errored.
    PaymentFailed {
        /// What went wrong.
        reason: String,
        /// Whether retrying could help (network/5xx/timeout yes;
        /// declined/insufficient-funds no).
        retryable: bool,
    },
    /// Booking flipped to `confirmed`.
    BookingConfirmed {},
    /// Booking confirmation failed.
    BookingConfirmFailed {
        /// What went wrong.
        reason: String,
        /// Whether retrying could help.
        retryable: bool,
    },
    /// Notification delivered.
    NotificationSent {},
    /// Seats returned to the pool (or already were).
    SeatsReleased {},
    /// Payment refunded (or already was).
    PaymentRefunded {},
    /// Notification retracted (or never sent).
    NotificationCancelled {},
    /// Synthesized by the orchestrator when a dispatched step's
    /// `timeout_at` passes without an event. Never on the wire.
    StepTimedOut {
        /// The step that went silent.
        step: StepName,
    },
    /// Synthesized when the saga-level deadline passes.
    DeadlineExceeded {},
}

impl SagaEvent {
    /// The step this event reports on, if any.
    #[must_use]
    pub const fn step(&self) -> Option<StepName> {
        match self {
            Self::SeatsReserved {} | Self::SeatsReservationFailed { .. } => {
                Some(StepName::ReserveSeats)
            }
            Self::PaymentProcessed { .. } | Self::PaymentFailed { .. } => {
                Some(StepName::ProcessPayment)
            }
            Self::BookingConfirmed {} | Self::BookingConfirmFailed { .. } => {
                Some(StepName::ConfirmBooking)
            }
            Self::NotificationSent {} => Some(StepName::Notify),
            Self::SeatsReleased {} => Some(StepName::ReleaseSeats),
            Self::PaymentRefunded {} => Some(StepName::RefundPayment),
            Self::NotificationCancelled {} => Some(StepName::CancelNotification),
            Self::StepTimedOut { step } => Some(*step),
            Self::DeadlineExceeded {} => None,
        }
    }

    /// The topic a worker publishes this event on.
    #[must_use]
    pub const fn topic(&self) -> &'static str {
        match self {
            Self::SeatsReserved {} => topics::events::SEATS_RESERVED,
            Self::SeatsReservationFailed { .. } => topics::events::SEATS_RESERVATION_FAILED,
            Self::PaymentProcessed { .. } => topics::events::PAYMENT_PROCESSED,
            Self::PaymentFailed { .. } => topics::events::PAYMENT_FAILED,
            Self::BookingConfirmed {} => topics::events::BOOKING_CONFIRMED,
            Self::BookingConfirmFailed { .. } => topics::events::BOOKING_CONFIRM_FAILED,
            Self::NotificationSent {} => topics::events::NOTIFICATION_SENT,
            Self::SeatsReleased {} => topics::events::SEATS_RELEASED,
            Self::PaymentRefunded {} => topics::events::PAYMENT_REFUNDED,
            Self::NotificationCancelled {} => topics::events::NOTIFICATION_CANCELLED,
            // Internal events never hit the wire; route them to the DLQ
            // topic if something tries.
            Self::StepTimedOut { .. } | Self::DeadlineExceeded {} => topics::DLQ,
        }
    }

    /// Whether this event reports a failure.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::SeatsReservationFailed { .. }
                | Self::PaymentFailed { .. }
                | Self::BookingConfirmFailed { .. }
                | Self::StepTimedOut { .. }
                | Self::DeadlineExceeded {}
        )
    }

    /// Whether a failure event is worth retrying. Timeouts are retryable;
    /// explicit failures carry their own classification.
    #[must_use]
    pub const fn is_retryable_failure(&self) -> bool {
        match self {
            Self::SeatsReservationFailed { retryable, .. }
            | Self::PaymentFailed { retryable, .. }
            | Self::BookingConfirmFailed { retryable, .. } => *retryable,
            Self::StepTimedOut { .. } => true,
            _ => false,
        }
    }
}

/// Wire envelope for step events: `{saga_id, booking_id, timestamp, ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Saga the event belongs to.
    pub saga_id: SagaId,
    /// Booking the saga is driving.
    pub booking_id: BookingId,
    /// When the worker produced the event.
    pub timestamp: DateTime<Utc>,
    /// The event itself, flattened into the payload.
    #[serde(flatten)]
    pub event: SagaEvent,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn envelope_payload_shape_matches_contract() {
        let envelope = EventEnvelope {
            saga_id: SagaId::new(),
            booking_id: BookingId::new(),
            timestamp: Utc::now(),
            event: SagaEvent::PaymentProcessed {
                payment_id: "pay_1".into(),
            },
        };

        let json = serde_json::to_value(&envelope).unwrap();
        assert!(json.get("saga_id").is_some());
        assert!(json.get("booking_id").is_some());
        assert!(json.get("timestamp").is_some());
        assert_eq!(json["event_type"], "payment-processed");
        assert_eq!(json["payment_id"], "pay_1");

        let back: EventEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn events_map_to_their_steps() {
        assert_eq!(
            SagaEvent::PaymentFailed {
                reason: "declined".to_string(),
                retryable: false,
            }
            .step(),
            Some(StepName::ProcessPayment)
        );
        assert_eq!(SagaEvent::SeatsReleased {}.step(), Some(StepName::ReleaseSeats));
    }

    #[test]
    fn timeout_is_retryable_decline_is_not() {
        assert!(SagaEvent::StepTimedOut {
            step: StepName::ProcessPayment
        }
        .is_retryable_failure());
        assert!(!SagaEvent::PaymentFailed {
            reason: "card declined".to_string(),
            retryable: false,
        }
        .is_retryable_failure());
    }
}
