//! Saga step workers: the executors behind each command topic.
//!
//! One consumer loop serves all step commands with a dispatching table on
//! the command variant. Workers dedup by the command's idempotency key and
//! replay the recorded outcome for duplicates, which is what makes the
//! orchestrator's retries and the bus's at-least-once delivery safe.
//!
//! Forward steps always answer (success or failure event). Compensations
//! answer only on success: a failing compensation stays silent and the
//! orchestrator's step timeout drives the retry.

use crate::payment::PaymentGateway;
use crate::service::{ReservationError, ReservationService};
use booking_rush_core::{BusError, BusRecord, Clock, ErrorCode, MessageBus, topics};
use booking_rush_saga::{CommandEnvelope, EventEnvelope, SagaCommand, SagaEvent};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Executes saga step commands against the service and the gateway.
pub struct SagaWorkers {
    bus: Arc<dyn MessageBus>,
    service: Arc<ReservationService>,
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
    /// Outcomes by idempotency key; duplicates replay these.
    processed: Mutex<HashMap<String, SagaEvent>>,
}

impl SagaWorkers {
    /// Creates the worker set.
    #[must_use]
    pub fn new(
        bus: Arc<dyn MessageBus>,
        service: Arc<ReservationService>,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            bus,
            service,
            gateway,
            clock,
            processed: Mutex::new(HashMap::new()),
        }
    }

    /// Consumes command topics until the stream ends.
    ///
    /// # Errors
    ///
    /// [`BusError::SubscriptionFailed`] if the consumer cannot start.
    pub async fn run(self) -> Result<(), BusError> {
        let mut stream = self.bus.subscribe(topics::commands::ALL).await?;
        tracing::info!("saga workers started");

        while let Some(record) = stream.next().await {
            match record {
                Ok(record) => self.handle(record).await,
                Err(error) => tracing::warn!(error = %error, "command stream error"),
            }
        }
        tracing::info!("command stream closed, workers exiting");
        Ok(())
    }

    async fn handle(&self, record: BusRecord) {
        let envelope: CommandEnvelope = match serde_json::from_value(record.payload.clone()) {
            Ok(envelope) => envelope,
            Err(error) => {
                tracing::error!(
                    topic = %record.topic,
                    error = %error,
                    "malformed saga command payload"
                );
                return;
            }
        };

        let replay = self
            .processed
            .lock()
            .ok()
            .and_then(|processed| processed.get(&envelope.idempotency_key).cloned());
        let event = if let Some(event) = replay {
            tracing::debug!(
                key = %envelope.idempotency_key,
                "duplicate command, replaying recorded outcome"
            );
            Some(event)
        } else {
            let outcome = self.execute(&envelope).await;
            if let Some(event) = &outcome {
                if let Ok(mut processed) = self.processed.lock() {
                    processed.insert(envelope.idempotency_key.clone(), event.clone());
                }
            }
            outcome
        };

        // Silence (None) lets the orchestrator's step timeout retry.
        let Some(event) = event else { return };

        let reply = EventEnvelope {
            saga_id: envelope.saga_id,
            booking_id: envelope.booking_id,
            timestamp: self.clock.now(),
            event,
        };
        let topic = reply.event.topic();
        let payload = match serde_json::to_value(&reply) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::error!(error = %error, "failed to serialize step event");
                return;
            }
        };
        if let Err(error) = self
            .bus
            .publish(topic, &envelope.booking_id.to_string(), &payload)
            .await
        {
            // It was recorded as processed, so the retry that follows the
            // orchestrator's step timeout re-delivers the command and the
            // replay path republishes this event.
            tracing::warn!(topic, error = %error, "failed to publish step event");
        }
    }

    async fn execute(&self, envelope: &CommandEnvelope) -> Option<SagaEvent> {
        match &envelope.command {
            SagaCommand::ReserveSeats { .. } => {
                // The reservation service holds the seats inline before
                // the saga starts, so this step is never dispatched.
                // Acknowledge a stray envelope so it cannot wedge a saga.
                Some(SagaEvent::SeatsReserved {})
            }
            SagaCommand::ProcessPayment {
                user_id,
                amount,
                currency,
            } => {
                let result = self
                    .gateway
                    .charge(&envelope.idempotency_key, *user_id, *amount, currency)
                    .await;
                Some(match result {
                    Ok(payment_id) => SagaEvent::PaymentProcessed { payment_id },
                    Err(error) => SagaEvent::PaymentFailed {
                        reason: error.to_string(),
                        retryable: error.is_retryable(),
                    },
                })
            }
            SagaCommand::ConfirmBooking { payment_id } => {
                let result = self
                    .service
                    .confirm(envelope.booking_id, Some(payment_id.clone()))
                    .await;
                Some(match result {
                    Ok(_) => SagaEvent::BookingConfirmed {},
                    Err(error) => SagaEvent::BookingConfirmFailed {
                        retryable: confirm_retryable(&error),
                        reason: error.to_string(),
                    },
                })
            }
            SagaCommand::Notify { outcome } => {
                // Notification delivery is outside the core; the step is
                // acknowledged here.
                tracing::info!(
                    booking_id = %envelope.booking_id,
                    outcome,
                    "notification dispatched"
                );
                Some(SagaEvent::NotificationSent {})
            }
            SagaCommand::ReleaseSeats {} => {
                match self.service.release_for_saga(envelope.booking_id).await {
                    Ok(()) => Some(SagaEvent::SeatsReleased {}),
                    Err(error) => {
                        tracing::error!(
                            booking_id = %envelope.booking_id,
                            error = %error,
                            "release compensation failed"
                        );
                        None
                    }
                }
            }
            SagaCommand::RefundPayment { payment_id, amount } => {
                match self.gateway.refund(payment_id, *amount).await {
                    Ok(()) => Some(SagaEvent::PaymentRefunded {}),
                    Err(error) => {
                        tracing::error!(
                            payment_id = %payment_id,
                            error = %error,
                            "refund compensation failed"
                        );
                        None
                    }
                }
            }
            SagaCommand::CancelNotification {} => Some(SagaEvent::NotificationCancelled {}),
        }
    }
}

/// Only infrastructure failures of the confirm step are retryable; an
/// expired or conflicted booking will not improve with retries.
fn confirm_retryable(error: &ReservationError) -> bool {
    matches!(error.code(), ErrorCode::Internal)
}
