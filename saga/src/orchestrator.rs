//! The orchestrator loop: bus in, machine tick, bus out.
//!
//! All saga I/O lives here. The loop consumes `booking.reserved` events
//! (saga starts) and step events, ticks [`crate::machine::advance`],
//! persists the instance, and publishes the resulting commands. A periodic
//! tick flushes backoff-delayed re-dispatches and scans live sagas for
//! step timeouts and saga deadlines.
//!
//! # Crash recovery
//!
//! The store must be durable in production. Restart recovery is the
//! deadline scan: `live()` returns every interrupted saga, each with its
//! dispatched step's `timeout_at`, so the scan re-drives them without any
//! special-case code. The bus consumer commits offsets on handoff, which
//! means a step event can be consumed and then lost to a crash before its
//! tick; the re-driven command is safe because workers dedup on the
//! command's idempotency key and replay the recorded outcome (a re-driven
//! `process-payment` returns the original capture, never a second
//! charge). A `booking.reserved` event lost the same way never creates a
//! saga; the booking expires through the sweeper with no payment taken
//! and its seats released.

use crate::command::CommandEnvelope;
use crate::event::{EventEnvelope, SagaEvent};
use crate::instance::{SagaInstance, SagaStatus, StepPolicy};
use crate::machine;
use crate::store::SagaStore;
use booking_rush_core::{
    Booking, BusError, BusRecord, Clock, MessageBus, NewOutboxMessage, OutboxStore, SagaId,
    topics,
};
use booking_rush_runtime::BackoffPolicy;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Payload of a `booking.reserved` outbox event, as written by the
/// reservation service.
#[derive(Debug, Deserialize)]
struct ReservedPayload {
    saga_id: SagaId,
    booking: Booking,
    deadline: DateTime<Utc>,
}

/// Drives booking sagas from bus events.
pub struct SagaOrchestrator {
    bus: Arc<dyn MessageBus>,
    store: Arc<dyn SagaStore>,
    outbox: Arc<dyn OutboxStore>,
    clock: Arc<dyn Clock>,
    policy: StepPolicy,
    backoff: BackoffPolicy,
    tick_interval: Duration,
    delayed: Mutex<Vec<(DateTime<Utc>, CommandEnvelope)>>,
}

impl SagaOrchestrator {
    /// Creates an orchestrator. `tick_interval` bounds how late a step
    /// timeout or delayed re-dispatch can fire.
    #[must_use]
    pub fn new(
        bus: Arc<dyn MessageBus>,
        store: Arc<dyn SagaStore>,
        outbox: Arc<dyn OutboxStore>,
        clock: Arc<dyn Clock>,
        policy: StepPolicy,
        backoff: BackoffPolicy,
        tick_interval: Duration,
    ) -> Self {
        Self {
            bus,
            store,
            outbox,
            clock,
            policy,
            backoff,
            tick_interval,
            delayed: Mutex::new(Vec::new()),
        }
    }

    /// Runs until the event stream ends.
    ///
    /// # Errors
    ///
    /// [`BusError::SubscriptionFailed`] if the consumer cannot start.
    pub async fn run(self) -> Result<(), BusError> {
        let mut subscription: Vec<&str> = vec![topics::BOOKING_EVENTS];
        subscription.extend_from_slice(topics::events::ALL_STEP_EVENTS);
        let mut stream = self.bus.subscribe(&subscription).await?;

        let mut tick = tokio::time::interval(self.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(topics = subscription.len(), "saga orchestrator started");

        loop {
            tokio::select! {
                record = stream.next() => match record {
                    Some(Ok(record)) => self.handle_record(record).await,
                    Some(Err(error)) => {
                        tracing::warn!(error = %error, "saga event stream error");
                    }
                    None => {
                        tracing::info!("saga event stream closed, orchestrator exiting");
                        break;
                    }
                },
                _ = tick.tick() => self.on_tick().await,
            }
        }
        Ok(())
    }

    async fn handle_record(&self, record: BusRecord) {
        if record.topic == topics::BOOKING_EVENTS {
            self.handle_booking_event(record).await;
        } else {
            self.handle_step_event(record).await;
        }
    }

    /// `booking.reserved` starts a saga; other booking lifecycle events are
    /// not the orchestrator's business.
    async fn handle_booking_event(&self, record: BusRecord) {
        if record.payload.get("event").and_then(|v| v.as_str()) != Some("booking.reserved") {
            return;
        }
        let payload: ReservedPayload = match serde_json::from_value(record.payload.clone()) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::error!(error = %error, "malformed booking.reserved payload");
                return;
            }
        };

        match self.store.load(payload.saga_id).await {
            Ok(Some(_)) => return, // at-least-once redelivery
            Ok(None) => {}
            Err(error) => {
                tracing::error!(error = %error, "saga store unavailable");
                return;
            }
        }

        let now = self.clock.now();
        let mut instance =
            SagaInstance::for_reserved_booking(payload.saga_id, &payload.booking, payload.deadline);
        let commands = machine::start(&mut instance, now, &self.policy);

        if let Err(error) = self.store.save(&instance).await {
            tracing::error!(error = %error, "failed to save new saga");
            return;
        }
        metrics::counter!("saga.started").increment(1);
        self.publish_lifecycle(topics::events::SAGA_STARTED, &instance).await;
        tracing::info!(
            saga_id = %instance.saga_id,
            booking_id = %instance.booking_id,
            "saga started"
        );
        for envelope in commands {
            self.dispatch(envelope).await;
        }
    }

    async fn handle_step_event(&self, record: BusRecord) {
        let envelope: EventEnvelope = match serde_json::from_value(record.payload.clone()) {
            Ok(envelope) => envelope,
            Err(error) => {
                tracing::error!(
                    topic = %record.topic,
                    error = %error,
                    "malformed saga event payload"
                );
                return;
            }
        };

        let instance = match self.store.load(envelope.saga_id).await {
            Ok(Some(instance)) => instance,
            Ok(None) => {
                tracing::warn!(saga_id = %envelope.saga_id, "event for unknown saga");
                return;
            }
            Err(error) => {
                tracing::error!(error = %error, "saga store unavailable");
                return;
            }
        };

        self.apply(instance, &envelope.event).await;
    }

    /// Ticks the machine and handles everything that falls out of it.
    async fn apply(&self, mut instance: SagaInstance, event: &SagaEvent) {
        let now = self.clock.now();
        let before = instance.status;
        let commands = machine::advance(&mut instance, event, now, &self.policy);

        if let Err(error) = self.store.save(&instance).await {
            tracing::error!(error = %error, "failed to save saga after tick");
            return;
        }

        if before != instance.status {
            self.on_status_change(before, &instance).await;
        }
        for envelope in commands {
            self.dispatch(envelope).await;
        }
    }

    async fn on_status_change(&self, before: SagaStatus, instance: &SagaInstance) {
        match instance.status {
            SagaStatus::Completed => {
                metrics::counter!("saga.completed").increment(1);
                self.publish_lifecycle(topics::events::SAGA_COMPLETED, instance).await;
            }
            SagaStatus::Failed => {
                metrics::counter!("saga.failed").increment(1);
                self.publish_lifecycle(topics::events::SAGA_FAILED, instance).await;
                if !instance.compensations.is_empty() {
                    self.record_compensated(instance).await;
                }
            }
            SagaStatus::Compensating | SagaStatus::Running => {
                let _ = before;
            }
        }
    }

    /// Durably records that compensation ran, through the outbox so the
    /// record survives and is published in commit order with the booking's
    /// other events.
    async fn record_compensated(&self, instance: &SagaInstance) {
        let message = NewOutboxMessage {
            aggregate_type: "booking".to_string(),
            aggregate_id: instance.booking_id.to_string(),
            event_type: "booking.compensated".to_string(),
            payload: serde_json::json!({
                "event": "booking.compensated",
                "saga_id": instance.saga_id,
                "booking_id": instance.booking_id,
                "reason": instance.failure_reason,
                "timestamp": self.clock.now(),
            }),
            topic: topics::events::BOOKING_COMPENSATED.to_string(),
            partition_key: instance.booking_id.to_string(),
            max_retries: NewOutboxMessage::DEFAULT_MAX_RETRIES,
        };
        if let Err(error) = self.outbox.append(message).await {
            tracing::error!(
                saga_id = %instance.saga_id,
                error = %error,
                "failed to record booking.compensated"
            );
        }
    }

    async fn publish_lifecycle(&self, topic: &str, instance: &SagaInstance) {
        let payload = serde_json::json!({
            "saga_id": instance.saga_id,
            "booking_id": instance.booking_id,
            "status": instance.status,
            "reason": instance.failure_reason,
            "timestamp": self.clock.now(),
        });
        if let Err(error) = self
            .bus
            .publish(topic, &instance.booking_id.to_string(), &payload)
            .await
        {
            tracing::warn!(topic, error = %error, "failed to publish saga lifecycle event");
        }
    }

    /// Publishes a command now, or queues it behind its retry backoff.
    async fn dispatch(&self, envelope: CommandEnvelope) {
        if envelope.retry_count > 0 {
            let delay = self.backoff.jittered_delay_for(envelope.retry_count - 1);
            let due = self.clock.now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(1));
            tracing::debug!(
                saga_id = %envelope.saga_id,
                step = %envelope.step_name,
                delay_ms = delay.as_millis(),
                "delaying re-dispatch"
            );
            if let Ok(mut delayed) = self.delayed.lock() {
                delayed.push((due, envelope));
            }
            return;
        }
        self.publish_command(envelope).await;
    }

    async fn publish_command(&self, envelope: CommandEnvelope) {
        let topic = envelope.command.topic();
        let key = envelope.booking_id.to_string();
        let payload = match serde_json::to_value(&envelope) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::error!(error = %error, "failed to serialize saga command");
                return;
            }
        };
        if let Err(error) = self.bus.publish(topic, &key, &payload).await {
            // The broker will come back; park the command for the next
            // tick rather than losing the step.
            tracing::warn!(topic, error = %error, "command publish failed, requeueing");
            let due = self.clock.now() + chrono::Duration::seconds(1);
            if let Ok(mut delayed) = self.delayed.lock() {
                delayed.push((due, envelope));
            }
        }
    }

    async fn on_tick(&self) {
        self.flush_delayed().await;
        self.scan_deadlines().await;
    }

    async fn flush_delayed(&self) {
        let now = self.clock.now();
        let due: Vec<CommandEnvelope> = {
            let Ok(mut delayed) = self.delayed.lock() else {
                return;
            };
            let (ready, waiting): (Vec<_>, Vec<_>) =
                delayed.drain(..).partition(|(at, _)| *at <= now);
            *delayed = waiting;
            ready.into_iter().map(|(_, envelope)| envelope).collect()
        };
        for envelope in due {
            self.publish_command(envelope).await;
        }
    }

    /// Synthesizes timeout events for silent steps and overdue sagas.
    async fn scan_deadlines(&self) {
        let now = self.clock.now();
        let live = match self.store.live().await {
            Ok(live) => live,
            Err(error) => {
                tracing::error!(error = %error, "saga store unavailable for deadline scan");
                return;
            }
        };

        for instance in live {
            if instance.status == SagaStatus::Running && instance.deadline <= now {
                tracing::warn!(saga_id = %instance.saga_id, "saga deadline exceeded");
                self.apply(instance, &SagaEvent::DeadlineExceeded {}).await;
                continue;
            }
            let timed_out_step = instance
                .active_step()
                .filter(|step| step.timeout_at.is_some_and(|at| at <= now))
                .map(|step| step.name);
            if let Some(step) = timed_out_step {
                tracing::warn!(saga_id = %instance.saga_id, step = %step, "step timed out");
                self.apply(instance, &SagaEvent::StepTimedOut { step }).await;
            }
        }
    }
}
