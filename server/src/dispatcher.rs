//! The outbox dispatcher: committed events out to the bus.
//!
//! Pending rows are published in commit order. A transient publish failure
//! stops the current batch (continuing would reorder events behind the
//! failed one) and backs off; a row that exhausts `max_retries` moves to
//! the dead-letter store with full context and a notice on the DLQ topic,
//! then the batch continues past it.

use crate::config::OutboxConfig;
use booking_rush_core::{
    Clock, DeadLetterStore, MessageBus, NewDeadLetter, OutboxMessage, OutboxStore, topics,
};
use booking_rush_runtime::{BackoffPolicy, HealthState};
use std::sync::Arc;

/// What one dispatch cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchReport {
    /// Rows acknowledged by the broker.
    pub published: usize,
    /// Rows moved to the dead-letter store.
    pub dead_lettered: usize,
    /// Whether a transient failure cut the batch short.
    pub stalled: bool,
}

/// Publishes committed outbox rows to the bus.
pub struct OutboxDispatcher {
    outbox: Arc<dyn OutboxStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    bus: Arc<dyn MessageBus>,
    clock: Arc<dyn Clock>,
    config: OutboxConfig,
    backoff: BackoffPolicy,
    health: HealthState,
}

impl OutboxDispatcher {
    /// Creates a dispatcher. An unreachable outbox store trips `health`
    /// (the durable store is gone, the instance must leave the pool); the
    /// next successful cycle restores it.
    #[must_use]
    pub fn new(
        outbox: Arc<dyn OutboxStore>,
        dead_letters: Arc<dyn DeadLetterStore>,
        bus: Arc<dyn MessageBus>,
        clock: Arc<dyn Clock>,
        config: OutboxConfig,
        health: HealthState,
    ) -> Self {
        let backoff = BackoffPolicy::default().with_base(config.backoff_base);
        Self {
            outbox,
            dead_letters,
            bus,
            clock,
            config,
            backoff,
            health,
        }
    }

    /// Runs dispatch cycles forever, backing off while the broker is
    /// unhappy.
    pub async fn run(self) {
        let mut consecutive_failures: u32 = 0;
        loop {
            let report = self.dispatch_batch().await;
            if report.stalled {
                consecutive_failures += 1;
                let delay = self.backoff.jittered_delay_for(consecutive_failures - 1);
                tracing::warn!(
                    consecutive_failures,
                    delay_ms = delay.as_millis(),
                    "dispatch stalled, backing off"
                );
                tokio::time::sleep(delay).await;
            } else {
                consecutive_failures = 0;
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }
    }

    /// One dispatch cycle. Public so tests can drive it deterministically.
    pub async fn dispatch_batch(&self) -> DispatchReport {
        let mut report = DispatchReport::default();

        let batch = match self.outbox.fetch_pending(self.config.batch_size).await {
            Ok(batch) => {
                self.health.restore();
                batch
            }
            Err(error) => {
                tracing::error!(error = %error, "failed to fetch pending outbox rows");
                self.health.trip("outbox store unreachable");
                report.stalled = true;
                return report;
            }
        };

        for message in batch {
            match self
                .bus
                .publish(&message.topic, &message.partition_key, &message.payload)
                .await
            {
                Ok(()) => {
                    if let Err(error) = self
                        .outbox
                        .mark_published(message.id, self.clock.now())
                        .await
                    {
                        // The broker has the message but the row still says
                        // pending: the next cycle republishes it. That is
                        // the at-least-once contract, not data loss.
                        tracing::warn!(
                            outbox_id = message.id,
                            error = %error,
                            "published but could not mark row"
                        );
                        report.stalled = true;
                        break;
                    }
                    metrics::counter!("outbox.published").increment(1);
                    report.published += 1;
                }
                Err(error) => {
                    let failed = self.record_failure(&message, &error.to_string()).await;
                    if failed {
                        report.dead_lettered += 1;
                        // The row is terminal; later rows may proceed.
                        continue;
                    }
                    // Transient: stop here so per-key order is preserved.
                    report.stalled = true;
                    break;
                }
            }
        }
        report
    }

    /// Records one failed attempt; returns whether the row dead-lettered.
    async fn record_failure(&self, message: &OutboxMessage, error: &str) -> bool {
        let now = self.clock.now();
        let retry_count = match self.outbox.mark_attempt_failed(message.id, error, now).await {
            Ok(count) => count,
            Err(store_error) => {
                tracing::error!(
                    outbox_id = message.id,
                    error = %store_error,
                    "failed to record publish failure"
                );
                return false;
            }
        };

        let retry_limit = message.max_retries.min(self.config.max_retries);
        if retry_count < retry_limit {
            tracing::warn!(
                outbox_id = message.id,
                topic = %message.topic,
                retry_count,
                error,
                "publish failed, will retry"
            );
            return false;
        }

        let entry = NewDeadLetter {
            original_topic: message.topic.clone(),
            partition_key: message.partition_key.clone(),
            event_type: message.event_type.clone(),
            payload: message.payload.clone(),
            error: error.to_string(),
            retry_count,
            first_failed_at: message.processed_at.unwrap_or(now),
            last_failed_at: now,
        };
        if let Err(dlq_error) = self.dead_letters.add(entry).await {
            tracing::error!(
                outbox_id = message.id,
                error = %dlq_error,
                "failed to dead-letter message"
            );
            return false;
        }
        if let Err(mark_error) = self.outbox.mark_failed(message.id, error, now).await {
            tracing::error!(outbox_id = message.id, error = %mark_error, "failed to mark row failed");
        }

        // Operators watch the DLQ topic; delivery is best effort, the
        // durable entry is the record.
        let notice = serde_json::json!({
            "original_topic": message.topic,
            "event_type": message.event_type,
            "partition_key": message.partition_key,
            "error": error,
            "retry_count": retry_count,
            "timestamp": now,
        });
        if let Err(bus_error) = self
            .bus
            .publish(topics::DLQ, &message.partition_key, &notice)
            .await
        {
            tracing::warn!(error = %bus_error, "failed to publish DLQ notice");
        }
        true
    }
}
