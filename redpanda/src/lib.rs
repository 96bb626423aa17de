//! # Booking Rush Redpanda
//!
//! Redpanda/Kafka implementation of the [`MessageBus`] trait using
//! `rdkafka`. Works against Redpanda, Apache Kafka, or any
//! Kafka-compatible broker.
//!
//! # Delivery semantics
//!
//! **At-least-once** with manual offset commits:
//!
//! - Publishes are keyed by the partition key, so per-key order follows
//!   publish order (which the outbox dispatcher drives in commit order).
//! - Consumed messages are committed only after they were handed to the
//!   subscriber's channel; a crash before the commit redelivers them.
//! - Consumers must therefore be idempotent; saga workers dedup on the
//!   command's idempotency key, and the orchestrator ignores duplicate
//!   step events.
//!
//! # Example
//!
//! ```no_run
//! use booking_rush_redpanda::RedpandaBus;
//! use booking_rush_core::MessageBus;
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = RedpandaBus::builder()
//!     .brokers("localhost:9092")
//!     .consumer_group("booking-saga-orchestrator")
//!     .build()?;
//!
//! bus.publish("booking.events", "booking-1", &serde_json::json!({"event": "booking.reserved"}))
//!     .await?;
//!
//! let mut stream = bus.subscribe(&["booking.events"]).await?;
//! while let Some(record) = stream.next().await {
//!     println!("{:?}", record?);
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use booking_rush_core::{BusError, BusRecord, MessageBus, RecordStream};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::time::Duration;

/// Kafka-backed message bus.
///
/// The producer is shared; each [`MessageBus::subscribe`] call creates its
/// own consumer in the configured consumer group.
pub struct RedpandaBus {
    producer: FutureProducer,
    brokers: String,
    timeout: Duration,
    consumer_group: Option<String>,
    buffer_size: usize,
    auto_offset_reset: String,
}

impl RedpandaBus {
    /// Creates a bus with default configuration.
    ///
    /// # Errors
    ///
    /// [`BusError::ConnectionFailed`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, BusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Creates a builder.
    #[must_use]
    pub fn builder() -> RedpandaBusBuilder {
        RedpandaBusBuilder::default()
    }

    /// The configured broker list.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }
}

/// Builder for [`RedpandaBus`].
#[derive(Default)]
pub struct RedpandaBusBuilder {
    brokers: Option<String>,
    acks: Option<String>,
    timeout: Option<Duration>,
    consumer_group: Option<String>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
}

impl RedpandaBusBuilder {
    /// Comma-separated broker addresses.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Producer acknowledgement mode: `"0"`, `"1"` or `"all"`.
    /// Default `"all"`: the outbox marks rows published on this ack, so it
    /// must mean the broker really has the message.
    #[must_use]
    pub fn acks(mut self, acks: impl Into<String>) -> Self {
        self.acks = Some(acks.into());
        self
    }

    /// Producer send timeout. Default 5 seconds.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Consumer group for subscriptions. Auto-derived from the topic list
    /// when unset.
    #[must_use]
    pub fn consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = Some(group.into());
        self
    }

    /// In-memory buffer between the Kafka consumer and the subscriber.
    /// Default 1000.
    #[must_use]
    pub const fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size);
        self
    }

    /// Where a new consumer group starts reading: `"earliest"` or
    /// `"latest"`. Default `"earliest"`: the orchestrator must not miss
    /// `booking.reserved` events published before it subscribed.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Builds the bus.
    ///
    /// # Errors
    ///
    /// [`BusError::ConnectionFailed`] if brokers are unset or the producer
    /// cannot be created.
    pub fn build(self) -> Result<RedpandaBus, BusError> {
        let brokers = self
            .brokers
            .ok_or_else(|| BusError::ConnectionFailed("brokers not configured".to_string()))?;

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", self.acks.as_deref().unwrap_or("all"))
            .create()
            .map_err(|e| BusError::ConnectionFailed(format!("failed to create producer: {e}")))?;

        tracing::info!(brokers = %brokers, "kafka producer created");

        Ok(RedpandaBus {
            producer,
            brokers,
            timeout: self.timeout.unwrap_or(Duration::from_secs(5)),
            consumer_group: self.consumer_group,
            buffer_size: self.buffer_size.unwrap_or(1000),
            auto_offset_reset: self
                .auto_offset_reset
                .unwrap_or_else(|| "earliest".to_string()),
        })
    }
}

#[async_trait]
impl MessageBus for RedpandaBus {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: &serde_json::Value,
    ) -> Result<(), BusError> {
        let bytes = serde_json::to_vec(payload)
            .map_err(|e| BusError::Deserialization(e.to_string()))?;
        let record = FutureRecord::to(topic).payload(&bytes).key(key);

        match self
            .producer
            .send(record, Timeout::After(self.timeout))
            .await
        {
            Ok((partition, offset)) => {
                tracing::trace!(topic, key, partition, offset, "message published");
                Ok(())
            }
            Err((error, _)) => {
                tracing::error!(topic, key, error = %error, "publish failed");
                Err(BusError::PublishFailed {
                    topic: topic.to_string(),
                    reason: error.to_string(),
                })
            }
        }
    }

    async fn subscribe(&self, topics: &[&str]) -> Result<RecordStream, BusError> {
        let topics: Vec<String> = topics.iter().map(|t| (*t).to_string()).collect();
        let group = self.consumer_group.clone().unwrap_or_else(|| {
            let mut sorted = topics.clone();
            sorted.sort();
            format!("booking-rush-{}", sorted.join("-"))
        });

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("session.timeout.ms", "6000")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| BusError::SubscriptionFailed(format!("failed to create consumer: {e}")))?;

        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topic_refs)
            .map_err(|e| BusError::SubscriptionFailed(format!("failed to subscribe: {e}")))?;

        tracing::info!(?topics, consumer_group = %group, "subscribed");

        let (tx, rx) = tokio::sync::mpsc::channel(self.buffer_size);

        tokio::spawn(async move {
            use futures::StreamExt;

            let mut stream = consumer.stream();
            while let Some(message) = stream.next().await {
                match message {
                    Ok(message) => {
                        let result = match message.payload() {
                            Some(payload) => serde_json::from_slice(payload)
                                .map(|payload| BusRecord {
                                    topic: message.topic().to_string(),
                                    key: message
                                        .key()
                                        .map(|k| String::from_utf8_lossy(k).into_owned())
                                        .unwrap_or_default(),
                                    payload,
                                })
                                .map_err(|e| BusError::Deserialization(e.to_string())),
                            None => Err(BusError::Deserialization(
                                "message has no payload".to_string(),
                            )),
                        };

                        // Commit only after the record reached the channel;
                        // a crash before this point redelivers the message.
                        if tx.send(result).await.is_err() {
                            tracing::debug!("subscriber dropped, consumer task exiting");
                            break;
                        }
                        if let Err(error) = consumer.commit_message(&message, CommitMode::Async) {
                            tracing::warn!(
                                topic = message.topic(),
                                offset = message.offset(),
                                error = %error,
                                "offset commit failed, message may be redelivered"
                            );
                        }
                    }
                    Err(error) => {
                        let transport = BusError::Transport(error.to_string());
                        if tx.send(Err(transport)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let stream = async_stream::stream! {
            let mut rx = rx;
            while let Some(result) = rx.recv().await {
                yield result;
            }
        };
        Ok(Box::pin(stream) as RecordStream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RedpandaBus>();
        assert_sync::<RedpandaBus>();
    }

    #[test]
    fn builder_requires_brokers() {
        assert!(RedpandaBus::builder().build().is_err());
    }
}
