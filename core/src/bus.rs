//! Message-bus abstraction.
//!
//! The bus carries JSON payloads keyed by a partition key; per-key ordering
//! is preserved, cross-key ordering is not. Production implementation is
//! `RedpandaBus` in `booking-rush-redpanda`; tests use `InMemoryBus` from
//! `booking-rush-testing`.
//!
//! Delivery is at-least-once: consumers must be idempotent.

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use thiserror::Error;

/// A message as observed by a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct BusRecord {
    /// Topic the message arrived on.
    pub topic: String,
    /// Partition key it was published under.
    pub key: String,
    /// JSON payload.
    pub payload: serde_json::Value,
}

/// Stream of consumed records.
pub type RecordStream = Pin<Box<dyn Stream<Item = Result<BusRecord, BusError>> + Send>>;

/// Bus failures.
#[derive(Error, Debug)]
pub enum BusError {
    /// Could not reach the broker.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Publish was not acknowledged.
    #[error("publish to '{topic}' failed: {reason}")]
    PublishFailed {
        /// Target topic.
        topic: String,
        /// Broker-side reason.
        reason: String,
    },

    /// Could not establish a subscription.
    #[error("subscription failed: {0}")]
    SubscriptionFailed(String),

    /// A consumed message could not be decoded as JSON.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// Transport-level consumer failure.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Publish/subscribe over topic-addressed JSON messages.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publishes a payload to `topic` under `key` and waits for the broker
    /// acknowledgement.
    ///
    /// # Errors
    ///
    /// [`BusError::PublishFailed`] if the broker did not acknowledge.
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: &serde_json::Value,
    ) -> Result<(), BusError>;

    /// Subscribes to `topics`, returning a stream of records. At-least-once
    /// delivery; per-partition-key order within a topic.
    ///
    /// # Errors
    ///
    /// [`BusError::SubscriptionFailed`] if the consumer could not start.
    async fn subscribe(&self, topics: &[&str]) -> Result<RecordStream, BusError>;
}
