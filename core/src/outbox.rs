//! Transactional outbox and dead-letter records.
//!
//! An outbox message is written in the same durable transaction as the
//! state change it describes; the dispatcher later publishes it to the bus
//! and marks it `published`. Messages that exhaust their retries move to
//! the dead-letter table with full context: a human touchpoint, not a
//! silent black hole.

use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Delivery state of an outbox message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    /// Committed but not yet acknowledged by the broker.
    Pending,
    /// Acknowledged by the broker at least once.
    Published,
    /// Retries exhausted; a dead-letter entry exists.
    Failed,
}

impl OutboxStatus {
    /// Database string for this status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Published => "published",
            Self::Failed => "failed",
        }
    }

    /// Parses a database string.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] for unknown strings.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "published" => Ok(Self::Published),
            "failed" => Ok(Self::Failed),
            _ => Err(StoreError::Serialization(format!(
                "invalid outbox status: {s}"
            ))),
        }
    }
}

/// A committed outbox row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    /// Monotonic row id; commit order within the table.
    pub id: i64,
    /// Aggregate kind, e.g. `booking`.
    pub aggregate_type: String,
    /// Aggregate id, e.g. the booking id.
    pub aggregate_id: String,
    /// Event name, e.g. `booking.reserved`.
    pub event_type: String,
    /// JSON event payload.
    pub payload: serde_json::Value,
    /// Bus topic to publish to.
    pub topic: String,
    /// Partition key; per-key publish order follows commit order.
    pub partition_key: String,
    /// Delivery state.
    pub status: OutboxStatus,
    /// Publish attempts so far.
    pub retry_count: i32,
    /// Attempts before dead-lettering.
    pub max_retries: i32,
    /// Most recent publish error, if any.
    pub last_error: Option<String>,
    /// When the row was committed.
    pub created_at: DateTime<Utc>,
    /// When the dispatcher last touched the row.
    pub processed_at: Option<DateTime<Utc>>,
    /// When the broker acknowledged the message.
    pub published_at: Option<DateTime<Utc>>,
}

/// An outbox message before it is committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOutboxMessage {
    /// Aggregate kind.
    pub aggregate_type: String,
    /// Aggregate id.
    pub aggregate_id: String,
    /// Event name.
    pub event_type: String,
    /// JSON event payload.
    pub payload: serde_json::Value,
    /// Bus topic.
    pub topic: String,
    /// Partition key.
    pub partition_key: String,
    /// Attempts before dead-lettering.
    pub max_retries: i32,
}

impl NewOutboxMessage {
    /// Default number of publish attempts before dead-lettering.
    pub const DEFAULT_MAX_RETRIES: i32 = 5;

    /// Builds a booking lifecycle event destined for the booking events
    /// topic, partitioned by booking id so per-booking order is preserved.
    #[must_use]
    pub fn booking_event(
        event_type: &str,
        booking_id: crate::types::BookingId,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            aggregate_type: "booking".to_string(),
            aggregate_id: booking_id.to_string(),
            event_type: event_type.to_string(),
            payload,
            topic: crate::topics::BOOKING_EVENTS.to_string(),
            partition_key: booking_id.to_string(),
            max_retries: Self::DEFAULT_MAX_RETRIES,
        }
    }
}

/// Store of pending outbox rows, operated by the dispatcher.
///
/// Events describing a booking-row mutation are appended through
/// [`crate::booking::BookingStore`] inside the mutating transaction.
/// [`OutboxStore::append`] exists for events with no co-written row: the
/// saga's `booking.compensated` record.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Appends a standalone message (no co-written state change).
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] on infrastructure failure.
    async fn append(&self, message: NewOutboxMessage) -> Result<(), StoreError>;

    /// Pending rows in commit order, up to `limit`.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] on infrastructure failure.
    async fn fetch_pending(&self, limit: u32) -> Result<Vec<OutboxMessage>, StoreError>;

    /// Marks a row acknowledged by the broker.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if the row vanished, [`StoreError::Database`]
    /// on infrastructure failure.
    async fn mark_published(&self, id: i64, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Records a failed publish attempt, incrementing `retry_count`.
    /// Returns the updated retry count.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`], [`StoreError::Database`].
    async fn mark_attempt_failed(
        &self,
        id: i64,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<i32, StoreError>;

    /// Marks a row permanently failed after its dead-letter entry exists.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`], [`StoreError::Database`].
    async fn mark_failed(&self, id: i64, error: &str, at: DateTime<Utc>)
        -> Result<(), StoreError>;
}

/// Disposition of a dead-letter entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterStatus {
    /// Awaiting operator action.
    Pending,
    /// Operator replayed the message to its original topic.
    Replayed,
    /// Operator discarded the message permanently.
    Discarded,
}

impl DeadLetterStatus {
    /// Database string for this status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Replayed => "replayed",
            Self::Discarded => "discarded",
        }
    }

    /// Parses a database string.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] for unknown strings.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "replayed" => Ok(Self::Replayed),
            "discarded" => Ok(Self::Discarded),
            _ => Err(StoreError::Serialization(format!(
                "invalid dead letter status: {s}"
            ))),
        }
    }
}

/// A message that exhausted its publish retries, preserved with context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Dead-letter row id.
    pub id: i64,
    /// Topic the message was bound for.
    pub original_topic: String,
    /// Partition key of the original message.
    pub partition_key: String,
    /// Event name.
    pub event_type: String,
    /// JSON event payload.
    pub payload: serde_json::Value,
    /// The final error.
    pub error: String,
    /// Attempts made before giving up.
    pub retry_count: i32,
    /// When the first attempt failed.
    pub first_failed_at: DateTime<Utc>,
    /// When the last attempt failed.
    pub last_failed_at: DateTime<Utc>,
    /// Operator disposition.
    pub status: DeadLetterStatus,
}

/// A dead-letter entry before insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDeadLetter {
    /// Topic the message was bound for.
    pub original_topic: String,
    /// Partition key of the original message.
    pub partition_key: String,
    /// Event name.
    pub event_type: String,
    /// JSON event payload.
    pub payload: serde_json::Value,
    /// The final error.
    pub error: String,
    /// Attempts made before giving up.
    pub retry_count: i32,
    /// When the first attempt failed.
    pub first_failed_at: DateTime<Utc>,
    /// When the last attempt failed.
    pub last_failed_at: DateTime<Utc>,
}

/// Store of dead-lettered messages for inspection and replay.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Inserts an entry, returning its id.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] on infrastructure failure.
    async fn add(&self, entry: NewDeadLetter) -> Result<i64, StoreError>;

    /// Pending entries, oldest failure first.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] on infrastructure failure.
    async fn list_pending(&self, limit: u32) -> Result<Vec<DeadLetter>, StoreError>;

    /// Marks an entry replayed.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`], [`StoreError::Database`].
    async fn mark_replayed(&self, id: i64) -> Result<(), StoreError>;

    /// Marks an entry permanently discarded.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`], [`StoreError::Database`].
    async fn mark_discarded(&self, id: i64, reason: &str) -> Result<(), StoreError>;

    /// Number of entries awaiting operator action. Health-check input.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] on infrastructure failure.
    async fn count_pending(&self) -> Result<i64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BookingId;

    #[test]
    fn outbox_status_roundtrip() {
        for status in [
            OutboxStatus::Pending,
            OutboxStatus::Published,
            OutboxStatus::Failed,
        ] {
            assert_eq!(OutboxStatus::parse(status.as_str()).ok(), Some(status));
        }
        assert!(OutboxStatus::parse("queued").is_err());
    }

    #[test]
    fn booking_event_partitions_by_booking_id() {
        let booking_id = BookingId::new();
        let msg = NewOutboxMessage::booking_event(
            "booking.reserved",
            booking_id,
            serde_json::json!({ "quantity": 2 }),
        );
        assert_eq!(msg.partition_key, booking_id.to_string());
        assert_eq!(msg.aggregate_type, "booking");
        assert_eq!(msg.topic, crate::topics::BOOKING_EVENTS);
    }
}
