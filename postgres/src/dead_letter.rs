//! The dead-letter table: failed messages preserved for operators.

use crate::store_err;
use async_trait::async_trait;
use booking_rush_core::{
    DeadLetter, DeadLetterStatus, DeadLetterStore, NewDeadLetter, StoreError,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

/// `PostgreSQL` dead-letter store.
pub struct PostgresDeadLetterStore {
    pool: PgPool,
}

impl PostgresDeadLetterStore {
    /// Creates a store over the given pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_entry(row: &PgRow) -> Result<DeadLetter, StoreError> {
        let status: String = row.try_get("status").map_err(store_err)?;
        Ok(DeadLetter {
            id: row.try_get("id").map_err(store_err)?,
            original_topic: row.try_get("original_topic").map_err(store_err)?,
            partition_key: row.try_get("partition_key").map_err(store_err)?,
            event_type: row.try_get("event_type").map_err(store_err)?,
            payload: row.try_get("payload").map_err(store_err)?,
            error: row.try_get("error").map_err(store_err)?,
            retry_count: row.try_get("retry_count").map_err(store_err)?,
            first_failed_at: row.try_get("first_failed_at").map_err(store_err)?,
            last_failed_at: row.try_get("last_failed_at").map_err(store_err)?,
            status: DeadLetterStatus::parse(&status)?,
        })
    }
}

#[async_trait]
impl DeadLetterStore for PostgresDeadLetterStore {
    async fn add(&self, entry: NewDeadLetter) -> Result<i64, StoreError> {
        let id: i64 = sqlx::query_scalar(
            r"
            INSERT INTO dead_letter_messages (
                original_topic, partition_key, event_type, payload,
                error, retry_count, first_failed_at, last_failed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            ",
        )
        .bind(&entry.original_topic)
        .bind(&entry.partition_key)
        .bind(&entry.event_type)
        .bind(&entry.payload)
        .bind(&entry.error)
        .bind(entry.retry_count)
        .bind(entry.first_failed_at)
        .bind(entry.last_failed_at)
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;

        tracing::warn!(
            dead_letter_id = id,
            topic = %entry.original_topic,
            event_type = %entry.event_type,
            error = %entry.error,
            retry_count = entry.retry_count,
            "message moved to dead letter queue"
        );
        metrics::counter!("outbox.dead_lettered").increment(1);

        Ok(id)
    }

    async fn list_pending(&self, limit: u32) -> Result<Vec<DeadLetter>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT id, original_topic, partition_key, event_type, payload,
                   error, retry_count, first_failed_at, last_failed_at, status
            FROM dead_letter_messages
            WHERE status = 'pending'
            ORDER BY first_failed_at ASC
            LIMIT $1
            ",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        rows.iter().map(Self::row_to_entry).collect()
    }

    async fn mark_replayed(&self, id: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE dead_letter_messages SET status = 'replayed' WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        tracing::info!(dead_letter_id = id, "dead letter replayed");
        Ok(())
    }

    async fn mark_discarded(&self, id: i64, reason: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE dead_letter_messages SET status = 'discarded' WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        tracing::warn!(dead_letter_id = id, reason, "dead letter discarded");
        Ok(())
    }

    async fn count_pending(&self) -> Result<i64, StoreError> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM dead_letter_messages WHERE status = 'pending'",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)
    }
}
