//! The outbox table: the dispatcher's durable queue.

use crate::store_err;
use async_trait::async_trait;
use booking_rush_core::{NewOutboxMessage, OutboxMessage, OutboxStatus, OutboxStore, StoreError};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};

/// Inserts an outbox row inside an open transaction. Called by the booking
/// store so the event commits with the state change it describes.
pub(crate) async fn insert_outbox(
    tx: &mut Transaction<'_, Postgres>,
    message: &NewOutboxMessage,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        INSERT INTO outbox_messages (
            aggregate_type, aggregate_id, event_type, payload,
            topic, partition_key, max_retries
        ) VALUES ($1, $2, $3, $4, $5, $6, $7)
        ",
    )
    .bind(&message.aggregate_type)
    .bind(&message.aggregate_id)
    .bind(&message.event_type)
    .bind(&message.payload)
    .bind(&message.topic)
    .bind(&message.partition_key)
    .bind(message.max_retries)
    .execute(&mut **tx)
    .await
    .map(|_| ())
}

/// `PostgreSQL` outbox store.
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    /// Creates a store over the given pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_message(row: &PgRow) -> Result<OutboxMessage, StoreError> {
        let status: String = row.try_get("status").map_err(store_err)?;
        Ok(OutboxMessage {
            id: row.try_get("id").map_err(store_err)?,
            aggregate_type: row.try_get("aggregate_type").map_err(store_err)?,
            aggregate_id: row.try_get("aggregate_id").map_err(store_err)?,
            event_type: row.try_get("event_type").map_err(store_err)?,
            payload: row.try_get("payload").map_err(store_err)?,
            topic: row.try_get("topic").map_err(store_err)?,
            partition_key: row.try_get("partition_key").map_err(store_err)?,
            status: OutboxStatus::parse(&status)?,
            retry_count: row.try_get("retry_count").map_err(store_err)?,
            max_retries: row.try_get("max_retries").map_err(store_err)?,
            last_error: row.try_get("last_error").map_err(store_err)?,
            created_at: row.try_get("created_at").map_err(store_err)?,
            processed_at: row.try_get("processed_at").map_err(store_err)?,
            published_at: row.try_get("published_at").map_err(store_err)?,
        })
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn append(&self, message: NewOutboxMessage) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        insert_outbox(&mut tx, &message).await.map_err(store_err)?;
        tx.commit().await.map_err(store_err)
    }

    async fn fetch_pending(&self, limit: u32) -> Result<Vec<OutboxMessage>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT id, aggregate_type, aggregate_id, event_type, payload,
                   topic, partition_key, status, retry_count, max_retries,
                   last_error, created_at, processed_at, published_at
            FROM outbox_messages
            WHERE status = 'pending'
            ORDER BY created_at ASC, id ASC
            LIMIT $1
            ",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        rows.iter().map(Self::row_to_message).collect()
    }

    async fn mark_published(&self, id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query(
            r"
            UPDATE outbox_messages
            SET status = 'published', processed_at = $2, published_at = $2
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn mark_attempt_failed(
        &self,
        id: i64,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<i32, StoreError> {
        let retry_count: Option<i32> = sqlx::query_scalar(
            r"
            UPDATE outbox_messages
            SET retry_count = retry_count + 1, last_error = $2, processed_at = $3
            WHERE id = $1
            RETURNING retry_count
            ",
        )
        .bind(id)
        .bind(error)
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        retry_count.ok_or(StoreError::NotFound)
    }

    async fn mark_failed(
        &self,
        id: i64,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r"
            UPDATE outbox_messages
            SET status = 'failed', last_error = $2, processed_at = $3
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(error)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}
