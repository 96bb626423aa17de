//! The idempotency-keys table: durable request dedup.

use crate::store_err;
use async_trait::async_trait;
use booking_rush_core::{
    IdempotencyBegin, IdempotencyRecord, IdempotencyStore, StoreError, StoredResponse,
};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::time::Duration;

/// An in-flight claim older than this is treated as abandoned (its process
/// died mid-request) and may be taken over.
const STALE_CLAIM_MINUTES: i64 = 15;

/// `PostgreSQL` idempotency store.
///
/// The claim is an `INSERT ... ON CONFLICT DO NOTHING`: exactly one
/// concurrent caller wins the primary key, which is the per-key lock of
/// the dedup contract.
pub struct PostgresIdempotencyStore {
    pool: PgPool,
}

impl PostgresIdempotencyStore {
    /// Creates a store over the given pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn try_claim(&self, key: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"
            INSERT INTO idempotency_keys (key, in_flight, created_at)
            VALUES ($1, TRUE, $2)
            ON CONFLICT (key) DO NOTHING
            ",
        )
        .bind(key)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn evict(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM idempotency_keys WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}

#[async_trait]
impl IdempotencyStore for PostgresIdempotencyStore {
    async fn begin(&self, key: &str, now: DateTime<Utc>) -> Result<IdempotencyBegin, StoreError> {
        if self.try_claim(key, now).await? {
            return Ok(IdempotencyBegin::Acquired);
        }

        let Some(row) = sqlx::query(
            r"
            SELECT fingerprint, response_status, response_body,
                   in_flight, created_at, expires_at
            FROM idempotency_keys
            WHERE key = $1
            ",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?
        else {
            // The row vanished between the failed claim and the read
            // (TTL eviction); claim again.
            return if self.try_claim(key, now).await? {
                Ok(IdempotencyBegin::Acquired)
            } else {
                Ok(IdempotencyBegin::InFlight)
            };
        };

        let in_flight: bool = row.try_get("in_flight").map_err(store_err)?;
        let created_at: DateTime<Utc> = row.try_get("created_at").map_err(store_err)?;

        if in_flight {
            if now - created_at > chrono::Duration::minutes(STALE_CLAIM_MINUTES) {
                tracing::warn!(key, "taking over stale idempotency claim");
                self.evict(key).await?;
                if self.try_claim(key, now).await? {
                    return Ok(IdempotencyBegin::Acquired);
                }
            }
            return Ok(IdempotencyBegin::InFlight);
        }

        let expires_at: Option<DateTime<Utc>> = row.try_get("expires_at").map_err(store_err)?;
        if expires_at.is_none_or(|at| at <= now) {
            self.evict(key).await?;
            return if self.try_claim(key, now).await? {
                Ok(IdempotencyBegin::Acquired)
            } else {
                Ok(IdempotencyBegin::InFlight)
            };
        }

        let status: i32 = row
            .try_get::<Option<i32>, _>("response_status")
            .map_err(store_err)?
            .ok_or_else(|| StoreError::Serialization("completed key without status".to_string()))?;
        Ok(IdempotencyBegin::Completed(IdempotencyRecord {
            key: key.to_string(),
            fingerprint: row
                .try_get::<Option<String>, _>("fingerprint")
                .map_err(store_err)?
                .unwrap_or_default(),
            response: StoredResponse {
                status: u16::try_from(status).unwrap_or(500),
                body: row
                    .try_get::<Option<serde_json::Value>, _>("response_body")
                    .map_err(store_err)?
                    .unwrap_or(serde_json::Value::Null),
            },
            created_at,
            expires_at: expires_at.unwrap_or(now),
        }))
    }

    async fn complete(
        &self,
        key: &str,
        fingerprint: &str,
        response: StoredResponse,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let expires_at = now
            + chrono::Duration::from_std(ttl)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let result = sqlx::query(
            r"
            UPDATE idempotency_keys
            SET fingerprint = $2, response_status = $3, response_body = $4,
                in_flight = FALSE, expires_at = $5
            WHERE key = $1
            ",
        )
        .bind(key)
        .bind(fingerprint)
        .bind(i32::from(response.status))
        .bind(&response.body)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn abandon(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM idempotency_keys WHERE key = $1 AND in_flight")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}
