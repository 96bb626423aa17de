//! The saga-instances table: the persisted state machine.
//!
//! The full instance is stored as JSONB alongside a status column for the
//! live-instance scan. This is what makes restarts trivial: the
//! orchestrator's deadline scan reads `live()` on its next tick and
//! re-drives every saga the crash interrupted, including ones whose step
//! event was consumed (offset committed) but never applied.

use crate::store_err;
use async_trait::async_trait;
use booking_rush_core::{SagaId, StoreError};
use booking_rush_saga::{SagaInstance, SagaStore};
use sqlx::PgPool;

/// `PostgreSQL` saga store.
pub struct PostgresSagaStore {
    pool: PgPool,
}

impl PostgresSagaStore {
    /// Creates a store over the given pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn decode(state: serde_json::Value) -> Result<SagaInstance, StoreError> {
        serde_json::from_value(state).map_err(|e| StoreError::Serialization(e.to_string()))
    }
}

#[async_trait]
impl SagaStore for PostgresSagaStore {
    async fn save(&self, instance: &SagaInstance) -> Result<(), StoreError> {
        let state = serde_json::to_value(instance)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query(
            r"
            INSERT INTO saga_instances (saga_id, booking_id, status, state, updated_at)
            VALUES ($1, $2, $3, $4, now())
            ON CONFLICT (saga_id)
            DO UPDATE SET status = $3, state = $4, updated_at = now()
            ",
        )
        .bind(instance.saga_id.as_uuid())
        .bind(instance.booking_id.as_uuid())
        .bind(instance.status.as_str())
        .bind(&state)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn load(&self, saga_id: SagaId) -> Result<Option<SagaInstance>, StoreError> {
        let state: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT state FROM saga_instances WHERE saga_id = $1")
                .bind(saga_id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(store_err)?;
        state.map(Self::decode).transpose()
    }

    async fn live(&self) -> Result<Vec<SagaInstance>, StoreError> {
        let states: Vec<serde_json::Value> = sqlx::query_scalar(
            r"
            SELECT state FROM saga_instances
            WHERE status IN ('running', 'compensating')
            ORDER BY updated_at ASC
            ",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        states.into_iter().map(Self::decode).collect()
    }
}
