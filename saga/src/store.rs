//! Saga instance storage.
//!
//! Instances are durable state: the machine is a *persisted* state
//! machine, so a crashed orchestrator restarts with every live saga
//! intact. Production uses `PostgresSagaStore` from
//! `booking-rush-postgres` (a `saga_instances` table); tests use
//! [`InMemorySagaStore`].
//!
//! Durability is also what makes a lost step event recoverable: the bus
//! consumer commits offsets on handoff, so an event can be consumed and
//! then lost to a crash before the tick that would have applied it. The
//! saved instance still records the step as dispatched with its
//! `timeout_at`; the deadline scan re-drives it after restart, and the
//! worker's idempotency-key dedup makes the re-execution safe.

use crate::instance::SagaInstance;
use async_trait::async_trait;
use booking_rush_core::{SagaId, StoreError};
use std::collections::HashMap;
use std::sync::Mutex;

/// Store of saga instances.
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Inserts or replaces an instance.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] on infrastructure failure.
    async fn save(&self, instance: &SagaInstance) -> Result<(), StoreError>;

    /// Loads one instance.
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] on infrastructure failure.
    async fn load(&self, saga_id: SagaId) -> Result<Option<SagaInstance>, StoreError>;

    /// Every non-terminal instance; the deadline scanner's work list (and,
    /// after a restart, the recovery work list).
    ///
    /// # Errors
    ///
    /// [`StoreError::Database`] on infrastructure failure.
    async fn live(&self) -> Result<Vec<SagaInstance>, StoreError>;
}

/// In-memory store for tests.
#[derive(Default)]
pub struct InMemorySagaStore {
    instances: Mutex<HashMap<SagaId, SagaInstance>>,
}

impl InMemorySagaStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn save(&self, instance: &SagaInstance) -> Result<(), StoreError> {
        let mut instances = self
            .instances
            .lock()
            .map_err(|_| StoreError::Database("saga store mutex poisoned".to_string()))?;
        instances.insert(instance.saga_id, instance.clone());
        Ok(())
    }

    async fn load(&self, saga_id: SagaId) -> Result<Option<SagaInstance>, StoreError> {
        let instances = self
            .instances
            .lock()
            .map_err(|_| StoreError::Database("saga store mutex poisoned".to_string()))?;
        Ok(instances.get(&saga_id).cloned())
    }

    async fn live(&self) -> Result<Vec<SagaInstance>, StoreError> {
        let instances = self
            .instances
            .lock()
            .map_err(|_| StoreError::Database("saga store mutex poisoned".to_string()))?;
        Ok(instances
            .values()
            .filter(|i| !i.status.is_terminal())
            .cloned()
            .collect())
    }
}
