//! In-memory doubles for the core store and bus traits.

use async_trait::async_trait;
use booking_rush_core::{
    Booking, BookingId, BookingStatus, BookingStore, BookingUpdate, BusError, BusRecord, Clock,
    DeadLetter, DeadLetterStatus, DeadLetterStore, EventId, IdempotencyBegin, IdempotencyRecord,
    IdempotencyStore, MessageBus, NewDeadLetter, NewOutboxMessage, OutboxMessage, OutboxStatus,
    OutboxStore, Page, RecordStream, StoreError, StoredResponse, UserId, ZoneUsage,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Controllable clock for deterministic TTL and sweep tests.
///
/// All clones share the same instant; `advance` moves every observer.
#[derive(Debug, Clone)]
pub struct MockClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    /// Creates a clock frozen at `start`.
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, delta: chrono::Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += delta;
        }
    }

    /// Jumps the clock to an absolute instant.
    pub fn set(&self, instant: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = instant;
        }
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|now| *now).unwrap_or_else(|_| Utc::now())
    }
}

/// A mock clock frozen at 2025-01-01T00:00:00Z.
#[must_use]
pub fn test_clock() -> MockClock {
    MockClock::new(
        DateTime::from_timestamp(1_735_689_600, 0).unwrap_or_else(Utc::now),
    )
}

#[derive(Default)]
struct StoreInner {
    bookings: HashMap<BookingId, Booking>,
    outbox: Vec<OutboxMessage>,
    next_outbox_id: i64,
}

/// In-memory booking + outbox store.
///
/// Implements [`BookingStore`] and [`OutboxStore`] over one mutex, which
/// gives the same co-write atomicity the Postgres transaction does: a
/// booking mutation and its outbox row land together or not at all.
pub struct InMemoryStore {
    clock: Arc<dyn Clock>,
    inner: Mutex<StoreInner>,
}

impl InMemoryStore {
    /// Creates an empty store stamping rows with `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(StoreInner::default()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, StoreInner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Database("store mutex poisoned".to_string()))
    }

    fn push_outbox(inner: &mut StoreInner, msg: NewOutboxMessage, now: DateTime<Utc>) {
        inner.next_outbox_id += 1;
        inner.outbox.push(OutboxMessage {
            id: inner.next_outbox_id,
            aggregate_type: msg.aggregate_type,
            aggregate_id: msg.aggregate_id,
            event_type: msg.event_type,
            payload: msg.payload,
            topic: msg.topic,
            partition_key: msg.partition_key,
            status: OutboxStatus::Pending,
            retry_count: 0,
            max_retries: msg.max_retries,
            last_error: None,
            created_at: now,
            processed_at: None,
            published_at: None,
        });
    }

    /// Every outbox row ever written, for assertions.
    #[must_use]
    pub fn outbox_rows(&self) -> Vec<OutboxMessage> {
        self.lock().map(|inner| inner.outbox.clone()).unwrap_or_default()
    }

    /// Event types written for one booking, in commit order.
    #[must_use]
    pub fn event_types_for(&self, booking_id: BookingId) -> Vec<String> {
        let key = booking_id.to_string();
        self.outbox_rows()
            .into_iter()
            .filter(|row| row.aggregate_id == key)
            .map(|row| row.event_type)
            .collect()
    }
}

#[async_trait]
impl BookingStore for InMemoryStore {
    async fn insert_reserved(
        &self,
        booking: &Booking,
        outbox: NewOutboxMessage,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        if inner.bookings.contains_key(&booking.booking_id) {
            return Err(StoreError::Conflict("booking id exists".to_string()));
        }
        if let Some(key) = &booking.idempotency_key {
            if inner
                .bookings
                .values()
                .any(|b| b.idempotency_key.as_ref() == Some(key))
            {
                return Err(StoreError::Conflict("idempotency key exists".to_string()));
            }
        }
        inner.bookings.insert(booking.booking_id, booking.clone());
        let now = self.clock.now();
        Self::push_outbox(&mut inner, outbox, now);
        Ok(())
    }

    async fn transition(
        &self,
        booking_id: BookingId,
        expected: BookingStatus,
        update: BookingUpdate,
        outbox: NewOutboxMessage,
    ) -> Result<Booking, StoreError> {
        let mut inner = self.lock()?;
        let Some(booking) = inner.bookings.get_mut(&booking_id) else {
            return Err(StoreError::NotFound);
        };
        if booking.status != expected {
            return Err(StoreError::Conflict(booking.status.as_str().to_string()));
        }
        update.apply(booking);
        let after = booking.clone();
        let now = self.clock.now();
        Self::push_outbox(&mut inner, outbox, now);
        Ok(after)
    }

    async fn fetch(&self, booking_id: BookingId) -> Result<Option<Booking>, StoreError> {
        Ok(self.lock()?.bookings.get(&booking_id).cloned())
    }

    async fn list_for_user(
        &self,
        user_id: UserId,
        page: Page,
    ) -> Result<Vec<Booking>, StoreError> {
        let inner = self.lock()?;
        let mut rows: Vec<Booking> = inner
            .bookings
            .values()
            .filter(|b| b.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.reserved_at.cmp(&a.reserved_at));
        #[allow(clippy::cast_possible_truncation)]
        Ok(rows
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.per_page as usize)
            .collect())
    }

    async fn quota_used(&self, user_id: UserId, event_id: EventId) -> Result<u32, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .bookings
            .values()
            .filter(|b| {
                b.user_id == user_id
                    && b.event_id == event_id
                    && matches!(b.status, BookingStatus::Reserved | BookingStatus::Confirmed)
            })
            .map(|b| b.quantity)
            .sum())
    }

    async fn due_expirations(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Booking>, StoreError> {
        let inner = self.lock()?;
        let mut due: Vec<Booking> = inner
            .bookings
            .values()
            .filter(|b| b.status == BookingStatus::Reserved && b.expires_at <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn zone_usage(&self) -> Result<Vec<ZoneUsage>, StoreError> {
        let inner = self.lock()?;
        let now = self.clock.now();
        let mut usage: HashMap<booking_rush_core::ZoneKey, ZoneUsage> = HashMap::new();
        for booking in inner.bookings.values() {
            let entry = usage.entry(booking.zone_key()).or_insert(ZoneUsage {
                zone: booking.zone_key(),
                active_reserved: 0,
                sold: 0,
            });
            match booking.status {
                BookingStatus::Reserved if booking.expires_at > now => {
                    entry.active_reserved += booking.quantity;
                }
                BookingStatus::Confirmed => entry.sold += booking.quantity,
                _ => {}
            }
        }
        Ok(usage.into_values().collect())
    }
}

#[async_trait]
impl OutboxStore for InMemoryStore {
    async fn append(&self, message: NewOutboxMessage) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let now = self.clock.now();
        Self::push_outbox(&mut inner, message, now);
        Ok(())
    }

    async fn fetch_pending(&self, limit: u32) -> Result<Vec<OutboxMessage>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .outbox
            .iter()
            .filter(|row| row.status == OutboxStatus::Pending)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn mark_published(&self, id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let row = inner
            .outbox
            .iter_mut()
            .find(|row| row.id == id)
            .ok_or(StoreError::NotFound)?;
        row.status = OutboxStatus::Published;
        row.processed_at = Some(at);
        row.published_at = Some(at);
        Ok(())
    }

    async fn mark_attempt_failed(
        &self,
        id: i64,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<i32, StoreError> {
        let mut inner = self.lock()?;
        let row = inner
            .outbox
            .iter_mut()
            .find(|row| row.id == id)
            .ok_or(StoreError::NotFound)?;
        row.retry_count += 1;
        row.last_error = Some(error.to_string());
        row.processed_at = Some(at);
        Ok(row.retry_count)
    }

    async fn mark_failed(
        &self,
        id: i64,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let row = inner
            .outbox
            .iter_mut()
            .find(|row| row.id == id)
            .ok_or(StoreError::NotFound)?;
        row.status = OutboxStatus::Failed;
        row.last_error = Some(error.to_string());
        row.processed_at = Some(at);
        Ok(())
    }
}

/// In-memory dead-letter store.
#[derive(Default)]
pub struct InMemoryDeadLetterStore {
    entries: Mutex<Vec<DeadLetter>>,
    next_id: AtomicI64,
}

impl InMemoryDeadLetterStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every entry, for assertions.
    #[must_use]
    pub fn entries(&self) -> Vec<DeadLetter> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn add(&self, entry: NewDeadLetter) -> Result<i64, StoreError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::Database("dlq mutex poisoned".to_string()))?;
        entries.push(DeadLetter {
            id,
            original_topic: entry.original_topic,
            partition_key: entry.partition_key,
            event_type: entry.event_type,
            payload: entry.payload,
            error: entry.error,
            retry_count: entry.retry_count,
            first_failed_at: entry.first_failed_at,
            last_failed_at: entry.last_failed_at,
            status: DeadLetterStatus::Pending,
        });
        Ok(id)
    }

    async fn list_pending(&self, limit: u32) -> Result<Vec<DeadLetter>, StoreError> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::Database("dlq mutex poisoned".to_string()))?;
        Ok(entries
            .iter()
            .filter(|e| e.status == DeadLetterStatus::Pending)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn mark_replayed(&self, id: i64) -> Result<(), StoreError> {
        self.set_status(id, DeadLetterStatus::Replayed)
    }

    async fn mark_discarded(&self, id: i64, _reason: &str) -> Result<(), StoreError> {
        self.set_status(id, DeadLetterStatus::Discarded)
    }

    async fn count_pending(&self) -> Result<i64, StoreError> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::Database("dlq mutex poisoned".to_string()))?;
        #[allow(clippy::cast_possible_wrap)]
        Ok(entries
            .iter()
            .filter(|e| e.status == DeadLetterStatus::Pending)
            .count() as i64)
    }
}

impl InMemoryDeadLetterStore {
    fn set_status(&self, id: i64, status: DeadLetterStatus) -> Result<(), StoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::Database("dlq mutex poisoned".to_string()))?;
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(StoreError::NotFound)?;
        entry.status = status;
        Ok(())
    }
}

enum IdempotencyEntry {
    InFlight,
    Done(IdempotencyRecord),
}

/// In-memory idempotency store with per-key claims.
#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    entries: Mutex<HashMap<String, IdempotencyEntry>>,
}

impl InMemoryIdempotencyStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn begin(&self, key: &str, now: DateTime<Utc>) -> Result<IdempotencyBegin, StoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::Database("idempotency mutex poisoned".to_string()))?;
        match entries.get(key) {
            Some(IdempotencyEntry::InFlight) => Ok(IdempotencyBegin::InFlight),
            Some(IdempotencyEntry::Done(record)) if record.expires_at > now => {
                Ok(IdempotencyBegin::Completed(record.clone()))
            }
            _ => {
                entries.insert(key.to_string(), IdempotencyEntry::InFlight);
                Ok(IdempotencyBegin::Acquired)
            }
        }
    }

    async fn complete(
        &self,
        key: &str,
        fingerprint: &str,
        response: StoredResponse,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::Database("idempotency mutex poisoned".to_string()))?;
        let expires_at = now
            + chrono::Duration::from_std(ttl)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
        entries.insert(
            key.to_string(),
            IdempotencyEntry::Done(IdempotencyRecord {
                key: key.to_string(),
                fingerprint: fingerprint.to_string(),
                response,
                created_at: now,
                expires_at,
            }),
        );
        Ok(())
    }

    async fn abandon(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::Database("idempotency mutex poisoned".to_string()))?;
        if matches!(entries.get(key), Some(IdempotencyEntry::InFlight)) {
            entries.remove(key);
        }
        Ok(())
    }
}

struct Subscriber {
    topics: Vec<String>,
    tx: mpsc::UnboundedSender<BusRecord>,
}

#[derive(Default)]
struct BusInner {
    subscribers: Vec<Subscriber>,
    log: Vec<BusRecord>,
}

/// In-memory message bus: topic-routed fan-out with a full publish log.
///
/// Per-subscriber channels preserve publish order, mirroring the
/// per-partition ordering guarantee of the real bus. A new subscriber
/// first receives the backlog of matching records, the same semantics as
/// a fresh consumer group with `auto.offset.reset = earliest`, and what
/// makes subscribe-vs-publish startup races harmless in tests.
#[derive(Default)]
pub struct InMemoryBus {
    inner: Mutex<BusInner>,
}

impl InMemoryBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything ever published, in order.
    #[must_use]
    pub fn published(&self) -> Vec<BusRecord> {
        self.inner.lock().map(|i| i.log.clone()).unwrap_or_default()
    }

    /// Records published to one topic, in order.
    #[must_use]
    pub fn published_to(&self, topic: &str) -> Vec<BusRecord> {
        self.published()
            .into_iter()
            .filter(|r| r.topic == topic)
            .collect()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: &serde_json::Value,
    ) -> Result<(), BusError> {
        let record = BusRecord {
            topic: topic.to_string(),
            key: key.to_string(),
            payload: payload.clone(),
        };
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| BusError::Transport("bus mutex poisoned".to_string()))?;
        inner.log.push(record.clone());
        inner.subscribers.retain(|sub| {
            if sub.topics.iter().any(|t| t == topic) {
                sub.tx.send(record.clone()).is_ok()
            } else {
                !sub.tx.is_closed()
            }
        });
        Ok(())
    }

    async fn subscribe(&self, topics: &[&str]) -> Result<RecordStream, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut inner = self
                .inner
                .lock()
                .map_err(|_| BusError::Transport("bus mutex poisoned".to_string()))?;
            let topics: Vec<String> = topics.iter().map(|t| (*t).to_string()).collect();
            for record in inner
                .log
                .iter()
                .filter(|record| topics.iter().any(|t| *t == record.topic))
            {
                let _ = tx.send(record.clone());
            }
            inner.subscribers.push(Subscriber { topics, tx });
        }
        Ok(Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|record| (Ok(record), rx))
        })))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::fixtures;
    use futures::StreamExt;

    #[tokio::test]
    async fn booking_and_outbox_are_co_written() {
        let clock = Arc::new(test_clock());
        let store = InMemoryStore::new(clock.clone());
        let booking = fixtures::reserved_booking(clock.now());

        store
            .insert_reserved(
                &booking,
                NewOutboxMessage::booking_event(
                    "booking.reserved",
                    booking.booking_id,
                    serde_json::json!({}),
                ),
            )
            .await
            .unwrap();

        assert_eq!(
            store.event_types_for(booking.booking_id),
            vec!["booking.reserved"]
        );
        let pending = store.fetch_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].partition_key, booking.booking_id.to_string());
    }

    #[tokio::test]
    async fn transition_is_conditional_on_status() {
        let clock = Arc::new(test_clock());
        let store = InMemoryStore::new(clock.clone());
        let booking = fixtures::reserved_booking(clock.now());
        store
            .insert_reserved(
                &booking,
                NewOutboxMessage::booking_event(
                    "booking.reserved",
                    booking.booking_id,
                    serde_json::json!({}),
                ),
            )
            .await
            .unwrap();

        store
            .transition(
                booking.booking_id,
                BookingStatus::Reserved,
                BookingUpdate::Cancel { at: clock.now() },
                NewOutboxMessage::booking_event(
                    "booking.cancelled",
                    booking.booking_id,
                    serde_json::json!({}),
                ),
            )
            .await
            .unwrap();

        // Second cancel finds the booking already cancelled.
        let err = store
            .transition(
                booking.booking_id,
                BookingStatus::Reserved,
                BookingUpdate::Cancel { at: clock.now() },
                NewOutboxMessage::booking_event(
                    "booking.cancelled",
                    booking.booking_id,
                    serde_json::json!({}),
                ),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(actual) if actual == "cancelled"));
    }

    #[tokio::test]
    async fn idempotency_claim_lifecycle() {
        let clock = test_clock();
        let store = InMemoryIdempotencyStore::new();

        assert!(matches!(
            store.begin("k1", clock.now()).await.unwrap(),
            IdempotencyBegin::Acquired
        ));
        assert!(matches!(
            store.begin("k1", clock.now()).await.unwrap(),
            IdempotencyBegin::InFlight
        ));

        store
            .complete(
                "k1",
                "fp",
                StoredResponse {
                    status: 201,
                    body: serde_json::json!({"ok": true}),
                },
                clock.now(),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        assert!(matches!(
            store.begin("k1", clock.now()).await.unwrap(),
            IdempotencyBegin::Completed(_)
        ));

        // Past the TTL the key is claimable again.
        clock.advance(chrono::Duration::seconds(61));
        assert!(matches!(
            store.begin("k1", clock.now()).await.unwrap(),
            IdempotencyBegin::Acquired
        ));
    }

    #[tokio::test]
    async fn bus_routes_by_topic_in_order() {
        let bus = InMemoryBus::new();
        let mut stream = bus.subscribe(&["a"]).await.unwrap();

        bus.publish("a", "k1", &serde_json::json!({"n": 1})).await.unwrap();
        bus.publish("b", "k2", &serde_json::json!({"n": 2})).await.unwrap();
        bus.publish("a", "k3", &serde_json::json!({"n": 3})).await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(first.key, "k1");
        assert_eq!(second.key, "k3");
        assert_eq!(bus.published_to("b").len(), 1);
    }
}
