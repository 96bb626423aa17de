//! End-to-end tests of the reservation pipeline over the in-memory stores.
//!
//! Two harness flavors:
//!
//! - [`service_harness`]: the reservation service, inventory engine and
//!   background components wired by hand, driven deterministically (no
//!   spawned loops). Covers the service-level scenarios.
//! - [`full_harness`]: the complete app via `App::assemble` (dispatcher,
//!   orchestrator and workers running) for the saga round trips.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use booking_rush_core::{
    BookingId, BookingStatus, BookingStore, BusError, EventId, InventoryStore, MessageBus, Money,
    OutboxStatus, Page, RecordStream, ShowId, UserId, ZoneId, ZoneKey,
};
use booking_rush_inventory::InventoryEngine;
use booking_rush_server::bootstrap::{App, Components};
use booking_rush_server::config::Config;
use booking_rush_server::dispatcher::OutboxDispatcher;
use booking_rush_server::payment::{MockPaymentGateway, PaymentError};
use booking_rush_saga::InMemorySagaStore;
use booking_rush_server::reconciler::Reconciler;
use booking_rush_server::service::{
    IdempotencyPipeline, ReservationError, ReservationService, ReserveRequest, StaticCatalog,
    ZoneDef,
};
use booking_rush_server::sweeper::ExpirySweeper;
use booking_rush_testing::{
    InMemoryBus, InMemoryDeadLetterStore, InMemoryIdempotencyStore, InMemoryStore, MockClock,
    test_clock,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

struct ServiceHarness {
    clock: Arc<MockClock>,
    store: Arc<InMemoryStore>,
    service: Arc<ReservationService>,
    inventory: Arc<dyn InventoryStore>,
    config: Arc<Config>,
    event_id: EventId,
    zone: ZoneKey,
}

fn tuned_config() -> Config {
    let mut config = Config::from_env();
    config.reservation.reservation_ttl = Duration::from_secs(600);
    config.reservation.max_tickets_per_user_per_event = 4;
    config.outbox.poll_interval = Duration::from_millis(20);
    config.background.sweeper_interval = Duration::from_millis(50);
    config.background.sweeper_batch = 100;
    config.background.reconciler_interval = Duration::from_millis(100);
    // Tolerate the transient drift of in-flight requests; the dedicated
    // reconciler test pins tolerance to zero itself.
    config.background.reconciler_tolerance = 5;
    config.saga.tick_interval = Duration::from_millis(30);
    config.saga.step_timeout = Duration::from_secs(30);
    config.idempotency.wait = Duration::from_millis(500);
    config.validated()
}

async fn service_harness(total_seats: u32, unit_cents: i64) -> ServiceHarness {
    let clock = Arc::new(test_clock());
    let store = Arc::new(InMemoryStore::new(clock.clone()));
    let zone = ZoneKey::new(ShowId::new(), ZoneId::new());
    let event_id = EventId::new();

    let catalog = Arc::new(StaticCatalog::new(vec![ZoneDef {
        zone,
        total_seats,
        unit_price: Money::from_cents(unit_cents),
        currency: "THB".to_string(),
        sale_window: None,
    }]));

    let engine = InventoryEngine::spawn(clock.clone(), Duration::from_secs(3600));
    let inventory: Arc<dyn InventoryStore> = Arc::new(engine);
    inventory.seed(zone, total_seats, None).await.unwrap();

    let config = Arc::new(tuned_config());
    let service = Arc::new(ReservationService::new(
        store.clone(),
        inventory.clone(),
        catalog,
        clock.clone(),
        config.clone(),
    ));

    ServiceHarness {
        clock,
        store,
        service,
        inventory,
        config,
        event_id,
        zone,
    }
}

impl ServiceHarness {
    fn reserve_request(&self, user_id: UserId, quantity: u32) -> ReserveRequest {
        ReserveRequest {
            user_id,
            event_id: self.event_id,
            show_id: self.zone.show_id,
            zone_id: self.zone.zone_id,
            quantity,
            unit_price: None,
            idempotency_key: None,
        }
    }

    async fn snapshot(&self) -> (u32, u32, u32) {
        let counters = self.inventory.snapshot(self.zone).await.unwrap().unwrap();
        (counters.available, counters.reserved, counters.sold)
    }
}

async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// Scenario: zone with total=2; reserve(qty=2) holds both seats, a
// concurrent reserve fails without changing the snapshot, confirm sells
// them.
#[tokio::test]
async fn reserve_confirm_lifecycle_keeps_counters_conserved() {
    let harness = service_harness(2, 100).await;
    let user = UserId::new();

    let booking = harness
        .service
        .reserve(harness.reserve_request(user, 2))
        .await
        .unwrap();
    assert_eq!(booking.status, BookingStatus::Reserved);
    assert_eq!(booking.total_price, Money::from_cents(200));
    assert_eq!(harness.snapshot().await, (0, 2, 0));

    // Someone else wants one more seat: refused, snapshot untouched.
    let err = harness
        .service
        .reserve(harness.reserve_request(UserId::new(), 1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ReservationError::InsufficientSeats {
            requested: 1,
            available: 0
        }
    ));
    assert_eq!(harness.snapshot().await, (0, 2, 0));

    let confirmed = harness
        .service
        .confirm(booking.booking_id, Some("pay_1".into()))
        .await
        .unwrap();
    assert_eq!(confirmed.status, BookingStatus::Confirmed);
    assert!(confirmed.confirmation_code.is_some());
    assert_eq!(harness.snapshot().await, (0, 0, 2));

    // Outbox carries the full lifecycle in commit order.
    assert_eq!(
        harness.store.event_types_for(booking.booking_id),
        vec!["booking.reserved", "booking.confirmed"]
    );
}

// Scenario: 100 parallel reserves for the last seat; exactly one wins.
#[tokio::test]
async fn hundred_parallel_reserves_one_winner() {
    let harness = service_harness(1, 100).await;

    let mut tasks = Vec::new();
    for _ in 0..100 {
        let service = harness.service.clone();
        let request = harness.reserve_request(UserId::new(), 1);
        tasks.push(tokio::spawn(async move { service.reserve(request).await }));
    }

    let mut won = 0;
    let mut insufficient = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => won += 1,
            Err(ReservationError::InsufficientSeats { .. }) => insufficient += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(won, 1);
    assert_eq!(insufficient, 99);
    assert_eq!(harness.snapshot().await, (0, 1, 0));
}

// Scenario: the same idempotency key replayed returns the same booking and
// deducts once.
#[tokio::test]
async fn idempotent_reserve_deducts_once() {
    let harness = service_harness(5, 100).await;
    let user = UserId::new();
    let pipeline = IdempotencyPipeline::new(
        Arc::new(InMemoryIdempotencyStore::new()),
        harness.clock.clone(),
        Duration::from_secs(600),
        Duration::from_millis(500),
    );

    let mut outcomes = Vec::new();
    for _ in 0..2 {
        let service = harness.service.clone();
        let request = ReserveRequest {
            idempotency_key: Some("k1-0123456789abcdef".to_string()),
            ..harness.reserve_request(user, 3)
        };
        let outcome = pipeline
            .execute(Some("k1-0123456789abcdef"), "fp", move || async move {
                let booking = service.reserve(request).await.map_err(|e| {
                    booking_rush_server::error::ApiError::new(e.code(), e.to_string())
                })?;
                Ok(booking_rush_core::StoredResponse {
                    status: 201,
                    body: serde_json::json!({ "booking_id": booking.booking_id }),
                })
            })
            .await
            .unwrap();
        outcomes.push(outcome);
    }
    let (first, second) = (&outcomes[0], &outcomes[1]);

    assert_eq!(first.body["booking_id"], second.body["booking_id"]);
    assert_eq!(harness.snapshot().await, (2, 3, 0));
}

#[tokio::test]
async fn quota_is_enforced_across_bookings() {
    let harness = service_harness(10, 100).await;
    let user = UserId::new();

    harness
        .service
        .reserve(harness.reserve_request(user, 3))
        .await
        .unwrap();

    // 3 + 2 > 4: rejected before any deduction.
    let err = harness
        .service
        .reserve(harness.reserve_request(user, 2))
        .await
        .unwrap_err();
    assert!(matches!(err, ReservationError::QuotaExceeded { limit: 4 }));
    assert_eq!(harness.snapshot().await, (7, 3, 0));

    // A different user is unaffected.
    harness
        .service
        .reserve(harness.reserve_request(UserId::new(), 2))
        .await
        .unwrap();
}

// Scenario: unconfirmed reservation past its TTL: the sweeper expires it
// and the snapshot returns to the initial state.
#[tokio::test]
async fn sweeper_expires_stale_reservations() {
    let harness = service_harness(4, 100).await;
    let user = UserId::new();

    let booking = harness
        .service
        .reserve(harness.reserve_request(user, 3))
        .await
        .unwrap();
    assert_eq!(harness.snapshot().await, (1, 3, 0));

    harness.clock.advance(chrono::Duration::seconds(601));

    let sweeper = ExpirySweeper::new(
        harness.service.clone(),
        harness.clock.clone(),
        harness.config.background.clone(),
    );
    assert_eq!(sweeper.sweep().await, 1);
    // Idempotent: a second sweep finds nothing.
    assert_eq!(sweeper.sweep().await, 0);

    let expired = harness.store.fetch(booking.booking_id).await.unwrap().unwrap();
    assert_eq!(expired.status, BookingStatus::Expired);
    assert_eq!(harness.snapshot().await, (4, 0, 0));
    assert_eq!(
        harness.store.event_types_for(booking.booking_id),
        vec!["booking.reserved", "booking.expired"]
    );
}

// Boundary: confirm just before the TTL succeeds; just after, it fails
// EXPIRED and the seats come back.
#[tokio::test]
async fn confirm_races_the_ttl_boundary() {
    let harness = service_harness(4, 100).await;

    let early = harness
        .service
        .reserve(harness.reserve_request(UserId::new(), 1))
        .await
        .unwrap();
    harness.clock.advance(chrono::Duration::seconds(599));
    assert!(harness.service.confirm(early.booking_id, None).await.is_ok());

    let late = harness
        .service
        .reserve(harness.reserve_request(UserId::new(), 1))
        .await
        .unwrap();
    harness.clock.advance(chrono::Duration::seconds(601));
    let err = harness
        .service
        .confirm(late.booking_id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ReservationError::Expired));

    let stored = harness.store.fetch(late.booking_id).await.unwrap().unwrap();
    assert_eq!(stored.status, BookingStatus::Expired);
    // One sold from the early booking; the late one's seat is back.
    assert_eq!(harness.snapshot().await, (3, 0, 1));
}

#[tokio::test]
async fn cancel_is_idempotent_and_owner_scoped() {
    let harness = service_harness(4, 100).await;
    let user = UserId::new();

    let booking = harness
        .service
        .reserve(harness.reserve_request(user, 2))
        .await
        .unwrap();

    // Someone else cannot cancel it.
    let err = harness
        .service
        .cancel(booking.booking_id, UserId::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ReservationError::NotFound));

    let cancelled = harness
        .service
        .cancel(booking.booking_id, user)
        .await
        .unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    assert_eq!(harness.snapshot().await, (4, 0, 0));

    // Idempotent replay returns the terminal snapshot.
    let again = harness
        .service
        .cancel(booking.booking_id, user)
        .await
        .unwrap();
    assert_eq!(again.status, BookingStatus::Cancelled);

    // Confirm after cancel is a state conflict.
    let err = harness
        .service
        .confirm(booking.booking_id, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ReservationError::InvalidState {
            status: BookingStatus::Cancelled
        }
    ));
}

#[tokio::test]
async fn listing_pages_most_recent_first() {
    let harness = service_harness(50, 100).await;
    let user = UserId::new();

    // The per-event quota is 4, so spread across distinct events.
    for _ in 0..3 {
        let mut request = harness.reserve_request(user, 1);
        request.event_id = EventId::new();
        harness.service.reserve(request).await.unwrap();
        harness.clock.advance(chrono::Duration::seconds(1));
    }

    let page = harness.service.list(user, Page::new(1, 2)).await.unwrap();
    assert_eq!(page.len(), 2);
    assert!(page[0].reserved_at >= page[1].reserved_at);
    let rest = harness.service.list(user, Page::new(2, 2)).await.unwrap();
    assert_eq!(rest.len(), 1);
}

#[tokio::test]
async fn reconciler_rebuilds_drifted_counters() {
    let harness = service_harness(10, 100).await;

    harness
        .service
        .reserve(harness.reserve_request(UserId::new(), 3))
        .await
        .unwrap();
    assert_eq!(harness.snapshot().await, (7, 3, 0));

    // Simulate an engine restart that lost the counters.
    harness
        .inventory
        .rebuild(
            harness.zone,
            booking_rush_core::ZoneCounters {
                total: 10,
                available: 10,
                reserved: 0,
                sold: 0,
                version: 0,
            },
        )
        .await
        .unwrap();
    assert_eq!(harness.snapshot().await, (10, 0, 0));

    let mut background = harness.config.background.clone();
    background.reconciler_tolerance = 0;
    let reconciler = Reconciler::new(
        harness.service.bookings(),
        harness.inventory.clone(),
        background,
    );
    assert_eq!(reconciler.reconcile().await, 1);
    assert_eq!(harness.snapshot().await, (7, 3, 0));

    // A clean audit rebuilds nothing.
    assert_eq!(reconciler.reconcile().await, 0);
}

/// A bus that refuses publishes while the flag is up; the dispatcher must
/// back off and eventually dead-letter.
struct RefusingBus {
    inner: InMemoryBus,
    refusing: AtomicBool,
}

#[async_trait::async_trait]
impl MessageBus for RefusingBus {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: &serde_json::Value,
    ) -> Result<(), BusError> {
        if self.refusing.load(Ordering::SeqCst) && topic != booking_rush_core::topics::DLQ {
            return Err(BusError::PublishFailed {
                topic: topic.to_string(),
                reason: "broker unavailable".to_string(),
            });
        }
        self.inner.publish(topic, key, payload).await
    }

    async fn subscribe(&self, topics: &[&str]) -> Result<RecordStream, BusError> {
        self.inner.subscribe(topics).await
    }
}

#[tokio::test]
async fn dispatcher_dead_letters_after_max_retries() {
    let harness = service_harness(4, 100).await;
    let bus = Arc::new(RefusingBus {
        inner: InMemoryBus::new(),
        refusing: AtomicBool::new(true),
    });
    let dead_letters = Arc::new(InMemoryDeadLetterStore::new());

    let mut outbox_config = harness.config.outbox.clone();
    outbox_config.max_retries = 3;
    let dispatcher = OutboxDispatcher::new(
        harness.store.clone(),
        dead_letters.clone(),
        bus.clone(),
        harness.clock.clone(),
        outbox_config,
        booking_rush_runtime::HealthState::new(),
    );

    harness
        .service
        .reserve(harness.reserve_request(UserId::new(), 1))
        .await
        .unwrap();

    // Three failing cycles exhaust the row's retries.
    for _ in 0..3 {
        let report = dispatcher.dispatch_batch().await;
        assert_eq!(report.published, 0);
    }

    let entries = dead_letters.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].event_type, "booking.reserved");
    assert_eq!(entries[0].retry_count, 3);
    assert!(entries[0].error.contains("broker unavailable"));

    // The row is failed, not pending; the DLQ notice reached the bus.
    let rows = harness.store.outbox_rows();
    assert_eq!(rows[0].status, OutboxStatus::Failed);
    assert_eq!(
        bus.inner.published_to(booking_rush_core::topics::DLQ).len(),
        1
    );

    // Broker recovers: later events flow again.
    bus.refusing.store(false, Ordering::SeqCst);
    harness
        .service
        .reserve(harness.reserve_request(UserId::new(), 1))
        .await
        .unwrap();
    let report = dispatcher.dispatch_batch().await;
    assert_eq!(report.published, 1);
}

struct FullHarness {
    app: App,
    store: Arc<InMemoryStore>,
    bus: Arc<InMemoryBus>,
    gateway: Arc<MockPaymentGateway>,
    zone: ZoneKey,
    event_id: EventId,
}

async fn full_harness(total_seats: u32, unit_cents: i64) -> FullHarness {
    let clock = Arc::new(test_clock());
    let store = Arc::new(InMemoryStore::new(clock.clone()));
    let bus = Arc::new(InMemoryBus::new());
    let gateway = Arc::new(MockPaymentGateway::new());
    let zone = ZoneKey::new(ShowId::new(), ZoneId::new());
    let event_id = EventId::new();

    let catalog = Arc::new(StaticCatalog::new(vec![ZoneDef {
        zone,
        total_seats,
        unit_price: Money::from_cents(unit_cents),
        currency: "THB".to_string(),
        sale_window: None,
    }]));

    let app = App::assemble(
        Arc::new(tuned_config()),
        Components {
            bookings: store.clone(),
            outbox: store.clone(),
            dead_letters: Arc::new(InMemoryDeadLetterStore::new()),
            idempotency: Arc::new(InMemoryIdempotencyStore::new()),
            sagas: Arc::new(InMemorySagaStore::new()),
            bus: bus.clone(),
            catalog,
            gateway: gateway.clone(),
            clock: clock.clone(),
        },
    )
    .await
    .unwrap();

    FullHarness {
        app,
        store,
        bus,
        gateway,
        zone,
        event_id,
    }
}

impl FullHarness {
    async fn status_of(&self, booking_id: BookingId) -> BookingStatus {
        self.store
            .fetch(booking_id)
            .await
            .unwrap()
            .map(|b| b.status)
            .unwrap_or(BookingStatus::Reserved)
    }

    async fn snapshot(&self) -> (u32, u32, u32) {
        let counters = self
            .app
            .inventory
            .snapshot(self.zone)
            .await
            .unwrap()
            .unwrap();
        (counters.available, counters.reserved, counters.sold)
    }
}

// Scenario: the full happy-path saga: reserve, payment captured by the
// worker, booking auto-confirmed, seats sold.
#[tokio::test]
async fn saga_confirms_a_paid_booking_end_to_end() {
    let harness = full_harness(2, 100).await;

    let booking = harness
        .app
        .state
        .service
        .reserve(ReserveRequest {
            user_id: UserId::new(),
            event_id: harness.event_id,
            show_id: harness.zone.show_id,
            zone_id: harness.zone.zone_id,
            quantity: 2,
            unit_price: None,
            idempotency_key: None,
        })
        .await
        .unwrap();

    let confirmed = eventually(Duration::from_secs(5), || async {
        harness.status_of(booking.booking_id).await == BookingStatus::Confirmed
    })
    .await;
    assert!(confirmed, "saga never confirmed the booking");

    assert_eq!(harness.snapshot().await, (0, 0, 2));
    assert_eq!(harness.gateway.charge_count(), 1);

    // The saga completed and said so on the bus.
    let lifecycle_done = eventually(Duration::from_secs(2), || async {
        !harness
            .bus
            .published_to(booking_rush_core::topics::events::SAGA_COMPLETED)
            .is_empty()
    })
    .await;
    assert!(lifecycle_done, "saga.completed never published");

    let final_booking = harness.store.fetch(booking.booking_id).await.unwrap().unwrap();
    assert!(final_booking.payment_id.is_some());
}

// Scenario: payment fails: the saga compensates, the booking is
// cancelled, the outbox records booking.cancelled and booking.compensated,
// and the snapshot is restored.
#[tokio::test]
async fn saga_compensates_a_failed_payment() {
    let harness = full_harness(2, 100).await;
    harness.gateway.fail_next(PaymentError::Declined {
        reason: "do not honor".to_string(),
    });

    let booking = harness
        .app
        .state
        .service
        .reserve(ReserveRequest {
            user_id: UserId::new(),
            event_id: harness.event_id,
            show_id: harness.zone.show_id,
            zone_id: harness.zone.zone_id,
            quantity: 2,
            unit_price: None,
            idempotency_key: None,
        })
        .await
        .unwrap();

    let cancelled = eventually(Duration::from_secs(5), || async {
        harness.status_of(booking.booking_id).await == BookingStatus::Cancelled
    })
    .await;
    assert!(cancelled, "compensation never cancelled the booking");

    let restored = eventually(Duration::from_secs(2), || async {
        harness.snapshot().await == (2, 0, 0)
    })
    .await;
    assert!(restored, "inventory never restored");

    let compensated = eventually(Duration::from_secs(2), || async {
        let events = harness.store.event_types_for(booking.booking_id);
        events.iter().any(|e| e == "booking.cancelled")
            && events.iter().any(|e| e == "booking.compensated")
    })
    .await;
    assert!(compensated, "outbox missing compensation records");

    // No payment was captured, so nothing was refunded.
    assert_eq!(harness.gateway.charge_count(), 0);
}
