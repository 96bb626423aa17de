//! Concurrency tests for the inventory engine.
//!
//! The critical behaviors: exactly one winner for the last seat under
//! heavy contention, idempotent hold replay, TTL sweeping, and rebuild.

#![allow(clippy::unwrap_used, clippy::panic)]

use booking_rush_core::{
    BookingId, ConfirmOutcome, InventoryStore, ReleaseOutcome, ReserveOutcome, ShowId,
    ZoneCounters, ZoneId, ZoneKey,
};
use booking_rush_inventory::InventoryEngine;
use booking_rush_testing::test_clock;
use std::sync::Arc;
use std::time::Duration;

const TTL: Duration = Duration::from_secs(600);

fn fresh_zone() -> ZoneKey {
    ZoneKey::new(ShowId::new(), ZoneId::new())
}

#[tokio::test]
async fn hundred_contenders_one_winner() {
    let clock = Arc::new(test_clock());
    let engine = InventoryEngine::spawn(clock, Duration::from_secs(60));
    let zone = fresh_zone();
    engine.seed(zone, 1, None).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..100 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            engine.reserve(zone, BookingId::new(), 1, TTL).await.unwrap()
        }));
    }

    let mut wins = 0;
    let mut losses = 0;
    for task in tasks {
        match task.await.unwrap() {
            ReserveOutcome::Reserved(_) => wins += 1,
            ReserveOutcome::Insufficient { available } => {
                assert_eq!(available, 0);
                losses += 1;
            }
            ReserveOutcome::SaleClosed => panic!("no sale window configured"),
        }
    }

    assert_eq!(wins, 1);
    assert_eq!(losses, 99);

    let snapshot = engine.snapshot(zone).await.unwrap().unwrap();
    assert_eq!(
        (snapshot.available, snapshot.reserved, snapshot.sold),
        (0, 1, 0)
    );
}

#[tokio::test]
async fn concurrent_reserves_never_oversell() {
    let clock = Arc::new(test_clock());
    let engine = InventoryEngine::spawn(clock, Duration::from_secs(60));
    let zone = fresh_zone();
    engine.seed(zone, 10, None).await.unwrap();

    // 50 contenders for 10 seats, 1 each.
    let mut tasks = Vec::new();
    for _ in 0..50 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            engine.reserve(zone, BookingId::new(), 1, TTL).await.unwrap()
        }));
    }

    let wins = {
        let mut wins = 0;
        for task in tasks {
            if matches!(task.await.unwrap(), ReserveOutcome::Reserved(_)) {
                wins += 1;
            }
        }
        wins
    };

    assert_eq!(wins, 10);
    let snapshot = engine.snapshot(zone).await.unwrap().unwrap();
    assert!(snapshot.is_conserved());
    assert_eq!(snapshot.available, 0);
    assert_eq!(snapshot.reserved, 10);
}

#[tokio::test]
async fn reserve_confirm_release_lifecycle() {
    let clock = Arc::new(test_clock());
    let engine = InventoryEngine::spawn(clock, Duration::from_secs(60));
    let zone = fresh_zone();
    engine.seed(zone, 2, None).await.unwrap();

    let hold = BookingId::new();
    let outcome = engine.reserve(zone, hold, 2, TTL).await.unwrap();
    assert!(matches!(outcome, ReserveOutcome::Reserved(_)));

    // Scenario: concurrent reserve for one more seat fails, snapshot
    // unchanged.
    let outcome = engine.reserve(zone, BookingId::new(), 1, TTL).await.unwrap();
    assert_eq!(outcome, ReserveOutcome::Insufficient { available: 0 });

    let confirmed = engine.confirm(zone, hold).await.unwrap();
    let ConfirmOutcome::Confirmed(counters) = confirmed else {
        panic!("expected Confirmed");
    };
    assert_eq!(
        (counters.available, counters.reserved, counters.sold),
        (0, 0, 2)
    );

    // Release after confirm finds no hold; counters keep the sale.
    assert_eq!(engine.release(zone, hold).await.unwrap(), ReleaseOutcome::NotFound);
    let snapshot = engine.snapshot(zone).await.unwrap().unwrap();
    assert_eq!(snapshot.sold, 2);
}

#[tokio::test]
async fn idempotent_reserve_replay_under_concurrency() {
    let clock = Arc::new(test_clock());
    let engine = InventoryEngine::spawn(clock, Duration::from_secs(60));
    let zone = fresh_zone();
    engine.seed(zone, 5, None).await.unwrap();

    let hold = BookingId::new();
    let mut tasks = Vec::new();
    for _ in 0..10 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            engine.reserve(zone, hold, 3, TTL).await.unwrap()
        }));
    }
    for task in tasks {
        assert!(matches!(task.await.unwrap(), ReserveOutcome::Reserved(_)));
    }

    // Ten replays of the same hold deduct exactly once.
    let snapshot = engine.snapshot(zone).await.unwrap().unwrap();
    assert_eq!((snapshot.available, snapshot.reserved), (2, 3));
}

#[tokio::test]
async fn expired_holds_are_swept_by_clock_advance() {
    let clock = Arc::new(test_clock());
    let engine = InventoryEngine::spawn(clock.clone(), Duration::from_secs(3600));
    let zone = fresh_zone();
    engine.seed(zone, 4, None).await.unwrap();

    let hold = BookingId::new();
    engine
        .reserve(zone, hold, 4, Duration::from_secs(10))
        .await
        .unwrap();

    clock.advance(chrono::Duration::seconds(15));

    // Lazy sweep on the next touch: the expired hold is gone and its seats
    // are back.
    assert_eq!(engine.confirm(zone, hold).await.unwrap(), ConfirmOutcome::Expired);
    let snapshot = engine.snapshot(zone).await.unwrap().unwrap();
    assert_eq!(snapshot.available, 4);
    assert_eq!(snapshot.reserved, 0);
}

#[tokio::test]
async fn rebuild_overwrites_counters_from_durable_truth() {
    let clock = Arc::new(test_clock());
    let engine = InventoryEngine::spawn(clock, Duration::from_secs(60));
    let zone = fresh_zone();
    engine.seed(zone, 10, None).await.unwrap();

    engine
        .rebuild(
            zone,
            ZoneCounters {
                total: 10,
                available: 3,
                reserved: 2,
                sold: 5,
                version: 0,
            },
        )
        .await
        .unwrap();

    let snapshot = engine.snapshot(zone).await.unwrap().unwrap();
    assert_eq!(
        (snapshot.available, snapshot.reserved, snapshot.sold),
        (3, 2, 5)
    );
    assert!(snapshot.version > 0);
}

#[tokio::test]
async fn unknown_zone_is_an_error() {
    let clock = Arc::new(test_clock());
    let engine = InventoryEngine::spawn(clock, Duration::from_secs(60));

    let result = engine
        .reserve(fresh_zone(), BookingId::new(), 1, TTL)
        .await;
    assert!(result.is_err());
    assert!(engine.snapshot(fresh_zone()).await.unwrap().is_none());
}
