//! Wiring: stores, engine, service, background tasks, router.
//!
//! [`App::assemble`] composes everything from trait objects, so the same
//! wiring serves production (Postgres + Redpanda) and tests (the in-memory
//! stores). [`App::connect_production`] builds the production components.

use crate::api::{self, AppState};
use crate::auth::HmacTokenVerifier;
use crate::config::Config;
use crate::dispatcher::OutboxDispatcher;
use crate::payment::{MockPaymentGateway, PaymentGateway};
use crate::reconciler::Reconciler;
use crate::service::{IdempotencyPipeline, PriceCatalog, ReservationService, StaticCatalog};
use crate::sweeper::ExpirySweeper;
use crate::workers::SagaWorkers;
use anyhow::Context as _;
use axum::Router;
use booking_rush_core::{
    BookingStore, Clock, DeadLetterStore, IdempotencyStore, InventoryStore, MessageBus,
    OutboxStore,
};
use booking_rush_inventory::InventoryEngine;
use booking_rush_queue::{QueueConfig, VirtualQueue};
use booking_rush_redpanda::RedpandaBus;
use booking_rush_runtime::{BackoffPolicy, HealthState};
use booking_rush_saga::{SagaOrchestrator, SagaStore, StepPolicy};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Everything the wiring needs injected.
pub struct Components {
    /// Durable booking store.
    pub bookings: Arc<dyn BookingStore>,
    /// Outbox store (usually the same backend as bookings).
    pub outbox: Arc<dyn OutboxStore>,
    /// Dead-letter store.
    pub dead_letters: Arc<dyn DeadLetterStore>,
    /// Idempotency store.
    pub idempotency: Arc<dyn IdempotencyStore>,
    /// Saga instance store. Must be durable in production; a crashed
    /// orchestrator resumes every live saga from it.
    pub sagas: Arc<dyn SagaStore>,
    /// Message bus.
    pub bus: Arc<dyn MessageBus>,
    /// Catalog read side.
    pub catalog: Arc<dyn PriceCatalog>,
    /// Payment gateway.
    pub gateway: Arc<dyn PaymentGateway>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

/// The assembled application.
pub struct App {
    /// The HTTP router, ready to serve.
    pub router: Router,
    /// Handler state (also handy for driving the service in tests).
    pub state: AppState,
    /// The inventory engine handle.
    pub inventory: Arc<dyn InventoryStore>,
    tasks: Vec<JoinHandle<()>>,
}

impl App {
    /// Wires the whole pipeline and spawns the background tasks:
    /// outbox dispatcher, expiry sweeper, reconciler, saga orchestrator,
    /// saga workers and the queue release worker.
    ///
    /// # Errors
    ///
    /// Fails if the inventory engine cannot seed the catalog zones.
    pub async fn assemble(config: Arc<Config>, components: Components) -> anyhow::Result<Self> {
        let Components {
            bookings,
            outbox,
            dead_letters,
            idempotency,
            sagas,
            bus,
            catalog,
            gateway,
            clock,
        } = components;

        let engine = InventoryEngine::spawn(
            Arc::clone(&clock),
            config.background.sweeper_interval,
        );
        let inventory: Arc<dyn InventoryStore> = Arc::new(engine);

        for def in catalog.zones() {
            inventory
                .seed(def.zone, def.total_seats, def.sale_window)
                .await
                .with_context(|| format!("seeding zone {}", def.zone))?;
        }

        let service = Arc::new(ReservationService::new(
            Arc::clone(&bookings),
            Arc::clone(&inventory),
            Arc::clone(&catalog),
            Arc::clone(&clock),
            Arc::clone(&config),
        ));
        let pipeline = Arc::new(IdempotencyPipeline::new(
            idempotency,
            Arc::clone(&clock),
            config.idempotency.ttl,
            config.idempotency.wait,
        ));
        let queue = Arc::new(VirtualQueue::new(
            QueueConfig {
                pass_ttl: config.queue.pass_ttl,
                threshold_on: config.queue.threshold_on,
                threshold_off: config.queue.threshold_off,
                batch_size: config.queue.batch_size,
                arrival_window: Duration::from_secs(1),
                release_interval: config.queue.release_interval,
            },
            config.server.token_secret.as_bytes(),
            Arc::clone(&clock),
        ));
        let verifier = Arc::new(HmacTokenVerifier::new(
            config.server.token_secret.as_bytes(),
        ));
        let health = HealthState::new();

        let mut tasks = Vec::new();

        let dispatcher = OutboxDispatcher::new(
            Arc::clone(&outbox),
            dead_letters,
            Arc::clone(&bus),
            Arc::clone(&clock),
            config.outbox.clone(),
            health.clone(),
        );
        tasks.push(tokio::spawn(dispatcher.run()));

        let sweeper = ExpirySweeper::new(
            Arc::clone(&service),
            Arc::clone(&clock),
            config.background.clone(),
        );
        tasks.push(tokio::spawn(sweeper.run()));

        let reconciler = Reconciler::new(
            Arc::clone(&bookings),
            Arc::clone(&inventory),
            config.background.clone(),
        );
        tasks.push(tokio::spawn(reconciler.run()));

        let orchestrator = SagaOrchestrator::new(
            Arc::clone(&bus),
            sagas,
            Arc::clone(&outbox),
            Arc::clone(&clock),
            StepPolicy {
                step_timeout: config.saga.step_timeout,
                max_retries: config.saga.max_retries,
            },
            BackoffPolicy::default(),
            config.saga.tick_interval,
        );
        tasks.push(tokio::spawn(async move {
            if let Err(error) = orchestrator.run().await {
                tracing::error!(error = %error, "saga orchestrator stopped");
            }
        }));

        let workers = SagaWorkers::new(
            Arc::clone(&bus),
            Arc::clone(&service),
            gateway,
            Arc::clone(&clock),
        );
        tasks.push(tokio::spawn(async move {
            if let Err(error) = workers.run().await {
                tracing::error!(error = %error, "saga workers stopped");
            }
        }));

        // Queue release worker: pops head batches for every event with
        // waiting users.
        {
            let queue = Arc::clone(&queue);
            let release_interval = config.queue.release_interval;
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(release_interval);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tick.tick().await;
                    for event_id in queue.events_with_waiting() {
                        queue.release_batch(event_id);
                    }
                }
            }));
        }

        let state = AppState {
            service,
            queue,
            idempotency: pipeline,
            verifier,
            health,
        };
        let router = api::router(state.clone());

        Ok(Self {
            router,
            state,
            inventory,
            tasks,
        })
    }

    /// Builds the production components (Postgres stores, the Redpanda
    /// bus, the catalog from `CATALOG_JSON`) and assembles the app.
    ///
    /// # Errors
    ///
    /// Fails if the database or broker is unreachable, or the catalog JSON
    /// is malformed.
    pub async fn connect_production(config: Config) -> anyhow::Result<Self> {
        let config = Arc::new(config);

        let pool = booking_rush_postgres::connect(
            &config.postgres.url,
            config.postgres.max_connections,
        )
        .await
        .context("connecting to postgres")?;
        booking_rush_postgres::schema::apply(&pool)
            .await
            .context("applying schema")?;

        let bus = RedpandaBus::builder()
            .brokers(config.redpanda.brokers.clone())
            .consumer_group(config.redpanda.consumer_group.clone())
            .build()
            .context("connecting to redpanda")?;

        let catalog_json =
            std::env::var("CATALOG_JSON").unwrap_or_else(|_| "[]".to_string());
        let catalog = StaticCatalog::from_json(&catalog_json).context("parsing CATALOG_JSON")?;

        let components = Components {
            bookings: Arc::new(booking_rush_postgres::PostgresBookingStore::new(pool.clone())),
            outbox: Arc::new(booking_rush_postgres::PostgresOutboxStore::new(pool.clone())),
            dead_letters: Arc::new(booking_rush_postgres::PostgresDeadLetterStore::new(
                pool.clone(),
            )),
            idempotency: Arc::new(booking_rush_postgres::PostgresIdempotencyStore::new(
                pool.clone(),
            )),
            sagas: Arc::new(booking_rush_postgres::PostgresSagaStore::new(pool)),
            bus: Arc::new(bus),
            catalog: Arc::new(catalog),
            // Payment internals are a boundary; the mock gateway stands in
            // for the intent/webhook surface.
            gateway: Arc::new(MockPaymentGateway::new()),
            clock: Arc::new(booking_rush_core::SystemClock),
        };

        Self::assemble(config, components).await
    }

    /// Aborts every background task.
    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}
