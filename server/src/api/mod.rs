//! The HTTP surface: routes, shared state, extractors and handlers.

pub mod bookings;
pub mod extractors;
pub mod health;
pub mod queue;

use crate::auth::TokenVerifier;
use crate::service::{IdempotencyPipeline, ReservationService};
use axum::Router;
use axum::routing::{delete, get, post};
use booking_rush_queue::VirtualQueue;
use booking_rush_runtime::HealthState;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// The reservation service.
    pub service: Arc<ReservationService>,
    /// The virtual queue.
    pub queue: Arc<VirtualQueue>,
    /// The idempotency pipeline wrapped around mutations.
    pub idempotency: Arc<IdempotencyPipeline>,
    /// The auth boundary.
    pub verifier: Arc<dyn TokenVerifier>,
    /// Readiness latch.
    pub health: HealthState,
}

/// Builds the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/bookings/reserve", post(bookings::reserve))
        .route("/bookings/:id/confirm", post(bookings::confirm))
        .route(
            "/bookings/:id",
            get(bookings::get_booking).delete(bookings::cancel),
        )
        .route("/bookings", get(bookings::list))
        .route("/queue/join", post(queue::join))
        .route("/queue/position/:event_id", get(queue::position))
        .route("/queue/leave", delete(queue::leave))
        .route("/queue/release", post(queue::release))
        .route("/health/live", get(health::live))
        .route("/health/ready", get(health::ready))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
