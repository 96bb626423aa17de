//! Booking endpoints: reserve, confirm, cancel, read.

use crate::api::AppState;
use crate::api::extractors::{IdempotencyKeyHeader, QueuePassHeader};
use crate::auth::AuthedUser;
use crate::error::ApiError;
use crate::service::idempotency::fingerprint;
use crate::service::{ReservationError, ReserveRequest};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use booking_rush_core::{
    Booking, BookingId, ErrorCode, EventId, Money, Page, PaymentId, ShowId, StoredResponse, ZoneId,
};
use booking_rush_queue::PassError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `POST /bookings/reserve` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveBody {
    /// Event being booked.
    pub event_id: EventId,
    /// Show within the event.
    pub show_id: ShowId,
    /// Zone within the show.
    pub zone_id: ZoneId,
    /// Seats requested.
    pub quantity: u32,
    /// Optional price override; the catalog is the trusted path.
    pub unit_price: Option<Money>,
}

/// `POST /bookings/:id/confirm` body.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConfirmBody {
    /// Gateway payment id, when the client drove the payment.
    pub payment_id: Option<String>,
}

/// List pagination query.
#[derive(Debug, Clone, Deserialize)]
pub struct ListQuery {
    /// 1-based page.
    #[serde(default = "default_page")]
    pub page: u32,
    /// Rows per page.
    #[serde(default = "default_per_page")]
    pub per_page: u32,
}

const fn default_page() -> u32 {
    1
}
const fn default_per_page() -> u32 {
    20
}

fn reservation_error(error: ReservationError) -> ApiError {
    let code = error.code();
    match code {
        ErrorCode::Internal => ApiError::internal(anyhow::anyhow!(error)),
        _ => ApiError::new(code, error.to_string()),
    }
}

fn pass_error(error: PassError) -> ApiError {
    ApiError::new(ErrorCode::PassInvalid, error.to_string())
}

fn stored(response: StoredResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::OK);
    (status, Json(response.body)).into_response()
}

fn booking_summary(booking: &Booking) -> serde_json::Value {
    serde_json::json!({
        "booking_id": booking.booking_id,
        "status": booking.status,
        "event_id": booking.event_id,
        "show_id": booking.show_id,
        "zone_id": booking.zone_id,
        "quantity": booking.quantity,
        "unit_price": booking.unit_price,
        "total_price": booking.total_price,
        "currency": booking.currency,
        "reserved_at": booking.reserved_at,
        "expires_at": booking.expires_at,
        "confirmed_at": booking.confirmed_at,
        "confirmation_code": booking.confirmation_code,
    })
}

/// `POST /bookings/reserve`
pub async fn reserve(
    State(state): State<AppState>,
    user: AuthedUser,
    idempotency_key: IdempotencyKeyHeader,
    pass: QueuePassHeader,
    Json(body): Json<ReserveBody>,
) -> Result<Response, ApiError> {
    // Admission control runs before anything touches inventory.
    let admission = state.queue.record_arrival(body.event_id);
    if admission.active {
        let token = pass.0.ok_or_else(|| {
            ApiError::new(
                ErrorCode::QueueRequired,
                "virtual queue is active, join the queue for a pass",
            )
        })?;
        state
            .queue
            .validate_pass(body.event_id, user.0, &token)
            .map_err(pass_error)?;
    }

    let body_json = serde_json::to_value(&body)
        .map_err(|e| ApiError::internal(anyhow::anyhow!(e)))?;
    let fp = fingerprint(&user.0.to_string(), "POST /bookings/reserve", &body_json);

    let service = state.service.clone();
    let key = idempotency_key.0;
    let recorded_key = key.clone();
    let response = state
        .idempotency
        .execute(key.as_deref(), &fp, move || async move {
            let booking = service
                .reserve(ReserveRequest {
                    user_id: user.0,
                    event_id: body.event_id,
                    show_id: body.show_id,
                    zone_id: body.zone_id,
                    quantity: body.quantity,
                    unit_price: body.unit_price,
                    idempotency_key: recorded_key,
                })
                .await
                .map_err(reservation_error)?;

            Ok(StoredResponse {
                status: 201,
                body: serde_json::json!({
                    "booking_id": booking.booking_id,
                    "status": booking.status,
                    "expires_at": booking.expires_at,
                    "total_price": booking.total_price,
                }),
            })
        })
        .await?;

    Ok(stored(response))
}

/// `POST /bookings/:id/confirm`
pub async fn confirm(
    State(state): State<AppState>,
    user: AuthedUser,
    Path(id): Path<Uuid>,
    idempotency_key: IdempotencyKeyHeader,
    Json(body): Json<ConfirmBody>,
) -> Result<Response, ApiError> {
    let booking_id = BookingId::from_uuid(id);

    // Ownership gate; the saga's confirm worker does not come through
    // here.
    state
        .service
        .get(booking_id, user.0)
        .await
        .map_err(reservation_error)?;

    let body_json = serde_json::to_value(&body)
        .map_err(|e| ApiError::internal(anyhow::anyhow!(e)))?;
    let fp = fingerprint(
        &user.0.to_string(),
        &format!("POST /bookings/{booking_id}/confirm"),
        &body_json,
    );

    let service = state.service.clone();
    let response = state
        .idempotency
        .execute(idempotency_key.0.as_deref(), &fp, move || async move {
            let booking = service
                .confirm(booking_id, body.payment_id.map(PaymentId::new))
                .await
                .map_err(reservation_error)?;

            Ok(StoredResponse {
                status: 200,
                body: serde_json::json!({
                    "booking_id": booking.booking_id,
                    "status": booking.status,
                    "confirmed_at": booking.confirmed_at,
                    "confirmation_code": booking.confirmation_code,
                }),
            })
        })
        .await?;

    Ok(stored(response))
}

/// `DELETE /bookings/:id`
pub async fn cancel(
    State(state): State<AppState>,
    user: AuthedUser,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let booking = state
        .service
        .cancel(BookingId::from_uuid(id), user.0)
        .await
        .map_err(reservation_error)?;

    Ok((
        StatusCode::OK,
        Json(serde_json::json!({
            "booking_id": booking.booking_id,
            "status": booking.status,
        })),
    )
        .into_response())
}

/// `GET /bookings/:id`
pub async fn get_booking(
    State(state): State<AppState>,
    user: AuthedUser,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let booking = state
        .service
        .get(BookingId::from_uuid(id), user.0)
        .await
        .map_err(reservation_error)?;
    Ok((StatusCode::OK, Json(booking_summary(&booking))).into_response())
}

/// `GET /bookings`
pub async fn list(
    State(state): State<AppState>,
    user: AuthedUser,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    let page = Page::new(query.page, query.per_page);
    let bookings = state
        .service
        .list(user.0, page)
        .await
        .map_err(reservation_error)?;

    let items: Vec<serde_json::Value> = bookings.iter().map(booking_summary).collect();
    Ok((
        StatusCode::OK,
        Json(serde_json::json!({
            "bookings": items,
            "page": page.page,
            "per_page": page.per_page,
        })),
    )
        .into_response())
}
