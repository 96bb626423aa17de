//! Virtual queue endpoints.

use crate::api::AppState;
use crate::auth::AuthedUser;
use crate::error::ApiError;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use booking_rush_core::{ErrorCode, EventId};
use booking_rush_queue::JoinError;
use serde::Deserialize;
use uuid::Uuid;

/// Body of `POST /queue/join` and `DELETE /queue/leave`.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueBody {
    /// The event to queue for.
    pub event_id: EventId,
}

/// `POST /queue/join`
pub async fn join(
    State(state): State<AppState>,
    user: AuthedUser,
    Json(body): Json<QueueBody>,
) -> Result<Response, ApiError> {
    let ticket = state
        .queue
        .join(body.event_id, user.0)
        .map_err(|error| match error {
            JoinError::AlreadyQueued => {
                ApiError::new(ErrorCode::StateConflict, "already queued for this event")
            }
        })?;

    Ok((
        StatusCode::OK,
        Json(serde_json::json!({
            "event_id": ticket.event_id,
            "position": ticket.position,
            "token": ticket.token,
            "eta_seconds": ticket.eta.as_secs(),
        })),
    )
        .into_response())
}

/// `GET /queue/position/:event_id`
pub async fn position(
    State(state): State<AppState>,
    user: AuthedUser,
    Path(event_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let info = state
        .queue
        .position(EventId::from_uuid(event_id), user.0)
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "not queued for this event"))?;

    Ok((
        StatusCode::OK,
        Json(serde_json::json!({
            "position": info.position,
            "total_in_queue": info.total_in_queue,
            "pass": info.pass.as_ref().map(|pass| &pass.token),
            "pass_expires_at": info.pass.as_ref().map(|pass| pass.expires_at),
        })),
    )
        .into_response())
}

/// `DELETE /queue/leave`
pub async fn leave(
    State(state): State<AppState>,
    user: AuthedUser,
    Json(body): Json<QueueBody>,
) -> Result<Response, ApiError> {
    let left = state.queue.leave(body.event_id, user.0);
    Ok((
        StatusCode::OK,
        Json(serde_json::json!({ "event_id": body.event_id, "left": left })),
    )
        .into_response())
}

/// `POST /queue/release`, the operator/worker surface: pop the head of the
/// queue and issue passes.
pub async fn release(
    State(state): State<AppState>,
    _user: AuthedUser,
    Json(body): Json<QueueBody>,
) -> Result<Response, ApiError> {
    let issued = state.queue.release_batch(body.event_id);
    Ok((
        StatusCode::OK,
        Json(serde_json::json!({
            "event_id": body.event_id,
            "released": issued.len(),
        })),
    )
        .into_response())
}
