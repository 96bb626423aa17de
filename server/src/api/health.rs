//! Liveness and readiness probes.

use crate::api::AppState;
use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// `GET /health/live`: the process is up.
pub async fn live() -> Response {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" }))).into_response()
}

/// `GET /health/ready`: the instance may receive traffic. Fatal errors
/// trip this until recovery.
pub async fn ready(State(state): State<AppState>) -> Response {
    if state.health.is_ready() {
        (StatusCode::OK, Json(serde_json::json!({ "status": "ready" }))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "unready",
                "reason": state.health.reason(),
            })),
        )
            .into_response()
    }
}
