use super::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /status
/// Buffers, circuit breaker, connection health and bus metrics
pub async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.worker.status()))
}

/// GET /status/calls/:interaction_id
/// Detail for one active call buffer
pub async fn get_call_status(
    State(state): State<AppState>,
    Path(interaction_id): Path<String>,
) -> impl IntoResponse {
    match state.worker.call_status(&interaction_id) {
        Some(status) => (StatusCode::OK, Json(status)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("No active buffer for call {}", interaction_id),
            }),
        )
            .into_response(),
    }
}
