//! Plain HTTP routes

use super::GatewayState;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

/// Health check response
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    live_sessions: usize,
}

pub(crate) async fn health_check(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        live_sessions: state.registry.live_count().await,
    })
}

/// Same view as the `list_sessions` command
pub(crate) async fn list_sessions(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(state.registry.list().await)
}
