//! Health check endpoint.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::state::AppState;

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Intents known to this node.
    pub intents: usize,
    /// Sub-intents with a running report lane.
    pub report_lanes: usize,
    /// Endpoint cache entries, expired ones included.
    pub cached_endpoints: usize,
    pub hosts_handler: bool,
}

/// Health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        intents: state.registry.intent_count(),
        report_lanes: state.aggregator.lane_count(),
        cached_endpoints: state.router.resolver().cached_len(),
        hosts_handler: state.handler.is_some(),
    })
}
