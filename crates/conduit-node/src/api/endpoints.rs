//! Twin store access: endpoint registration and the per-intent record log.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use conduit_core::{HandlerEndpoint, IntentId, TargetId, TwinError};
use conduit_twin::TwinEntry;

use crate::state::AppState;

fn twin_status(error: &TwinError) -> StatusCode {
    if error.is_transient() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::BAD_GATEWAY
    }
}

/// Register or replace the endpoint serving a target.
pub async fn register_endpoint(
    State(state): State<AppState>,
    Path(target): Path<String>,
    Json(endpoint): Json<HandlerEndpoint>,
) -> Result<StatusCode, (StatusCode, String)> {
    let target = TargetId::new(target);
    if endpoint.target != target {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("endpoint is for {}, not {}", endpoint.target, target),
        ));
    }

    state
        .twin
        .register_endpoint(endpoint)
        .await
        .map_err(|e| (twin_status(&e), e.to_string()))?;
    state.router.resolver().invalidate(&target);
    tracing::info!(%target, "endpoint registered");
    Ok(StatusCode::NO_CONTENT)
}

/// Twin records of an intent: its sub-intents and forwarded reports.
pub async fn twin_records(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<TwinEntry>>, (StatusCode, String)> {
    state
        .twin
        .records_for(&IntentId::new(id))
        .await
        .map(Json)
        .map_err(|e| (twin_status(&e), e.to_string()))
}
