//! Intent API endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use conduit_core::{Intent, IntentId, RouteError};

use crate::registry::{IntentView, RegistryError};
use crate::state::{AppState, Submission};

fn route_status(error: &RouteError) -> StatusCode {
    if error.is_transient() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::UNPROCESSABLE_ENTITY
    }
}

/// Submit a graph payload.
///
/// Malformed payloads are answered 400, payloads that cannot be routed 422
/// (503 if the twin store could not be reached).
pub async fn submit_intent(
    State(state): State<AppState>,
    body: String,
) -> Result<(StatusCode, Json<Submission>), (StatusCode, String)> {
    let intent = Intent::parse(&body).map_err(|e| {
        tracing::info!(error = %e, "intent refused");
        (StatusCode::BAD_REQUEST, e.to_string())
    })?;

    let submission = state.submit(intent).await.map_err(|e| {
        tracing::info!(error = %e, "intent not routable");
        (route_status(&e), e.to_string())
    })?;

    Ok((StatusCode::CREATED, Json(submission)))
}

/// Get an intent and its aggregated state.
pub async fn get_intent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<IntentView>, (StatusCode, String)> {
    let id = IntentId::new(id);
    state
        .view(&id)
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, format!("Intent {} not found", id)))
}

/// List all intents.
pub async fn list_intents(State(state): State<AppState>) -> Json<Vec<IntentView>> {
    Json(state.views())
}

/// Withdraw an intent.
pub async fn withdraw_intent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    match state.withdraw(&IntentId::new(id)).await {
        Ok(_) => Ok(StatusCode::NO_CONTENT),
        Err(e @ RegistryError::NotFound(_)) => Err((StatusCode::NOT_FOUND, e.to_string())),
        Err(e @ RegistryError::AlreadyWithdrawn(_)) => Err((StatusCode::CONFLICT, e.to_string())),
    }
}
