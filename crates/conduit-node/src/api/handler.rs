//! Intake of the handler hosted by this node.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use conduit_core::{Acceptance, SubIntent};
use conduit_handler::protocol::parse_idempotency_key;
use conduit_handler::{HandlerAdapter, WithdrawAck, IDEMPOTENCY_KEY_HEADER};
use std::sync::Arc;
use uuid::Uuid;

use crate::state::AppState;

fn hosted(state: &AppState) -> Result<&Arc<dyn HandlerAdapter>, (StatusCode, String)> {
    state.handler.as_ref().ok_or((
        StatusCode::NOT_FOUND,
        "no handler is hosted on this node".to_string(),
    ))
}

/// Take or refuse a sub-intent.
pub async fn accept_sub_intent(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(sub_intent): Json<SubIntent>,
) -> Result<Json<Acceptance>, (StatusCode, String)> {
    let handler = hosted(&state)?;

    if let Some(value) = headers.get(IDEMPOTENCY_KEY_HEADER) {
        let key = value.to_str().ok().and_then(parse_idempotency_key);
        if key != Some(sub_intent.id) {
            return Err((
                StatusCode::BAD_REQUEST,
                format!("{} does not match sub-intent {}", IDEMPOTENCY_KEY_HEADER, sub_intent.id),
            ));
        }
    }

    let id = sub_intent.id;
    handler.accept(sub_intent).await.map(Json).map_err(|e| {
        tracing::warn!(sub_intent_id = %id, error = %e, "sub-intent not recorded");
        (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
    })
}

/// Stop realizing a sub-intent.
pub async fn withdraw_sub_intent(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<WithdrawAck>, (StatusCode, String)> {
    let handler = hosted(&state)?;
    match handler.withdraw(id).await {
        Some(withdrawn) => Ok(Json(WithdrawAck {
            sub_intent_id: id,
            withdrawn,
        })),
        None => Err((StatusCode::NOT_FOUND, format!("sub-intent {} not found", id))),
    }
}
