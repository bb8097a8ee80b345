//! WebSocket stream of aggregated intent state.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
};
use conduit_core::IntentId;
use serde::Serialize;
use tokio::time::{interval, Duration};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::registry::IntentState;
use crate::state::AppState;

/// WebSocket message for intent updates.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IntentStreamMessage {
    /// Aggregated state changed (or the stream just opened).
    State {
        intent_id: IntentId,
        version: u32,
        state: IntentState,
    },
    /// Error message; the stream closes after it.
    Error { message: String },
    /// Ping for keepalive.
    Ping,
}

/// Intent state stream.
pub async fn intent_stream(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_intent_stream(socket, IntentId::new(id), state))
}

async fn send(socket: &mut WebSocket, message: &IntentStreamMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(json) => socket.send(Message::Text(json)).await.is_ok(),
        Err(e) => {
            tracing::error!(error = %e, "cannot encode stream message");
            false
        }
    }
}

async fn handle_intent_stream(mut socket: WebSocket, intent_id: IntentId, state: AppState) {
    let mut updates = BroadcastStream::new(state.updates.subscribe());
    let mut ping_interval = interval(Duration::from_secs(30));
    ping_interval.tick().await;

    let Some(mut last) = state.status(&intent_id) else {
        let message = IntentStreamMessage::Error {
            message: format!("Intent {} not found", intent_id),
        };
        let _ = send(&mut socket, &message).await;
        return;
    };
    let opening = IntentStreamMessage::State {
        intent_id: intent_id.clone(),
        version: last.0,
        state: last.1,
    };
    if !send(&mut socket, &opening).await {
        return;
    }

    loop {
        tokio::select! {
            update = updates.next() => {
                match update {
                    Some(Ok(id)) if id != intent_id => continue,
                    Some(Ok(_)) | Some(Err(BroadcastStreamRecvError::Lagged(_))) => {}
                    None => break,
                }
                let Some(current) = state.status(&intent_id) else { break };
                if current == last {
                    continue;
                }
                last = current;
                let message = IntentStreamMessage::State {
                    intent_id: intent_id.clone(),
                    version: current.0,
                    state: current.1,
                };
                if !send(&mut socket, &message).await {
                    break;
                }
            }
            _ = ping_interval.tick() => {
                if !send(&mut socket, &IntentStreamMessage::Ping).await {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}
