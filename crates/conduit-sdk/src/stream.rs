//! Aggregated state stream for one intent.

use conduit_core::{ConduitError, IntentId, Result};
use futures::StreamExt;
use serde::Deserialize;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// A change of an intent's aggregated state.
#[derive(Debug, Clone, PartialEq)]
pub enum StateEvent {
    /// The aggregated state (or version) changed.
    State {
        version: u32,
        /// `received`, `compliant`, `degraded`, `finalizing` or `withdrawn`.
        state: String,
    },
    /// The node reported an error; the stream ends after it.
    Error { message: String },
}

/// WebSocket message from the node.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsMessage {
    State {
        version: u32,
        state: String,
    },
    Error {
        message: String,
    },
    Ping,
}

/// Stream of state changes for an intent.
pub struct IntentStream {
    intent_id: IntentId,
    receiver: tokio::sync::mpsc::Receiver<StateEvent>,
    _handle: tokio::task::JoinHandle<()>,
}

impl IntentStream {
    /// Connect to the state stream of an intent.
    pub async fn connect(ws_url: &str, intent_id: IntentId) -> Result<Self> {
        let (ws_stream, _) = connect_async(ws_url)
            .await
            .map_err(|e| ConduitError::Connection(e.to_string()))?;

        let (tx, rx) = tokio::sync::mpsc::channel(100);

        let handle = tokio::spawn(async move {
            let (_, mut read) = ws_stream.split();

            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let event = match serde_json::from_str::<WsMessage>(&text) {
                            Ok(WsMessage::State { version, state, .. }) => {
                                StateEvent::State { version, state }
                            }
                            Ok(WsMessage::Error { message }) => StateEvent::Error { message },
                            Ok(WsMessage::Ping) => continue,
                            Err(e) => {
                                tracing::debug!(error = %e, "ignoring unrecognized stream message");
                                continue;
                            }
                        };

                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
        });

        Ok(Self {
            intent_id,
            receiver: rx,
            _handle: handle,
        })
    }

    /// Get the intent ID this stream is for.
    pub fn intent_id(&self) -> &IntentId {
        &self.intent_id
    }

    /// Get the next event.
    pub async fn next(&mut self) -> Option<StateEvent> {
        self.receiver.recv().await
    }
}
