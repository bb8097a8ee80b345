//! Sub-intent delivery.
//!
//! Each sub-intent is delivered concurrently with its own timeout and
//! backoff. Delivery is at-least-once: retries reuse the sub-intent id as the
//! idempotency key. If any sub-intent ends rejected or permanently failed,
//! every accepted sibling gets a best-effort withdrawal.

use std::sync::Arc;
use std::time::Duration;

use conduit_core::{Acceptance, DeliveryError, DeliveryStatus, HandlerEndpoint, RetryPolicy};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::router::RoutedSubIntent;
use crate::transport::HandlerTransport;

/// Configuration for sub-intent delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Bound on a single delivery or withdrawal call in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Retry budget for timeouts and transport failures.
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_timeout_ms() -> u64 {
    3_000
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Final result of delivering one sub-intent.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub sub_intent_id: Uuid,
    pub endpoint: HandlerEndpoint,
    pub status: DeliveryStatus,
    /// Delivery attempts made, the first one included.
    pub attempts: u32,
}

/// Result of dispatching every sub-intent of one intent version.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchOutcome {
    pub deliveries: Vec<Delivery>,
}

impl DispatchOutcome {
    /// Returns true if every handler accepted.
    pub fn all_accepted(&self) -> bool {
        self.deliveries
            .iter()
            .all(|d| d.status == DeliveryStatus::Accepted)
    }

    /// Deliveries that were rejected or exhausted their retries.
    pub fn failed(&self) -> impl Iterator<Item = &Delivery> {
        self.deliveries.iter().filter(|d| d.status.is_failed())
    }

    /// Final status of one sub-intent.
    pub fn status_of(&self, sub_intent_id: Uuid) -> Option<&DeliveryStatus> {
        self.deliveries
            .iter()
            .find(|d| d.sub_intent_id == sub_intent_id)
            .map(|d| &d.status)
    }
}

/// Delivers sub-intents through a [`HandlerTransport`].
pub struct Dispatcher {
    transport: Arc<dyn HandlerTransport>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl Dispatcher {
    /// Create a dispatcher.
    pub fn new(transport: Arc<dyn HandlerTransport>, config: &DispatchConfig) -> Self {
        Self {
            transport,
            timeout: Duration::from_millis(config.timeout_ms),
            retry: config.retry.clone(),
        }
    }

    /// Deliver every sub-intent; roll back accepted ones if any fails for good.
    pub async fn dispatch(&self, routed: &[RoutedSubIntent]) -> DispatchOutcome {
        let mut deliveries = join_all(routed.iter().map(|r| self.deliver(r))).await;

        if deliveries.iter().any(|d| d.status.is_failed()) {
            let accepted: Vec<(Uuid, HandlerEndpoint)> = deliveries
                .iter()
                .filter(|d| d.status == DeliveryStatus::Accepted)
                .map(|d| (d.sub_intent_id, d.endpoint.clone()))
                .collect();

            if !accepted.is_empty() {
                tracing::warn!(
                    accepted = accepted.len(),
                    "delivery failed, withdrawing accepted sibling sub-intents"
                );
                self.withdraw_all(&accepted).await;
                for delivery in deliveries.iter_mut() {
                    if delivery.status == DeliveryStatus::Accepted {
                        delivery.status = DeliveryStatus::Withdrawn;
                    }
                }
            }
        }

        DispatchOutcome { deliveries }
    }

    /// Deliver one sub-intent, retrying retryable failures within the budget.
    pub async fn deliver(&self, routed: &RoutedSubIntent) -> Delivery {
        let sub_intent = &routed.sub_intent;
        let endpoint = &routed.endpoint;
        let mut attempts = 0;

        let status = loop {
            attempts += 1;
            let result = tokio::time::timeout(
                self.timeout,
                self.transport.deliver(endpoint, sub_intent),
            )
            .await
            .unwrap_or_else(|_| {
                Err(DeliveryError::Timeout {
                    after_ms: self.timeout.as_millis() as u64,
                })
            });

            match result {
                Ok(Acceptance::Accepted) => break DeliveryStatus::Accepted,
                Ok(Acceptance::Rejected { reason }) | Err(DeliveryError::Rejected { reason }) => {
                    break DeliveryStatus::Rejected { reason };
                }
                Err(e) if e.is_retryable() && !self.retry.is_exhausted(attempts) => {
                    let delay = self.retry.delay_for(attempts - 1);
                    tracing::debug!(
                        sub_intent_id = %sub_intent.id,
                        target = %sub_intent.target,
                        attempt = attempts,
                        error = %e,
                        "retrying delivery"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    break DeliveryStatus::PermanentlyFailed {
                        reason: format!("{} (after {} attempts)", e, attempts),
                    };
                }
            }
        };

        match &status {
            DeliveryStatus::Accepted => tracing::info!(
                sub_intent_id = %sub_intent.id,
                target = %sub_intent.target,
                attempts,
                "sub-intent accepted"
            ),
            other => tracing::warn!(
                sub_intent_id = %sub_intent.id,
                target = %sub_intent.target,
                attempts,
                status = ?other,
                "sub-intent not accepted"
            ),
        }

        Delivery {
            sub_intent_id: sub_intent.id,
            endpoint: endpoint.clone(),
            status,
            attempts,
        }
    }

    /// Send one withdrawal notice per sub-intent, concurrently.
    ///
    /// Best effort: failures are logged, never retried. Returns how many
    /// handlers acknowledged.
    pub async fn withdraw_all(&self, sub_intents: &[(Uuid, HandlerEndpoint)]) -> usize {
        let calls = sub_intents.iter().map(|(id, endpoint)| async move {
            let result = tokio::time::timeout(self.timeout, self.transport.withdraw(endpoint, *id))
                .await
                .unwrap_or_else(|_| {
                    Err(DeliveryError::Timeout {
                        after_ms: self.timeout.as_millis() as u64,
                    })
                });
            match result {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(
                        sub_intent_id = %id,
                        target = %endpoint.target,
                        error = %e,
                        "withdrawal notice not delivered"
                    );
                    false
                }
            }
        });

        join_all(calls).await.into_iter().filter(|ok| *ok).count()
    }
}
