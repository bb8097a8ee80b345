//! Delivery channel towards handlers.

use async_trait::async_trait;
use conduit_core::{Acceptance, DeliveryError, HandlerEndpoint, SubIntent};
use uuid::Uuid;

/// Carries sub-intents and withdrawal notices to handler endpoints.
///
/// Implementations must send the sub-intent id as the idempotency key so
/// retried deliveries are no-ops on the handler side.
#[async_trait]
pub trait HandlerTransport: Send + Sync {
    /// Deliver one sub-intent and return the handler's answer.
    ///
    /// An explicit refusal is `Ok(Acceptance::Rejected)`, not an error.
    async fn deliver(
        &self,
        endpoint: &HandlerEndpoint,
        sub_intent: &SubIntent,
    ) -> Result<Acceptance, DeliveryError>;

    /// Tell the handler to stop realizing a sub-intent.
    async fn withdraw(
        &self,
        endpoint: &HandlerEndpoint,
        sub_intent_id: Uuid,
    ) -> Result<(), DeliveryError>;
}
