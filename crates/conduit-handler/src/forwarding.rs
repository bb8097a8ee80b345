//! Forwarding (non-leaf) adapter.

use std::sync::Arc;

use async_trait::async_trait;
use conduit_core::{Acceptance, Capability, ConduitError, HandlerEndpoint, SubIntent};
use conduit_router::HandlerTransport;
use uuid::Uuid;

use crate::adapter::{HandlerAdapter, HandlerRole};
use crate::session::{AdapterSessions, Claim};

/// Hands sub-intents on to a downstream handler and relays its answer.
///
/// Persistence is the downstream leaf's job, so nothing is written to the
/// twin store here.
pub struct ForwardingAdapter {
    downstream: HandlerEndpoint,
    transport: Arc<dyn HandlerTransport>,
    sessions: AdapterSessions,
}

impl ForwardingAdapter {
    pub fn new(downstream: HandlerEndpoint, transport: Arc<dyn HandlerTransport>) -> Self {
        Self {
            downstream,
            transport,
            sessions: AdapterSessions::new(),
        }
    }

    /// The session table.
    pub fn sessions(&self) -> &AdapterSessions {
        &self.sessions
    }
}

#[async_trait]
impl HandlerAdapter for ForwardingAdapter {
    fn role(&self) -> HandlerRole {
        HandlerRole::Forwarding
    }

    fn capability(&self) -> Capability {
        self.downstream.capability
    }

    async fn accept(&self, sub_intent: SubIntent) -> Result<Acceptance, ConduitError> {
        let id = sub_intent.id;
        match self.sessions.claim(id).await {
            Claim::Known(acceptance) => return Ok(acceptance),
            Claim::Pending => {
                return Err(ConduitError::Connection(format!(
                    "sub-intent {} is still being forwarded",
                    id
                )))
            }
            Claim::Fresh => {}
        }

        match self.transport.deliver(&self.downstream, &sub_intent).await {
            Ok(acceptance) => {
                tracing::info!(
                    sub_intent_id = %id,
                    downstream = %self.downstream.address,
                    accepted = acceptance.is_accepted(),
                    "sub-intent forwarded"
                );
                self.sessions.settle(id, acceptance.clone()).await;
                Ok(acceptance)
            }
            Err(e) => {
                self.sessions.release(id).await;
                Err(e.into())
            }
        }
    }

    async fn withdraw(&self, sub_intent_id: Uuid) -> Option<bool> {
        let changed = self.sessions.withdraw(sub_intent_id).await?;
        if changed {
            if let Err(e) = self.transport.withdraw(&self.downstream, sub_intent_id).await {
                tracing::warn!(
                    sub_intent_id = %sub_intent_id,
                    downstream = %self.downstream.address,
                    error = %e,
                    "withdrawal not forwarded"
                );
            }
        }
        Some(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::ChannelEmitter;
    use crate::local::LocalTransport;
    use crate::reference::{ReferenceAdapter, ReferenceConfig, StaticExecutor};
    use conduit_core::{Expectation, ExpectationKind, Intent, TargetId};
    use conduit_twin::{InMemoryTwinStore, TwinStore};

    #[tokio::test]
    async fn test_forwards_to_leaf_without_persisting_twice() {
        let twin = InMemoryTwinStore::new();
        let (emitter, _rx) = ChannelEmitter::new(16);
        let leaf = ReferenceAdapter::new(
            ReferenceConfig::new("EC21", Capability::Workload),
            Arc::new(twin.clone()),
            Arc::new(StaticExecutor::default()),
            Arc::new(emitter),
        );
        let downstream = HandlerEndpoint::new("EC21", "local://ec21", Capability::Workload);
        let transport = LocalTransport::new().with_adapter(&downstream.address, Arc::new(leaf));
        let forwarder = ForwardingAdapter::new(downstream, Arc::new(transport));

        let intent = Intent::builder()
            .id("I1")
            .expectation(Expectation::workload("de1", "EC21"))
            .build()
            .unwrap();
        let sub = SubIntent::project(
            &intent,
            1,
            &ExpectationKind::WorkloadDeployment,
            &TargetId::new("EC21"),
        );

        assert!(forwarder.accept(sub.clone()).await.unwrap().is_accepted());
        assert!(forwarder.accept(sub.clone()).await.unwrap().is_accepted());
        assert_eq!(forwarder.role(), HandlerRole::Forwarding);
        assert!(!forwarder.role().persists());

        let records = twin.records_for(&intent.id).await.unwrap();
        assert_eq!(records.len(), 1);

        assert_eq!(forwarder.withdraw(sub.id).await, Some(true));
    }
}
