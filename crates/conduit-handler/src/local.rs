//! In-process delivery.

use std::sync::Arc;

use async_trait::async_trait;
use conduit_core::{Acceptance, DeliveryError, HandlerEndpoint, SubIntent};
use conduit_router::HandlerTransport;
use dashmap::DashMap;
use uuid::Uuid;

use crate::adapter::HandlerAdapter;

/// Delivers to adapters living in the same process, keyed by endpoint
/// address. Addresses without a local adapter go to the fallback transport.
#[derive(Default)]
pub struct LocalTransport {
    adapters: DashMap<String, Arc<dyn HandlerAdapter>>,
    fallback: Option<Arc<dyn HandlerTransport>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `address` with an in-process adapter.
    pub fn with_adapter(self, address: &str, adapter: Arc<dyn HandlerAdapter>) -> Self {
        self.adapters.insert(normalize(address), adapter);
        self
    }

    /// Send everything else through `transport`.
    pub fn with_fallback(mut self, transport: Arc<dyn HandlerTransport>) -> Self {
        self.fallback = Some(transport);
        self
    }

    fn adapter(&self, endpoint: &HandlerEndpoint) -> Option<Arc<dyn HandlerAdapter>> {
        self.adapters
            .get(&normalize(&endpoint.address))
            .map(|a| a.value().clone())
    }

    fn fallback(&self, endpoint: &HandlerEndpoint) -> Result<&Arc<dyn HandlerTransport>, DeliveryError> {
        self.fallback.as_ref().ok_or_else(|| {
            DeliveryError::Transport(format!("no handler at {}", endpoint.address))
        })
    }
}

fn normalize(address: &str) -> String {
    address.trim_end_matches('/').to_string()
}

#[async_trait]
impl HandlerTransport for LocalTransport {
    async fn deliver(
        &self,
        endpoint: &HandlerEndpoint,
        sub_intent: &SubIntent,
    ) -> Result<Acceptance, DeliveryError> {
        match self.adapter(endpoint) {
            Some(adapter) => adapter
                .accept(sub_intent.clone())
                .await
                .map_err(|e| DeliveryError::Transport(e.to_string())),
            None => self.fallback(endpoint)?.deliver(endpoint, sub_intent).await,
        }
    }

    async fn withdraw(
        &self,
        endpoint: &HandlerEndpoint,
        sub_intent_id: Uuid,
    ) -> Result<(), DeliveryError> {
        match self.adapter(endpoint) {
            Some(adapter) => {
                adapter.withdraw(sub_intent_id).await;
                Ok(())
            }
            None => self.fallback(endpoint)?.withdraw(endpoint, sub_intent_id).await,
        }
    }
}
