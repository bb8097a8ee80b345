//! Application state.

use std::sync::Arc;
use std::time::Duration;

use conduit_core::{
    ConduitError, HandlerEndpoint, Intent, IntentId, RouteError, StatePrecedence,
};
use conduit_handler::{
    ChannelEmitter, ForwardingAdapter, HandlerAdapter, HandlerRole, LocalTransport,
    ReferenceAdapter, ReferenceConfig, StaticExecutor,
};
use conduit_router::{Dispatcher, EndpointResolver, HandlerTransport, IntentRouter, RoutedSubIntent};
use conduit_sdk::HttpHandlerTransport;
use conduit_twin::{HttpTwinStore, InMemoryTwinStore, TwinStore};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::aggregator::{spawn_report_pump, Aggregator};
use crate::config::{NodeConfig, TwinKind};
use crate::registry::{IntentState, IntentView, Registry, RegistryError, SubIntentView};
use crate::sinks::{OwnerSink, ReportSink, TwinSink};

/// Pluggable parts of the node.
pub struct Components {
    pub twin: Arc<dyn TwinStore>,
    pub transport: Arc<dyn HandlerTransport>,
    pub owner_sink: Arc<dyn ReportSink>,
    /// Handler served under `/api/v1/subintents`, if any.
    pub handler: Option<Arc<dyn HandlerAdapter>>,
}

/// An accepted submission.
#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub id: IntentId,
    pub version: u32,
    pub content_hash: String,
    pub sub_intents: Vec<SubIntentView>,
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Accepted intents and their sub-intents.
    pub registry: Arc<Registry>,

    pub router: Arc<IntentRouter>,

    pub dispatcher: Arc<Dispatcher>,

    pub twin: Arc<dyn TwinStore>,

    pub aggregator: Aggregator,

    /// Ordering used to aggregate sub-intent states.
    pub precedence: Arc<StatePrecedence>,

    /// Handler hosted by this node.
    pub handler: Option<Arc<dyn HandlerAdapter>>,

    /// Ids of intents whose aggregated state may have changed.
    pub updates: broadcast::Sender<IntentId>,
}

impl AppState {
    /// Wire the node together from its components.
    pub fn new(config: &NodeConfig, components: Components) -> Self {
        let registry = Arc::new(Registry::new());
        let (updates, _) = broadcast::channel(256);

        let resolver = Arc::new(EndpointResolver::new(components.twin.clone(), &config.resolver));
        let twin_sink: Arc<dyn ReportSink> = Arc::new(TwinSink::new(components.twin.clone()));
        let aggregator = Aggregator::new(
            config.aggregator.clone(),
            registry.clone(),
            components.owner_sink,
            twin_sink,
            updates.clone(),
        );

        Self {
            registry,
            router: Arc::new(IntentRouter::new(resolver)),
            dispatcher: Arc::new(Dispatcher::new(components.transport, &config.dispatch)),
            twin: components.twin,
            aggregator,
            precedence: Arc::new(config.precedence.clone()),
            handler: components.handler,
            updates,
        }
    }

    /// Build the node described by `config`.
    pub async fn from_config(config: &NodeConfig) -> anyhow::Result<Self> {
        let twin: Arc<dyn TwinStore> = match config.twin.kind {
            TwinKind::Memory => Arc::new(InMemoryTwinStore::new()),
            TwinKind::Http => {
                let url = config.twin.url.as_deref().ok_or_else(|| {
                    ConduitError::Config("twin.url is required for an http twin store".to_string())
                })?;
                Arc::new(HttpTwinStore::new(url, Duration::from_millis(config.resolver.timeout_ms))?)
            }
        };
        for endpoint in &config.endpoints {
            twin.register_endpoint(endpoint.clone()).await?;
            tracing::info!(target = %endpoint.target, address = %endpoint.address, "endpoint registered");
        }

        let timeout = Duration::from_millis(config.dispatch.timeout_ms);
        let http: Arc<dyn HandlerTransport> = Arc::new(HttpHandlerTransport::with_timeout(timeout)?);
        let mut transport = LocalTransport::new().with_fallback(http.clone());

        let settings = &config.handler;
        let (emitter, reports) = ChannelEmitter::new(config.aggregator.queue_capacity);
        let handler: Option<Arc<dyn HandlerAdapter>> = if settings.enabled {
            let adapter: Arc<dyn HandlerAdapter> = match settings.role {
                HandlerRole::Leaf => {
                    let mut reference = ReferenceConfig::new(settings.target.clone(), settings.capability);
                    reference.progress_delay = Duration::from_millis(settings.progress_delay_ms);
                    Arc::new(ReferenceAdapter::new(
                        reference,
                        twin.clone(),
                        Arc::new(StaticExecutor::new(settings.samples.clone())),
                        Arc::new(emitter),
                    ))
                }
                HandlerRole::Forwarding => {
                    let downstream = settings.downstream.clone().ok_or_else(|| {
                        ConduitError::Config("handler.downstream is required".to_string())
                    })?;
                    Arc::new(ForwardingAdapter::new(
                        HandlerEndpoint::new(settings.target.clone(), downstream, settings.capability),
                        http.clone(),
                    ))
                }
            };

            let address = config.handler_address();
            twin.register_endpoint(HandlerEndpoint::new(
                settings.target.clone(),
                address.clone(),
                settings.capability,
            ))
            .await?;
            transport = transport.with_adapter(&address, adapter.clone());
            tracing::info!(target = %settings.target, %address, role = ?settings.role, "hosting handler");
            Some(adapter)
        } else {
            None
        };

        let owner_sink = OwnerSink::new(config.owners.clone(), config.default_owner_url.clone(), timeout)?;
        let state = Self::new(
            config,
            Components {
                twin,
                transport: Arc::new(transport),
                owner_sink: Arc::new(owner_sink),
                handler,
            },
        );
        spawn_report_pump(state.aggregator.clone(), reports);
        Ok(state)
    }

    /// Route an intent and record it as the next version.
    ///
    /// Dispatch continues in the background.
    pub async fn submit(&self, intent: Intent) -> Result<Submission, RouteError> {
        let id = intent.id.clone();
        let content_hash = intent.content_hash();
        let version = self.registry.reserve_version(&id);
        let routed = match self.router.route(&intent, version).await {
            Ok(routed) => routed,
            Err(e) => {
                self.registry.release_version(&id, version);
                return Err(e);
            }
        };

        let superseded = self.registry.register(intent, version, &routed);
        let submission = Submission {
            id: id.clone(),
            version,
            content_hash,
            sub_intents: routed.iter().map(SubIntentView::from).collect(),
        };
        tracing::info!(
            intent_id = %id,
            version,
            sub_intents = routed.len(),
            superseded = superseded.len(),
            "intent accepted"
        );

        let state = self.clone();
        tokio::spawn(async move { state.deliver(id, routed, superseded).await });

        Ok(submission)
    }

    async fn deliver(
        &self,
        id: IntentId,
        routed: Vec<RoutedSubIntent>,
        superseded: Vec<(Uuid, HandlerEndpoint)>,
    ) {
        if !superseded.is_empty() {
            self.dispatcher.withdraw_all(&superseded).await;
        }

        let outcome = self.dispatcher.dispatch(&routed).await;
        let late = self.registry.apply_outcome(&outcome);
        if !late.is_empty() {
            tracing::info!(intent_id = %id, count = late.len(), "withdrawing sub-intents accepted after withdrawal");
            self.dispatcher.withdraw_all(&late).await;
        }
        if !outcome.all_accepted() {
            tracing::warn!(intent_id = %id, failed = outcome.failed().count(), "intent not fully delivered");
        }
        let _ = self.updates.send(id);
    }

    /// Withdraw an intent, notifying every handler that holds one of its
    /// sub-intents. Returns the number of notices sent.
    pub async fn withdraw(&self, id: &IntentId) -> Result<usize, RegistryError> {
        let notices = self.registry.withdraw(id)?;
        let acknowledged = self.dispatcher.withdraw_all(&notices).await;
        tracing::info!(intent_id = %id, notices = notices.len(), acknowledged, "intent withdrawn");
        let _ = self.updates.send(id.clone());
        Ok(notices.len())
    }

    /// Current version and aggregated state of an intent.
    pub fn status(&self, id: &IntentId) -> Option<(u32, IntentState)> {
        self.registry.status(id, &self.precedence)
    }

    pub fn view(&self, id: &IntentId) -> Option<IntentView> {
        self.registry.view(id, &self.precedence)
    }

    pub fn views(&self) -> Vec<IntentView> {
        self.registry.views(&self.precedence)
    }
}
