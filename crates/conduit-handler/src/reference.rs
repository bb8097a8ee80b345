//! Reference leaf adapter.
//!
//! Accepts sub-intents it has the capability for, persists them to the twin
//! store, then realizes them in the background: a `Received` report, one
//! observation per sampled condition, and a terminal `Compliant` or
//! `Degraded` decided by evaluating the condition trees.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conduit_core::{
    Acceptance, Capability, ConduitError, LifecycleState, Quantity, Report, RetryPolicy,
    SubIntent, TargetId,
};
use conduit_twin::{TwinRecord, TwinStore};
use uuid::Uuid;

use crate::adapter::{HandlerAdapter, HandlerRole};
use crate::emitter::ReportEmitter;
use crate::session::{AdapterSessions, Claim};

/// Backend that actually realizes sub-intents.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Realize the sub-intent. `Err` carries the reason it failed.
    async fn realize(&self, sub_intent: &SubIntent) -> Result<(), String>;

    /// Sample the metrics the sub-intent's conditions refer to.
    async fn observe(&self, sub_intent: &SubIntent) -> HashMap<String, Quantity>;

    /// Tear down whatever `realize` set up.
    async fn release(&self, _sub_intent_id: Uuid) {}
}

/// Executor that realizes instantly and reports fixed samples.
#[derive(Debug, Clone, Default)]
pub struct StaticExecutor {
    samples: HashMap<String, Quantity>,
}

impl StaticExecutor {
    /// Report `samples` for every sub-intent.
    pub fn new(samples: HashMap<String, Quantity>) -> Self {
        Self { samples }
    }

    /// Add one sample.
    pub fn with_sample(mut self, metric: impl Into<String>, value: impl Into<Quantity>) -> Self {
        self.samples.insert(metric.into(), value.into());
        self
    }
}

#[async_trait]
impl Executor for StaticExecutor {
    async fn realize(&self, _sub_intent: &SubIntent) -> Result<(), String> {
        Ok(())
    }

    async fn observe(&self, sub_intent: &SubIntent) -> HashMap<String, Quantity> {
        let wanted: Vec<&str> = sub_intent
            .routed_expectations()
            .flat_map(|e| e.conditions.metrics())
            .collect();
        self.samples
            .iter()
            .filter(|(metric, _)| wanted.contains(&metric.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Configuration for the reference adapter.
#[derive(Debug, Clone)]
pub struct ReferenceConfig {
    /// The target this handler serves.
    pub target: TargetId,

    /// Reporter identity stamped on every report.
    pub identity: String,

    pub capability: Capability,

    /// Pause between `Received` and realization.
    pub progress_delay: Duration,

    /// Retry budget for emitting one report.
    pub report_retry: RetryPolicy,
}

impl ReferenceConfig {
    pub fn new(target: impl Into<TargetId>, capability: Capability) -> Self {
        let target = target.into();
        Self {
            identity: format!("handler/{}", target),
            target,
            capability,
            progress_delay: Duration::ZERO,
            report_retry: RetryPolicy::default(),
        }
    }
}

/// State shared between the adapter and its progress tasks.
struct Progress {
    config: ReferenceConfig,
    executor: Arc<dyn Executor>,
    emitter: Arc<dyn ReportEmitter>,
    sessions: AdapterSessions,
}

/// Leaf handler adapter.
pub struct ReferenceAdapter {
    progress: Arc<Progress>,
    twin: Arc<dyn TwinStore>,
}

impl ReferenceAdapter {
    /// Create a reference adapter.
    pub fn new(
        config: ReferenceConfig,
        twin: Arc<dyn TwinStore>,
        executor: Arc<dyn Executor>,
        emitter: Arc<dyn ReportEmitter>,
    ) -> Self {
        Self {
            progress: Arc::new(Progress {
                config,
                executor,
                emitter,
                sessions: AdapterSessions::new(),
            }),
            twin,
        }
    }

    /// The session table.
    pub fn sessions(&self) -> &AdapterSessions {
        &self.progress.sessions
    }

    /// Adapter configuration.
    pub fn config(&self) -> &ReferenceConfig {
        &self.progress.config
    }

    fn refusal(&self, sub_intent: &SubIntent) -> Option<String> {
        let config = &self.progress.config;
        if sub_intent.target != config.target {
            return Some(format!(
                "handler serves {}, not {}",
                config.target, sub_intent.target
            ));
        }
        sub_intent
            .routed_expectations()
            .find(|e| !config.capability.supports(&e.kind))
            .map(|e| {
                format!(
                    "cannot execute {} expectation {}",
                    e.kind.label(),
                    e.id
                )
            })
    }
}

#[async_trait]
impl HandlerAdapter for ReferenceAdapter {
    fn role(&self) -> HandlerRole {
        HandlerRole::Leaf
    }

    fn capability(&self) -> Capability {
        self.progress.config.capability
    }

    async fn accept(&self, sub_intent: SubIntent) -> Result<Acceptance, ConduitError> {
        let id = sub_intent.id;
        let sessions = &self.progress.sessions;

        match sessions.claim(id).await {
            Claim::Known(acceptance) => {
                tracing::debug!(sub_intent_id = %id, "repeated delivery");
                return Ok(acceptance);
            }
            Claim::Pending => {
                return Err(ConduitError::Connection(format!(
                    "sub-intent {} is still being accepted",
                    id
                )));
            }
            Claim::Fresh => {}
        }

        if let Some(reason) = self.refusal(&sub_intent) {
            tracing::info!(sub_intent_id = %id, reason = %reason, "sub-intent rejected");
            let acceptance = Acceptance::Rejected { reason };
            sessions.settle(id, acceptance.clone()).await;
            return Ok(acceptance);
        }

        let record = TwinRecord::SubIntent {
            sub_intent: sub_intent.clone(),
            handler: self.progress.config.identity.clone(),
        };
        if let Err(e) = self.twin.append(record).await {
            tracing::warn!(sub_intent_id = %id, error = %e, "could not persist sub-intent");
            sessions.release(id).await;
            return Err(e.into());
        }

        sessions.settle(id, Acceptance::Accepted).await;
        let task = tokio::spawn(realize(self.progress.clone(), sub_intent));
        sessions.attach(id, task).await;

        tracing::info!(sub_intent_id = %id, target = %self.progress.config.target, "sub-intent accepted");
        Ok(Acceptance::Accepted)
    }

    async fn withdraw(&self, sub_intent_id: Uuid) -> Option<bool> {
        let changed = self.progress.sessions.withdraw(sub_intent_id).await?;
        if changed {
            self.progress.executor.release(sub_intent_id).await;
            self.progress
                .report(sub_intent_id, None, |id, seq| {
                    Report::state(id, seq, LifecycleState::Finalizing)
                })
                .await;
            tracing::info!(sub_intent_id = %sub_intent_id, "sub-intent withdrawn");
        }
        Some(changed)
    }
}

impl Progress {
    /// Build a report with the next sequence number and emit it, retrying per policy.
    async fn report(
        &self,
        sub_intent_id: Uuid,
        intent: Option<&SubIntent>,
        build: impl FnOnce(Uuid, u64) -> Report,
    ) {
        let Some(sequence) = self.sessions.next_sequence(sub_intent_id).await else {
            return;
        };
        let mut report = build(sub_intent_id, sequence).from_reporter(self.config.identity.clone());
        if let Some(sub) = intent {
            report = report.for_intent(sub.parent_id.clone());
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.emitter.emit(report.clone()).await {
                Ok(()) => return,
                Err(e) if !self.config.report_retry.is_exhausted(attempts) => {
                    tracing::debug!(sub_intent_id = %sub_intent_id, seq = sequence, error = %e, "retrying report");
                    tokio::time::sleep(self.config.report_retry.delay_for(attempts - 1)).await;
                }
                Err(e) => {
                    tracing::warn!(sub_intent_id = %sub_intent_id, seq = sequence, error = %e, "report lost");
                    return;
                }
            }
        }
    }
}

/// Background realization of one accepted sub-intent.
async fn realize(progress: Arc<Progress>, sub_intent: SubIntent) {
    let id = sub_intent.id;
    let sub = Some(&sub_intent);

    progress
        .report(id, sub, |id, seq| Report::state(id, seq, LifecycleState::Received))
        .await;

    if !progress.config.progress_delay.is_zero() {
        tokio::time::sleep(progress.config.progress_delay).await;
    }

    if let Err(reason) = progress.executor.realize(&sub_intent).await {
        progress
            .report(id, sub, |id, seq| {
                Report::state(id, seq, LifecycleState::Degraded).with_reason(reason)
            })
            .await;
        progress.sessions.finish(id, LifecycleState::Degraded).await;
        return;
    }

    let samples = progress.executor.observe(&sub_intent).await;
    for expectation in sub_intent.routed_expectations() {
        for (_, condition) in expectation.conditions.iter() {
            let Some(value) = condition.metric.as_ref().and_then(|m| samples.get(m)) else {
                continue;
            };
            let value = value.clone();
            let unit = condition.unit.clone();
            progress
                .report(id, sub, |id, seq| {
                    let report = Report::observation(id, seq, condition.id.clone(), value);
                    match unit {
                        Some(unit) => report.with_unit(unit),
                        None => report,
                    }
                })
                .await;
        }
    }

    let (state, reason) = assess(&sub_intent, &samples);
    progress
        .report(id, sub, |id, seq| {
            let report = Report::state(id, seq, state);
            match reason {
                Some(reason) => report.with_reason(reason),
                None => report,
            }
        })
        .await;
    progress.sessions.finish(id, state).await;
}

/// Compliant only if every routed expectation's conditions hold.
fn assess(
    sub_intent: &SubIntent,
    samples: &HashMap<String, Quantity>,
) -> (LifecycleState, Option<String>) {
    for expectation in sub_intent.routed_expectations() {
        match expectation.conditions.evaluate(samples) {
            Some(true) => {}
            Some(false) => {
                return (
                    LifecycleState::Degraded,
                    Some(format!("conditions of {} not met", expectation.id)),
                )
            }
            None => {
                return (
                    LifecycleState::Degraded,
                    Some(format!("conditions of {} could not be observed", expectation.id)),
                )
            }
        }
    }
    (LifecycleState::Compliant, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::ChannelEmitter;
    use crate::session::SessionState;
    use conduit_core::{
        Condition, ConditionTree, Expectation, ExpectationKind, Intent, Operator, ReportBody,
    };
    use conduit_twin::InMemoryTwinStore;
    use tokio::sync::mpsc;

    fn sub_intent(target: &str, threshold: f64) -> SubIntent {
        let mut conditions = ConditionTree::new();
        conditions.push_root(
            Condition::compare("co1", "p99-latency", Operator::Smaller, threshold).unit("ms"),
        );
        let intent = Intent::builder()
            .id("I1")
            .expectation(Expectation::workload("de1", target).conditions(conditions))
            .expectation(Expectation::reporting("re1"))
            .build()
            .unwrap();
        SubIntent::project(
            &intent,
            1,
            &ExpectationKind::WorkloadDeployment,
            &TargetId::new(target),
        )
    }

    fn adapter(
        twin: &InMemoryTwinStore,
        executor: StaticExecutor,
        delay: Duration,
    ) -> (ReferenceAdapter, mpsc::Receiver<Report>) {
        let (emitter, rx) = ChannelEmitter::new(64);
        let mut config = ReferenceConfig::new("EC21", Capability::Workload);
        config.progress_delay = delay;
        let adapter =
            ReferenceAdapter::new(config, Arc::new(twin.clone()), Arc::new(executor), Arc::new(emitter));
        (adapter, rx)
    }

    async fn drain_until_terminal(rx: &mut mpsc::Receiver<Report>) -> Vec<Report> {
        let mut reports = Vec::new();
        while let Some(report) = rx.recv().await {
            let terminal = report.lifecycle_state().map(|s| s.is_terminal()).unwrap_or(false);
            reports.push(report);
            if terminal {
                break;
            }
        }
        reports
    }

    #[tokio::test]
    async fn test_accept_persists_and_reports_compliant() {
        let twin = InMemoryTwinStore::new();
        let (adapter, mut rx) = adapter(
            &twin,
            StaticExecutor::default().with_sample("p99-latency", 12.0),
            Duration::ZERO,
        );
        let sub = sub_intent("EC21", 20.0);

        assert_eq!(adapter.accept(sub.clone()).await.unwrap(), Acceptance::Accepted);
        assert_eq!(adapter.role(), HandlerRole::Leaf);

        let reports = drain_until_terminal(&mut rx).await;
        let sequences: Vec<u64> = reports.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(reports[0].lifecycle_state(), Some(LifecycleState::Received));
        assert!(matches!(&reports[1].body, ReportBody::Observation(o) if o.condition_id == "co1"));
        assert_eq!(reports[2].lifecycle_state(), Some(LifecycleState::Compliant));
        assert!(reports.iter().all(|r| r.intent_id.as_ref().map(|i| i.as_str()) == Some("I1")));

        let records = twin.records_for(&sub.parent_id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(matches!(records[0].record, TwinRecord::SubIntent { .. }));
    }

    #[tokio::test]
    async fn test_condition_violation_reports_degraded() {
        let twin = InMemoryTwinStore::new();
        let (adapter, mut rx) = adapter(
            &twin,
            StaticExecutor::default().with_sample("p99-latency", 35.0),
            Duration::ZERO,
        );

        adapter.accept(sub_intent("EC21", 20.0)).await.unwrap();
        let reports = drain_until_terminal(&mut rx).await;
        assert_eq!(
            reports.last().and_then(|r| r.lifecycle_state()),
            Some(LifecycleState::Degraded)
        );
    }

    #[tokio::test]
    async fn test_repeated_delivery_is_a_no_op() {
        let twin = InMemoryTwinStore::new();
        let (adapter, _rx) = adapter(&twin, StaticExecutor::default(), Duration::from_secs(60));
        let sub = sub_intent("EC21", 20.0);

        adapter.accept(sub.clone()).await.unwrap();
        adapter.accept(sub.clone()).await.unwrap();
        adapter.accept(sub).await.unwrap();

        assert_eq!(twin.len().await, 1);
        assert_eq!(adapter.sessions().len().await, 1);
    }

    #[tokio::test]
    async fn test_rejects_other_targets_and_kinds() {
        let twin = InMemoryTwinStore::new();
        let (adapter, _rx) = adapter(&twin, StaticExecutor::default(), Duration::ZERO);

        let answer = adapter.accept(sub_intent("EC22", 20.0)).await.unwrap();
        assert!(!answer.is_accepted());

        let intent = Intent::builder()
            .id("I2")
            .expectation(Expectation::network("ne1", "EC21"))
            .build()
            .unwrap();
        let network = SubIntent::project(
            &intent,
            1,
            &ExpectationKind::NetworkConfiguration,
            &TargetId::new("EC21"),
        );
        assert!(!adapter.accept(network).await.unwrap().is_accepted());
        assert!(twin.is_empty().await);
    }

    #[tokio::test]
    async fn test_twin_outage_is_retryable() {
        let twin = InMemoryTwinStore::new();
        twin.set_offline(true);
        let (adapter, _rx) = adapter(&twin, StaticExecutor::default(), Duration::ZERO);
        let sub = sub_intent("EC21", 20.0);

        let err = adapter.accept(sub.clone()).await.unwrap_err();
        assert!(err.is_recoverable());

        twin.set_offline(false);
        assert!(adapter.accept(sub).await.unwrap().is_accepted());
    }

    #[tokio::test]
    async fn test_withdraw_aborts_progress_and_finalizes() {
        let twin = InMemoryTwinStore::new();
        let (adapter, mut rx) = adapter(&twin, StaticExecutor::default(), Duration::from_secs(60));
        let sub = sub_intent("EC21", 20.0);

        adapter.accept(sub.clone()).await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.lifecycle_state(), Some(LifecycleState::Received));

        assert_eq!(adapter.withdraw(sub.id).await, Some(true));
        let finalizing = rx.recv().await.unwrap();
        assert_eq!(finalizing.lifecycle_state(), Some(LifecycleState::Finalizing));
        assert!(finalizing.sequence > received.sequence);

        assert_eq!(adapter.withdraw(sub.id).await, Some(false));
        assert_eq!(adapter.withdraw(Uuid::new_v4()).await, None);
        assert_eq!(adapter.sessions().state(sub.id).await, Some(SessionState::Withdrawn));
    }
}
