//! Test fixtures shared by the node's test modules.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use conduit_core::{
    Capability, ConduitError, Expectation, ExpectationKind, HandlerEndpoint, Intent,
    ReportEnvelope, SubIntent, TargetId,
};
use conduit_router::RoutedSubIntent;
use uuid::Uuid;

use crate::registry::Registry;
use crate::sinks::ReportSink;

/// A registry holding intent `I1` with one workload sub-intent on `EC21`.
pub fn registry_with_sub_intent() -> (Registry, Uuid) {
    let intent = Intent::builder()
        .id("I1")
        .owner("ops")
        .expectation(Expectation::workload("de1", "EC21"))
        .build()
        .expect("valid intent");
    let target = TargetId::new("EC21");
    let registry = Registry::new();
    let version = registry.reserve_version(&intent.id);
    let routed = vec![RoutedSubIntent {
        sub_intent: SubIntent::project(&intent, version, &ExpectationKind::WorkloadDeployment, &target),
        endpoint: HandlerEndpoint::new(target, "http://ec21", Capability::Workload),
    }];
    registry.register(intent, version, &routed);
    (registry, routed[0].sub_intent.id)
}

/// Sink that records what it receives and can fail on demand.
#[derive(Default)]
pub struct RecordingSink {
    received: Mutex<Vec<ReportEnvelope>>,
    failures: AtomicUsize,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` deliveries.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn received(&self) -> Vec<ReportEnvelope> {
        self.received.lock().expect("sink lock").clone()
    }

    pub fn sequences(&self) -> Vec<u64> {
        self.received().iter().map(|e| e.report.sequence).collect()
    }

    /// Wait until at least `n` envelopes arrived.
    pub async fn wait_for(&self, n: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.received().len() < n {
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected {} reports, got {}",
                n,
                self.received().len()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl ReportSink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn deliver(&self, envelope: &ReportEnvelope) -> Result<(), ConduitError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ConduitError::Connection("sink unavailable".to_string()));
        }
        self.received.lock().expect("sink lock").push(envelope.clone());
        Ok(())
    }
}
