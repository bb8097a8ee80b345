//! Report aggregation.
//!
//! Every sub-intent gets a lane: a task owning a small reorder buffer.
//! Reports that arrive in sequence are forwarded at once; a report ahead of
//! a gap waits until the gap fills or the reorder window expires, then the
//! buffer is flushed in sequence order. Each lane feeds two sink workers
//! (owner and twin) that retry their head report until it is delivered, so
//! a slow sink never blocks intake and never reorders a sub-intent's
//! reports. Lanes retire after a period without reports; the sink workers
//! of a restarted lane wait until their predecessors have drained.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use conduit_core::{IntentId, Report, ReportEnvelope, ReportValidationError, RetryPolicy};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::registry::{Registry, ReportRoute};
use crate::sinks::ReportSink;

/// Aggregator tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Pending reports per sub-intent lane.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How long an out-of-order report waits for the gap before it.
    #[serde(default = "default_reorder_window_ms")]
    pub reorder_window_ms: u64,

    /// Idle time after which a lane shuts down.
    #[serde(default = "default_lane_idle_secs")]
    pub lane_idle_secs: u64,

    /// Backoff for sink deliveries. Unbounded unless configured.
    #[serde(default = "RetryPolicy::unbounded")]
    pub sink_retry: RetryPolicy,
}

fn default_queue_capacity() -> usize {
    256
}
fn default_reorder_window_ms() -> u64 {
    200
}
fn default_lane_idle_secs() -> u64 {
    60
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            reorder_window_ms: default_reorder_window_ms(),
            lane_idle_secs: default_lane_idle_secs(),
            sink_retry: RetryPolicy::unbounded(),
        }
    }
}

/// Outcome of submitting a report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intake {
    /// Accepted for forwarding.
    Queued,
    /// Discarded without effect.
    Dropped(ReportValidationError),
}

struct LaneMessage {
    report: Report,
    reply: oneshot::Sender<Intake>,
}

struct LaneHandle {
    tx: mpsc::Sender<LaneMessage>,
    generation: u64,
}

/// Completion signal of the latest sink worker for one (sub-intent, sink).
struct Baton {
    generation: u64,
    done: oneshot::Receiver<()>,
}

/// A sink worker's place in line: it starts once `previous` resolves and
/// releases its successor by dropping `done`.
struct SinkTurn {
    previous: Option<oneshot::Receiver<()>>,
    done: oneshot::Sender<()>,
}

const OWNER_SINK: usize = 0;
const TWIN_SINK: usize = 1;

struct Shared {
    config: AggregatorConfig,
    registry: Arc<Registry>,
    owner: Arc<dyn ReportSink>,
    twin: Arc<dyn ReportSink>,
    lanes: DashMap<Uuid, LaneHandle>,
    batons: DashMap<(Uuid, usize), Baton>,
    generation: AtomicU64,
    updates: broadcast::Sender<IntentId>,
}

impl Shared {
    fn take_turn(&self, sub_intent_id: Uuid, sink: usize, generation: u64) -> SinkTurn {
        let (done, rx) = oneshot::channel();
        let previous = self
            .batons
            .insert((sub_intent_id, sink), Baton { generation, done: rx })
            .map(|baton| baton.done);
        SinkTurn { previous, done }
    }
}

/// Validates reports and forwards them, in order, to the owner and the twin store.
#[derive(Clone)]
pub struct Aggregator {
    shared: Arc<Shared>,
}

impl Aggregator {
    pub fn new(
        config: AggregatorConfig,
        registry: Arc<Registry>,
        owner: Arc<dyn ReportSink>,
        twin: Arc<dyn ReportSink>,
        updates: broadcast::Sender<IntentId>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                registry,
                owner,
                twin,
                lanes: DashMap::new(),
                batons: DashMap::new(),
                generation: AtomicU64::new(0),
                updates,
            }),
        }
    }

    /// Validate and enqueue a report.
    ///
    /// Waits for lane capacity when the lane is full.
    pub async fn submit(&self, report: Report) -> Intake {
        let sub_intent_id = report.sub_intent_id;
        let route = self.shared.registry.report_route(sub_intent_id);
        let Some(route) = route else {
            tracing::warn!(sub_intent_id = %sub_intent_id, seq = report.sequence, "report for unknown sub-intent dropped");
            return Intake::Dropped(ReportValidationError::UnknownSubIntent(sub_intent_id));
        };

        loop {
            let (tx, generation) = self.lane(sub_intent_id, &route);
            let (reply, answer) = oneshot::channel();
            let message = LaneMessage {
                report: report.clone(),
                reply,
            };
            if tx.send(message).await.is_ok() {
                if let Ok(intake) = answer.await {
                    return intake;
                }
            }
            // The lane retired between lookup and send.
            self.shared
                .lanes
                .remove_if(&sub_intent_id, |_, lane| lane.generation == generation);
        }
    }

    /// Number of running lanes.
    pub fn lane_count(&self) -> usize {
        self.shared.lanes.len()
    }

    fn lane(&self, sub_intent_id: Uuid, route: &ReportRoute) -> (mpsc::Sender<LaneMessage>, u64) {
        let lane = self.shared.lanes.entry(sub_intent_id).or_insert_with(|| {
            let generation = self.shared.generation.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = mpsc::channel(self.shared.config.queue_capacity);
            let turns = [OWNER_SINK, TWIN_SINK].map(|sink| self.shared.take_turn(sub_intent_id, sink, generation));
            tokio::spawn(run_lane(
                self.shared.clone(),
                sub_intent_id,
                generation,
                route.clone(),
                rx,
                turns,
            ));
            tracing::debug!(sub_intent_id = %sub_intent_id, generation, "report lane started");
            LaneHandle { tx, generation }
        });
        (lane.tx.clone(), lane.generation)
    }
}

/// Feed reports from an in-process handler into the aggregator.
pub fn spawn_report_pump(aggregator: Aggregator, mut reports: mpsc::Receiver<Report>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(report) = reports.recv().await {
            if let Intake::Dropped(reason) = aggregator.submit(report).await {
                tracing::debug!(%reason, "local report dropped");
            }
        }
    })
}

/// Reorder buffer of one lane.
struct Reorder {
    last: Option<u64>,
    pending: BTreeMap<u64, (Report, DateTime<Utc>)>,
    oldest: Option<Instant>,
}

impl Reorder {
    fn new(last: Option<u64>) -> Self {
        Self {
            last,
            pending: BTreeMap::new(),
            oldest: None,
        }
    }

    fn admit(&mut self, report: Report) -> Intake {
        let intake = self.check(report);
        if let Intake::Dropped(reason) = &intake {
            tracing::warn!(%reason, "report dropped");
        }
        intake
    }

    fn check(&mut self, report: Report) -> Intake {
        let sub_intent_id = report.sub_intent_id;
        let sequence = report.sequence;
        if let Some(last) = self.last {
            if sequence == last {
                return Intake::Dropped(ReportValidationError::Duplicate { sub_intent_id, sequence });
            }
            if sequence < last {
                return Intake::Dropped(ReportValidationError::Regressed {
                    sub_intent_id,
                    sequence,
                    last,
                });
            }
        }
        if self.pending.contains_key(&sequence) {
            return Intake::Dropped(ReportValidationError::Duplicate { sub_intent_id, sequence });
        }
        if self.pending.is_empty() {
            self.oldest = Some(Instant::now());
        }
        self.pending.insert(sequence, (report, Utc::now()));
        Intake::Queued
    }

    /// Reports that directly follow the last forwarded one.
    fn take_ready(&mut self) -> Vec<(Report, DateTime<Utc>)> {
        let mut ready = Vec::new();
        loop {
            let expected = self.last.map_or(1, |l| l + 1);
            match self.pending.remove(&expected) {
                Some(entry) => {
                    self.last = Some(expected);
                    ready.push(entry);
                }
                None => break,
            }
        }
        self.settle();
        ready
    }

    /// Everything buffered, gaps skipped.
    fn take_all(&mut self) -> Vec<(Report, DateTime<Utc>)> {
        let pending = std::mem::take(&mut self.pending);
        if let Some((&sequence, _)) = pending.last_key_value() {
            self.last = Some(sequence);
        }
        self.settle();
        pending.into_values().collect()
    }

    fn settle(&mut self) {
        if self.pending.is_empty() {
            self.oldest = None;
        }
    }

    fn deadline(&self, window: Duration) -> Option<Instant> {
        self.oldest.map(|t| t + window)
    }
}

async fn run_lane(
    shared: Arc<Shared>,
    sub_intent_id: Uuid,
    generation: u64,
    route: ReportRoute,
    mut rx: mpsc::Receiver<LaneMessage>,
    turns: [SinkTurn; 2],
) {
    let window = Duration::from_millis(shared.config.reorder_window_ms);
    let idle = Duration::from_secs(shared.config.lane_idle_secs);

    let [owner_turn, twin_turn] = turns;
    let (owner_tx, owner_rx) = mpsc::unbounded_channel();
    let (twin_tx, twin_rx) = mpsc::unbounded_channel();
    let owner = SinkWorker {
        sink: shared.owner.clone(),
        key: (sub_intent_id, OWNER_SINK),
        generation,
    };
    let twin = SinkWorker {
        sink: shared.twin.clone(),
        key: (sub_intent_id, TWIN_SINK),
        generation,
    };
    tokio::spawn(run_sink(shared.clone(), owner, owner_turn, owner_rx));
    tokio::spawn(run_sink(shared.clone(), twin, twin_turn, twin_rx));
    let sinks = [owner_tx, twin_tx];

    // A retired predecessor may have forwarded more since `route` was read.
    let last = shared
        .registry
        .report_route(sub_intent_id)
        .and_then(|r| r.last_sequence)
        .or(route.last_sequence);
    let mut reorder = Reorder::new(last);
    let mut last_activity = Instant::now();

    loop {
        let wake = reorder.deadline(window).unwrap_or(last_activity + idle);
        tokio::select! {
            message = rx.recv() => {
                let Some(LaneMessage { report, reply }) = message else { break };
                last_activity = Instant::now();
                let _ = reply.send(reorder.admit(report));
                forward(&shared, &route, &sinks, reorder.take_ready()).await;
            }
            _ = tokio::time::sleep_until(wake) => {
                if reorder.deadline(window).is_some() {
                    let buffered = reorder.take_all();
                    tracing::debug!(sub_intent_id = %sub_intent_id, count = buffered.len(), "reorder window expired");
                    forward(&shared, &route, &sinks, buffered).await;
                    continue;
                }

                shared.lanes.remove_if(&sub_intent_id, |_, lane| lane.generation == generation);
                rx.close();
                while let Some(LaneMessage { report, reply }) = rx.recv().await {
                    let _ = reply.send(reorder.admit(report));
                }
                forward(&shared, &route, &sinks, reorder.take_all()).await;
                tracing::debug!(sub_intent_id = %sub_intent_id, generation, "report lane retired");
                break;
            }
        }
    }
}

async fn forward(
    shared: &Shared,
    route: &ReportRoute,
    sinks: &[mpsc::UnboundedSender<ReportEnvelope>],
    reports: Vec<(Report, DateTime<Utc>)>,
) {
    if reports.is_empty() {
        return;
    }

    let mut state_changed = false;
    let mut accepted = Vec::with_capacity(reports.len());
    for (report, received_at) in reports {
        let state = report.lifecycle_state();
        if shared.registry.record_report(report.sub_intent_id, report.sequence, state) {
            state_changed |= state.is_some();
            accepted.push((report, received_at));
        } else {
            tracing::debug!(sub_intent_id = %report.sub_intent_id, seq = report.sequence, "report already forwarded");
        }
    }

    for (report, received_at) in accepted {
        tracing::debug!(
            intent_id = %route.intent_id,
            sub_intent_id = %report.sub_intent_id,
            seq = report.sequence,
            "forwarding report"
        );
        let envelope = ReportEnvelope {
            intent_id: route.intent_id.clone(),
            intent_version: route.intent_version,
            owner: route.owner.clone(),
            report,
            received_at,
        };
        for sink in sinks {
            let _ = sink.send(envelope.clone());
        }
    }

    if state_changed {
        let _ = shared.updates.send(route.intent_id.clone());
    }
}

struct SinkWorker {
    sink: Arc<dyn ReportSink>,
    key: (Uuid, usize),
    generation: u64,
}

async fn run_sink(
    shared: Arc<Shared>,
    worker: SinkWorker,
    turn: SinkTurn,
    mut queue: mpsc::UnboundedReceiver<ReportEnvelope>,
) {
    if let Some(previous) = turn.previous {
        // Resolves when the predecessor drops its sender.
        let _ = previous.await;
    }

    let SinkWorker { sink, key, generation } = worker;
    let retry = &shared.config.sink_retry;
    while let Some(envelope) = queue.recv().await {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match sink.deliver(&envelope).await {
                Ok(()) => break,
                Err(e) if !retry.is_exhausted(attempts) => {
                    tracing::warn!(
                        sink = sink.name(),
                        sub_intent_id = %envelope.report.sub_intent_id,
                        seq = envelope.report.sequence,
                        attempt = attempts,
                        error = %e,
                        "report delivery failed, retrying"
                    );
                    tokio::time::sleep(retry.delay_for(attempts - 1)).await;
                }
                Err(e) => {
                    tracing::error!(
                        sink = sink.name(),
                        sub_intent_id = %envelope.report.sub_intent_id,
                        seq = envelope.report.sequence,
                        attempts,
                        error = %e,
                        "report delivery abandoned"
                    );
                    break;
                }
            }
        }
    }

    shared.batons.remove_if(&key, |_, baton| baton.generation == generation);
    drop(turn.done);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{registry_with_sub_intent, RecordingSink};
    use conduit_core::LifecycleState;

    struct Fixture {
        aggregator: Aggregator,
        owner: Arc<RecordingSink>,
        twin: Arc<RecordingSink>,
        registry: Arc<Registry>,
        sub_intent_id: Uuid,
        updates: broadcast::Receiver<IntentId>,
    }

    fn fixture(config: AggregatorConfig) -> Fixture {
        let (registry, sub_intent_id) = registry_with_sub_intent();
        let registry = Arc::new(registry);
        let owner = Arc::new(RecordingSink::new());
        let twin = Arc::new(RecordingSink::new());
        let (tx, updates) = broadcast::channel(16);
        let aggregator = Aggregator::new(config, registry.clone(), owner.clone(), twin.clone(), tx);
        Fixture {
            aggregator,
            owner,
            twin,
            registry,
            sub_intent_id,
            updates,
        }
    }

    fn fast() -> AggregatorConfig {
        AggregatorConfig {
            reorder_window_ms: 50,
            sink_retry: RetryPolicy::unbounded().with_initial_delay(5).with_max_delay(20),
            ..AggregatorConfig::default()
        }
    }

    #[tokio::test]
    async fn test_unknown_sub_intent_is_dropped() {
        let f = fixture(fast());
        let stray = Uuid::new_v4();
        let intake = f.aggregator.submit(Report::state(stray, 1, LifecycleState::Received)).await;
        assert_eq!(intake, Intake::Dropped(ReportValidationError::UnknownSubIntent(stray)));
        assert_eq!(f.aggregator.lane_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicates_have_no_effect() {
        let mut f = fixture(fast());
        let id = f.sub_intent_id;
        assert_eq!(f.aggregator.submit(Report::state(id, 1, LifecycleState::Received)).await, Intake::Queued);
        assert_eq!(
            f.aggregator.submit(Report::state(id, 1, LifecycleState::Received)).await,
            Intake::Dropped(ReportValidationError::Duplicate { sub_intent_id: id, sequence: 1 })
        );

        f.owner.wait_for(1).await;
        f.twin.wait_for(1).await;
        assert_eq!(f.updates.recv().await.unwrap().as_str(), "I1");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.owner.sequences(), vec![1]);
        assert_eq!(f.twin.sequences(), vec![1]);
    }

    #[tokio::test]
    async fn test_out_of_order_reports_are_reordered() {
        let f = fixture(fast());
        let id = f.sub_intent_id;
        for seq in [2, 1, 3] {
            let intake = f.aggregator.submit(Report::observation(id, seq, "co1", seq as f64)).await;
            assert_eq!(intake, Intake::Queued);
        }
        f.owner.wait_for(3).await;
        assert_eq!(f.owner.sequences(), vec![1, 2, 3]);

        assert_eq!(
            f.aggregator.submit(Report::observation(id, 2, "co1", 0.0)).await,
            Intake::Dropped(ReportValidationError::Regressed {
                sub_intent_id: id,
                sequence: 2,
                last: 3
            })
        );
    }

    #[tokio::test]
    async fn test_gap_is_skipped_after_window() {
        let f = fixture(fast());
        let id = f.sub_intent_id;
        f.aggregator.submit(Report::state(id, 1, LifecycleState::Received)).await;
        f.aggregator.submit(Report::state(id, 3, LifecycleState::Compliant)).await;

        f.owner.wait_for(2).await;
        assert_eq!(f.owner.sequences(), vec![1, 3]);

        let record = f.registry.sub_intent(id).unwrap();
        assert_eq!(record.last_sequence, Some(3));
        assert_eq!(record.latest_state, Some(LifecycleState::Compliant));
    }

    #[tokio::test]
    async fn test_failing_sink_is_retried_in_order() {
        let f = fixture(fast());
        let id = f.sub_intent_id;
        f.owner.fail_next(3);
        for seq in 1..=3 {
            f.aggregator.submit(Report::observation(id, seq, "co1", 1.0)).await;
        }
        f.twin.wait_for(3).await;
        f.owner.wait_for(3).await;
        assert_eq!(f.owner.sequences(), vec![1, 2, 3]);
        assert_eq!(f.twin.sequences(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_idle_lane_retires_and_restarts() {
        let f = fixture(AggregatorConfig {
            lane_idle_secs: 0,
            ..fast()
        });
        let id = f.sub_intent_id;
        f.aggregator.submit(Report::state(id, 1, LifecycleState::Received)).await;
        f.owner.wait_for(1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.aggregator.lane_count(), 0);

        // a fresh lane still remembers the last forwarded sequence
        assert_ne!(f.aggregator.submit(Report::state(id, 1, LifecycleState::Received)).await, Intake::Queued);
        assert_eq!(f.aggregator.submit(Report::state(id, 2, LifecycleState::Compliant)).await, Intake::Queued);
        f.owner.wait_for(2).await;
    }

    #[tokio::test]
    async fn test_restarted_lane_waits_for_retiring_sink_backlog() {
        let f = fixture(AggregatorConfig {
            lane_idle_secs: 0,
            sink_retry: RetryPolicy::unbounded().with_initial_delay(300).with_max_delay(300),
            ..fast()
        });
        let id = f.sub_intent_id;
        f.owner.fail_next(1);

        assert_eq!(f.aggregator.submit(Report::state(id, 1, LifecycleState::Received)).await, Intake::Queued);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.aggregator.lane_count(), 0);

        // seq 1 is still being retried by the retired lane's owner worker
        assert_eq!(f.aggregator.submit(Report::state(id, 2, LifecycleState::Compliant)).await, Intake::Queued);
        f.twin.wait_for(2).await;
        f.owner.wait_for(2).await;
        assert_eq!(f.owner.sequences(), vec![1, 2]);
        assert_eq!(f.twin.sequences(), vec![1, 2]);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(f.aggregator.shared.batons.is_empty());
    }
}
