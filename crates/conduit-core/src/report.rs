//! Lifecycle and observation reports.
//!
//! Handlers emit reports against a sub-intent with a sequence number they
//! assign, increasing per sub-intent. The aggregator forwards them to the
//! intent's owner and to the twin store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::condition::Quantity;
use crate::error::ConduitError;
use crate::types::{IntentId, OwnerId};

/// Lifecycle state of a sub-intent (and, aggregated, of an intent).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Accepted, not yet realized.
    Received,
    /// Every condition holds.
    Compliant,
    /// At least one condition does not hold, or delivery failed.
    Degraded,
    /// Being torn down.
    Finalizing,
}

impl LifecycleState {
    /// All states, in declaration order.
    pub const ALL: [LifecycleState; 4] = [
        LifecycleState::Received,
        LifecycleState::Compliant,
        LifecycleState::Degraded,
        LifecycleState::Finalizing,
    ];

    /// Returns true once a handler stops emitting reports.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, LifecycleState::Received)
    }

    /// Wire name of this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Received => "received",
            LifecycleState::Compliant => "compliant",
            LifecycleState::Degraded => "degraded",
            LifecycleState::Finalizing => "finalizing",
        }
    }
}

/// Progress of an in-place update of an already realized sub-intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    Updating,
    Updated,
    UpdateFailed,
}

/// Lifecycle transition reported by a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateReport {
    pub state: LifecycleState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_state: Option<UpdateState>,
}

/// Metric observation for one condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationReport {
    /// The condition this observation measures.
    pub condition_id: String,

    pub value: Quantity,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,

    /// When the metric was sampled.
    pub observed_at: DateTime<Utc>,
}

/// Report payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReportBody {
    State(StateReport),
    Observation(ObservationReport),
}

/// A report emitted by a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// The sub-intent this report is about.
    pub sub_intent_id: Uuid,

    /// Parent intent, when the reporter knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_id: Option<IntentId>,

    /// Reporter-assigned, increasing per sub-intent.
    pub sequence: u64,

    /// Identity of the emitting handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reporter: Option<String>,

    /// When the report was emitted.
    pub emitted_at: DateTime<Utc>,

    pub body: ReportBody,
}

impl Report {
    /// A lifecycle report.
    pub fn state(sub_intent_id: Uuid, sequence: u64, state: LifecycleState) -> Self {
        Self::new(
            sub_intent_id,
            sequence,
            ReportBody::State(StateReport {
                state,
                reason: None,
                update_state: None,
            }),
        )
    }

    /// An observation report sampled now.
    pub fn observation(
        sub_intent_id: Uuid,
        sequence: u64,
        condition_id: impl Into<String>,
        value: impl Into<Quantity>,
    ) -> Self {
        Self::new(
            sub_intent_id,
            sequence,
            ReportBody::Observation(ObservationReport {
                condition_id: condition_id.into(),
                value: value.into(),
                unit: None,
                observed_at: Utc::now(),
            }),
        )
    }

    fn new(sub_intent_id: Uuid, sequence: u64, body: ReportBody) -> Self {
        Self {
            sub_intent_id,
            intent_id: None,
            sequence,
            reporter: None,
            emitted_at: Utc::now(),
            body,
        }
    }

    /// Attach the parent intent id.
    pub fn for_intent(mut self, intent_id: IntentId) -> Self {
        self.intent_id = Some(intent_id);
        self
    }

    /// Attach the reporter identity.
    pub fn from_reporter(mut self, reporter: impl Into<String>) -> Self {
        self.reporter = Some(reporter.into());
        self
    }

    /// Attach a reason to a state report. No effect on observations.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        if let ReportBody::State(state) = &mut self.body {
            state.reason = Some(reason.into());
        }
        self
    }

    /// Attach a unit to an observation. No effect on state reports.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        if let ReportBody::Observation(observation) = &mut self.body {
            observation.unit = Some(unit.into());
        }
        self
    }

    /// The reported lifecycle state, for state reports.
    pub fn lifecycle_state(&self) -> Option<LifecycleState> {
        match &self.body {
            ReportBody::State(s) => Some(s.state),
            ReportBody::Observation(_) => None,
        }
    }
}

/// A validated report on its way to the owner and the twin store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportEnvelope {
    pub intent_id: IntentId,
    pub intent_version: u32,
    pub owner: OwnerId,
    pub report: Report,
    /// When the aggregator accepted the report.
    pub received_at: DateTime<Utc>,
}

/// Ordering used to reduce sub-intent states into one intent state.
///
/// Listed worst first; the worst state present wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<LifecycleState>", into = "Vec<LifecycleState>")]
pub struct StatePrecedence(Vec<LifecycleState>);

impl Default for StatePrecedence {
    fn default() -> Self {
        Self(vec![
            LifecycleState::Degraded,
            LifecycleState::Finalizing,
            LifecycleState::Received,
            LifecycleState::Compliant,
        ])
    }
}

impl TryFrom<Vec<LifecycleState>> for StatePrecedence {
    type Error = ConduitError;

    fn try_from(order: Vec<LifecycleState>) -> std::result::Result<Self, Self::Error> {
        Self::new(order)
    }
}

impl From<StatePrecedence> for Vec<LifecycleState> {
    fn from(precedence: StatePrecedence) -> Self {
        precedence.0
    }
}

impl StatePrecedence {
    /// Build an ordering. Every state must appear exactly once.
    pub fn new(order: Vec<LifecycleState>) -> std::result::Result<Self, ConduitError> {
        for state in LifecycleState::ALL {
            let count = order.iter().filter(|s| **s == state).count();
            if count != 1 {
                return Err(ConduitError::Config(format!(
                    "state precedence must list '{}' exactly once (found {})",
                    state.as_str(),
                    count
                )));
            }
        }
        Ok(Self(order))
    }

    /// Position of `state`; lower is worse.
    pub fn rank(&self, state: LifecycleState) -> usize {
        self.0.iter().position(|s| *s == state).unwrap_or(self.0.len())
    }

    /// The worst of `states`, or `None` if there are none.
    pub fn reduce(&self, states: impl IntoIterator<Item = LifecycleState>) -> Option<LifecycleState> {
        states.into_iter().min_by_key(|s| self.rank(*s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_precedence() {
        use LifecycleState::*;
        let p = StatePrecedence::default();
        assert_eq!(p.reduce([Compliant, Degraded]), Some(Degraded));
        assert_eq!(p.reduce([Compliant, Received, Finalizing]), Some(Finalizing));
        assert_eq!(p.reduce([Compliant, Received]), Some(Received));
        assert_eq!(p.reduce([Compliant, Compliant]), Some(Compliant));
        assert_eq!(p.reduce(Vec::new()), None);
    }

    #[test]
    fn test_configured_precedence_is_validated() {
        use LifecycleState::*;
        assert!(StatePrecedence::new(vec![Degraded, Received, Compliant]).is_err());
        assert!(StatePrecedence::new(vec![Degraded, Degraded, Received, Compliant]).is_err());

        let p: StatePrecedence =
            serde_json::from_str(r#"["finalizing","degraded","received","compliant"]"#).unwrap();
        assert_eq!(p.reduce([Degraded, Finalizing]), Some(Finalizing));
    }

    #[test]
    fn test_report_wire_format() {
        let id = Uuid::new_v4();
        let report = Report::state(id, 1, LifecycleState::Degraded)
            .with_reason("latency above threshold")
            .for_intent(IntentId::new("I1"));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["body"]["kind"], "state");
        assert_eq!(json["body"]["state"], "degraded");
        assert_eq!(json["sequence"], 1);

        let back: Report = serde_json::from_value(json).unwrap();
        assert_eq!(back.lifecycle_state(), Some(LifecycleState::Degraded));

        let observation = Report::observation(id, 2, "co1", 12.5).with_unit("ms");
        assert_eq!(observation.lifecycle_state(), None);
    }
}
