//! Sub-intents: per-target projections of an intent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::intent::{Expectation, ExpectationKind, Intent};
use crate::types::{IntentId, OwnerId, Priority, TargetId};

/// The part of an intent delivered to one handler.
///
/// Created once at split time and never mutated. The id doubles as the
/// idempotency key for delivery retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubIntent {
    /// Unique identifier, reused by every delivery attempt.
    pub id: Uuid,

    /// The parent intent.
    pub parent_id: IntentId,

    /// Version of the parent this projection was split from.
    pub parent_version: u32,

    /// Owner of the parent intent.
    pub owner: OwnerId,

    /// Priority inherited from the parent.
    pub priority: Priority,

    /// Classified type shared by the routed expectations.
    pub kind: ExpectationKind,

    /// Target shared by the routed expectations.
    pub target: TargetId,

    /// Routed expectations first, then the parent's reporting expectations.
    pub expectations: Vec<Expectation>,

    /// When the split happened.
    pub created_at: DateTime<Utc>,
}

impl SubIntent {
    /// Project `intent` onto one (kind, target) pair.
    pub fn project(
        intent: &Intent,
        version: u32,
        kind: &ExpectationKind,
        target: &TargetId,
    ) -> Self {
        let routed = intent
            .expectations
            .iter()
            .filter(|e| &e.kind == kind && e.target.as_ref() == Some(target));
        let expectations = routed
            .chain(intent.reporting_expectations())
            .cloned()
            .collect();

        Self {
            id: Uuid::new_v4(),
            parent_id: intent.id.clone(),
            parent_version: version,
            owner: intent.owner.clone(),
            priority: intent.priority,
            kind: kind.clone(),
            target: target.clone(),
            expectations,
            created_at: Utc::now(),
        }
    }

    /// Expectations this handler must realize.
    pub fn routed_expectations(&self) -> impl Iterator<Item = &Expectation> {
        self.expectations
            .iter()
            .filter(|e| e.kind != ExpectationKind::Reporting)
    }

    /// Reporting expectations copied from the parent.
    pub fn reporting_expectations(&self) -> impl Iterator<Item = &Expectation> {
        self.expectations
            .iter()
            .filter(|e| e.kind == ExpectationKind::Reporting)
    }
}

/// A handler's synchronous answer to a delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Acceptance {
    Accepted,
    Rejected { reason: String },
}

impl Acceptance {
    /// Returns true if the handler took the sub-intent.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Acceptance::Accepted)
    }
}

/// Router-side delivery status of a sub-intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Delivery in progress (including retries).
    Dispatching,
    /// The handler accepted it.
    Accepted,
    /// The handler refused it. Permanent until the owner resubmits.
    Rejected { reason: String },
    /// Delivery exhausted its retry budget.
    PermanentlyFailed { reason: String },
    /// A withdrawal notice was issued.
    Withdrawn,
}

impl DeliveryStatus {
    /// Returns true while the sub-intent still counts towards its parent's state.
    pub fn is_live(&self) -> bool {
        !matches!(self, DeliveryStatus::Withdrawn)
    }

    /// Returns true if delivery failed for good.
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            DeliveryStatus::Rejected { .. } | DeliveryStatus::PermanentlyFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_projection_copies_reporting_expectations() {
        let intent = Intent::builder()
            .id("I1")
            .expectation(Expectation::workload("de1", "EC21"))
            .expectation(Expectation::workload("de2", "EC22"))
            .expectation(Expectation::network("ne1", "network"))
            .expectation(Expectation::reporting("re1"))
            .build()
            .unwrap();

        let sub = SubIntent::project(
            &intent,
            1,
            &ExpectationKind::WorkloadDeployment,
            &TargetId::new("EC21"),
        );
        let ids: Vec<&str> = sub.expectations.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["de1", "re1"]);
        assert_eq!(sub.routed_expectations().count(), 1);
        assert_eq!(sub.parent_id.as_str(), "I1");
    }

    #[test]
    fn test_acceptance_wire_format() {
        let json = serde_json::to_value(Acceptance::Rejected { reason: "full".into() }).unwrap();
        assert_eq!(json["status"], "rejected");
        assert_eq!(json["reason"], "full");

        let accepted: Acceptance = serde_json::from_str(r#"{"status":"accepted"}"#).unwrap();
        assert!(accepted.is_accepted());
    }
}
