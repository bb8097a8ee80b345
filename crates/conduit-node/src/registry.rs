//! Accepted intents, their sub-intents and aggregated state.

use chrono::{DateTime, Utc};
use conduit_core::{
    DeliveryStatus, ExpectationKind, HandlerEndpoint, Intent, IntentId, LifecycleState, OwnerId,
    Priority, StatePrecedence, SubIntent, TargetId,
};
use conduit_router::{DispatchOutcome, RoutedSubIntent};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Aggregated state of an intent as shown to its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentState {
    Received,
    Compliant,
    Degraded,
    Finalizing,
    /// Withdrawn by the owner and no longer realized anywhere.
    Withdrawn,
}

impl From<LifecycleState> for IntentState {
    fn from(state: LifecycleState) -> Self {
        match state {
            LifecycleState::Received => IntentState::Received,
            LifecycleState::Compliant => IntentState::Compliant,
            LifecycleState::Degraded => IntentState::Degraded,
            LifecycleState::Finalizing => IntentState::Finalizing,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("intent {0} not found")]
    NotFound(IntentId),

    #[error("intent {0} is already withdrawn")]
    AlreadyWithdrawn(IntentId),
}

/// The accepted version of an intent.
#[derive(Debug, Clone)]
pub struct IntentRecord {
    pub intent: Intent,
    pub version: u32,
    pub accepted_at: DateTime<Utc>,
    pub withdrawn: bool,
    pub sub_intent_ids: Vec<Uuid>,
}

/// Router-side view of one sub-intent.
#[derive(Debug, Clone)]
pub struct SubIntentRecord {
    pub sub_intent: SubIntent,
    pub endpoint: HandlerEndpoint,
    pub status: DeliveryStatus,
    /// Last lifecycle state reported by the handler.
    pub latest_state: Option<LifecycleState>,
    /// Highest report sequence forwarded so far.
    pub last_sequence: Option<u64>,
}

impl SubIntentRecord {
    /// What this sub-intent contributes to its parent's state, if anything.
    fn contribution(&self) -> Option<LifecycleState> {
        if !self.status.is_live() {
            None
        } else if self.status.is_failed() {
            Some(LifecycleState::Degraded)
        } else {
            Some(self.latest_state.unwrap_or(LifecycleState::Received))
        }
    }
}

/// Where reports for a sub-intent are forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRoute {
    pub intent_id: IntentId,
    pub intent_version: u32,
    pub owner: OwnerId,
    pub last_sequence: Option<u64>,
}

/// Serialized sub-intent summary.
#[derive(Debug, Clone, Serialize)]
pub struct SubIntentView {
    pub id: Uuid,
    pub kind: ExpectationKind,
    pub target: TargetId,
    pub endpoint: String,
    pub delivery: DeliveryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<LifecycleState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sequence: Option<u64>,
}

impl From<&RoutedSubIntent> for SubIntentView {
    fn from(routed: &RoutedSubIntent) -> Self {
        Self {
            id: routed.sub_intent.id,
            kind: routed.sub_intent.kind.clone(),
            target: routed.sub_intent.target.clone(),
            endpoint: routed.endpoint.address.clone(),
            delivery: DeliveryStatus::Dispatching,
            state: None,
            last_sequence: None,
        }
    }
}

/// Serialized intent summary.
#[derive(Debug, Clone, Serialize)]
pub struct IntentView {
    pub id: IntentId,
    pub version: u32,
    pub owner: OwnerId,
    pub priority: Priority,
    pub state: IntentState,
    pub withdrawn: bool,
    pub accepted_at: String,
    pub content_hash: String,
    pub sub_intents: Vec<SubIntentView>,
}

/// In-memory registry of accepted intents.
///
/// Sharded by intent and by sub-intent, so report traffic for one intent
/// never waits on another. Lock order is intents before sub-intents.
#[derive(Debug, Default)]
pub struct Registry {
    intents: DashMap<IntentId, IntentRecord>,
    sub_intents: DashMap<Uuid, SubIntentRecord>,
    versions: DashMap<IntentId, u32>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the next version number of `id`.
    pub fn reserve_version(&self, id: &IntentId) -> u32 {
        let mut counter = self.versions.entry(id.clone()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Give back a reserved version that was never registered.
    ///
    /// Only the most recent reservation can be returned.
    pub fn release_version(&self, id: &IntentId, version: u32) {
        if let Some(mut counter) = self.versions.get_mut(id) {
            if *counter == version {
                *counter -= 1;
            }
        }
    }

    /// Record a routed submission under a reserved version.
    ///
    /// Supersedes the current version and returns the superseded sub-intents
    /// a handler had accepted, which need a withdrawal notice. A submission
    /// that lost the race to a later version is stored already withdrawn.
    pub fn register(
        &self,
        intent: Intent,
        version: u32,
        routed: &[RoutedSubIntent],
    ) -> Vec<(Uuid, HandlerEndpoint)> {
        let record = IntentRecord {
            version,
            accepted_at: Utc::now(),
            withdrawn: false,
            sub_intent_ids: routed.iter().map(|r| r.sub_intent.id).collect(),
            intent,
        };

        match self.intents.entry(record.intent.id.clone()) {
            Entry::Occupied(current) if current.get().version > version => {
                tracing::info!(
                    intent_id = %record.intent.id,
                    version,
                    current = current.get().version,
                    "submission superseded before it was recorded"
                );
                self.insert_sub_intents(routed, DeliveryStatus::Withdrawn);
                Vec::new()
            }
            Entry::Occupied(mut current) => {
                let superseded = self.retire(&current.get().sub_intent_ids);
                self.insert_sub_intents(routed, DeliveryStatus::Dispatching);
                current.insert(record);
                superseded
            }
            Entry::Vacant(slot) => {
                self.insert_sub_intents(routed, DeliveryStatus::Dispatching);
                slot.insert(record);
                Vec::new()
            }
        }
    }

    fn insert_sub_intents(&self, routed: &[RoutedSubIntent], status: DeliveryStatus) {
        for r in routed {
            self.sub_intents.insert(
                r.sub_intent.id,
                SubIntentRecord {
                    sub_intent: r.sub_intent.clone(),
                    endpoint: r.endpoint.clone(),
                    status: status.clone(),
                    latest_state: None,
                    last_sequence: None,
                },
            );
        }
    }

    /// Mark sub-intents withdrawn; returns the ones a handler holds.
    fn retire(&self, ids: &[Uuid]) -> Vec<(Uuid, HandlerEndpoint)> {
        let mut live = Vec::new();
        for id in ids {
            if let Some(mut record) = self.sub_intents.get_mut(id) {
                if record.status == DeliveryStatus::Accepted {
                    live.push((*id, record.endpoint.clone()));
                }
                record.status = DeliveryStatus::Withdrawn;
            }
        }
        live
    }

    /// Apply dispatch results.
    ///
    /// Sub-intents withdrawn while their delivery was in flight keep their
    /// status; those the handler accepted anyway are returned so they can be
    /// withdrawn again.
    pub fn apply_outcome(&self, outcome: &DispatchOutcome) -> Vec<(Uuid, HandlerEndpoint)> {
        let mut late = Vec::new();
        for delivery in &outcome.deliveries {
            let Some(mut record) = self.sub_intents.get_mut(&delivery.sub_intent_id) else {
                continue;
            };
            if record.status.is_live() {
                record.status = delivery.status.clone();
            } else if delivery.status == DeliveryStatus::Accepted {
                late.push((delivery.sub_intent_id, delivery.endpoint.clone()));
            }
        }
        late
    }

    /// Withdraw an intent. Returns the sub-intents that need a notice.
    pub fn withdraw(&self, id: &IntentId) -> Result<Vec<(Uuid, HandlerEndpoint)>, RegistryError> {
        let mut record = self
            .intents
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        if record.withdrawn {
            return Err(RegistryError::AlreadyWithdrawn(id.clone()));
        }
        record.withdrawn = true;
        Ok(self.retire(&record.sub_intent_ids))
    }

    /// Where reports for `sub_intent_id` go.
    pub fn report_route(&self, sub_intent_id: Uuid) -> Option<ReportRoute> {
        let record = self.sub_intents.get(&sub_intent_id)?;
        Some(ReportRoute {
            intent_id: record.sub_intent.parent_id.clone(),
            intent_version: record.sub_intent.parent_version,
            owner: record.sub_intent.owner.clone(),
            last_sequence: record.last_sequence,
        })
    }

    /// Note a forwarded report. Returns false if `sequence` is not past the
    /// last recorded one, in which case nothing changes.
    pub fn record_report(&self, sub_intent_id: Uuid, sequence: u64, state: Option<LifecycleState>) -> bool {
        let Some(mut record) = self.sub_intents.get_mut(&sub_intent_id) else {
            return false;
        };
        if record.last_sequence.is_some_and(|last| sequence <= last) {
            return false;
        }
        record.last_sequence = Some(sequence);
        if let Some(state) = state {
            record.latest_state = Some(state);
        }
        true
    }

    /// Snapshot of one sub-intent.
    #[cfg(test)]
    pub fn sub_intent(&self, id: Uuid) -> Option<SubIntentRecord> {
        self.sub_intents.get(&id).map(|r| r.value().clone())
    }

    /// Current version and aggregated state of an intent. The state is the
    /// worst contribution of its live sub-intents.
    pub fn status(&self, id: &IntentId, precedence: &StatePrecedence) -> Option<(u32, IntentState)> {
        let record = self.intents.get(id)?;
        Some((record.version, self.state_of(&record, precedence)))
    }

    fn state_of(&self, record: &IntentRecord, precedence: &StatePrecedence) -> IntentState {
        let contributions: Vec<LifecycleState> = record
            .sub_intent_ids
            .iter()
            .filter_map(|s| self.sub_intents.get(s).and_then(|r| r.contribution()))
            .collect();
        match precedence.reduce(contributions) {
            Some(state) => state.into(),
            None if record.withdrawn => IntentState::Withdrawn,
            None => IntentState::Received,
        }
    }

    pub fn view(&self, id: &IntentId, precedence: &StatePrecedence) -> Option<IntentView> {
        let record = self.intents.get(id)?;
        let state = self.state_of(&record, precedence);
        let sub_intents = record
            .sub_intent_ids
            .iter()
            .filter_map(|s| self.sub_intents.get(s))
            .map(|s| SubIntentView {
                id: s.sub_intent.id,
                kind: s.sub_intent.kind.clone(),
                target: s.sub_intent.target.clone(),
                endpoint: s.endpoint.address.clone(),
                delivery: s.status.clone(),
                state: s.latest_state,
                last_sequence: s.last_sequence,
            })
            .collect();

        Some(IntentView {
            id: record.intent.id.clone(),
            version: record.version,
            owner: record.intent.owner.clone(),
            priority: record.intent.priority,
            state,
            withdrawn: record.withdrawn,
            accepted_at: record.accepted_at.to_rfc3339(),
            content_hash: record.intent.content_hash(),
            sub_intents,
        })
    }

    /// Every intent, ordered by id.
    pub fn views(&self, precedence: &StatePrecedence) -> Vec<IntentView> {
        let mut ids: Vec<IntentId> = self.intents.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        ids.iter().filter_map(|id| self.view(id, precedence)).collect()
    }

    /// Number of intents, withdrawn ones included.
    pub fn intent_count(&self) -> usize {
        self.intents.len()
    }
}
