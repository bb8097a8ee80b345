//! Twin store trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use conduit_core::{HandlerEndpoint, IntentId, TargetId, TwinError};
use tokio::sync::RwLock;

use crate::record::{Appended, TwinEntry, TwinRecord};

/// Trait for twin store clients.
#[async_trait]
pub trait TwinStore: Send + Sync {
    /// Look up the handler endpoint registered for a target.
    ///
    /// `Ok(None)` means the twin is reachable and has no such target.
    async fn lookup_target(&self, target: &TargetId)
        -> Result<Option<HandlerEndpoint>, TwinError>;

    /// Register or replace the endpoint for a target.
    async fn register_endpoint(&self, endpoint: HandlerEndpoint) -> Result<(), TwinError>;

    /// Append a record. Idempotent on [`TwinRecord::key`].
    async fn append(&self, record: TwinRecord) -> Result<Appended, TwinError>;

    /// Every record of one intent, in append order.
    async fn records_for(&self, intent_id: &IntentId) -> Result<Vec<TwinEntry>, TwinError>;
}

#[derive(Default)]
struct Inner {
    /// Append-only log.
    entries: Vec<TwinEntry>,
    /// key -> position in `entries`.
    index: HashMap<String, usize>,
    endpoints: HashMap<TargetId, HandlerEndpoint>,
    version: u64,
}

/// In-memory implementation of TwinStore.
///
/// Can be switched offline to exercise retry paths.
#[derive(Clone, Default)]
pub struct InMemoryTwinStore {
    inner: Arc<RwLock<Inner>>,
    offline: Arc<AtomicBool>,
    lookups: Arc<AtomicUsize>,
}

impl InMemoryTwinStore {
    /// Create a new in-memory twin store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with endpoints.
    pub fn with_endpoints(endpoints: impl IntoIterator<Item = HandlerEndpoint>) -> Self {
        let inner = Inner {
            endpoints: endpoints
                .into_iter()
                .map(|e| (e.target.clone(), e))
                .collect(),
            ..Inner::default()
        };
        Self {
            inner: Arc::new(RwLock::new(inner)),
            ..Self::default()
        }
    }

    /// While offline every call fails with [`TwinError::Unreachable`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of target lookups served so far, failed ones included.
    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    /// Current store version.
    pub async fn version(&self) -> u64 {
        self.inner.read().await.version
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn check_online(&self) -> Result<(), TwinError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(TwinError::Unreachable("twin store is offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl TwinStore for InMemoryTwinStore {
    async fn lookup_target(
        &self,
        target: &TargetId,
    ) -> Result<Option<HandlerEndpoint>, TwinError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        Ok(self.inner.read().await.endpoints.get(target).cloned())
    }

    async fn register_endpoint(&self, endpoint: HandlerEndpoint) -> Result<(), TwinError> {
        self.check_online()?;
        let mut inner = self.inner.write().await;
        tracing::debug!(target_id = %endpoint.target, address = %endpoint.address, "endpoint registered");
        inner.endpoints.insert(endpoint.target.clone(), endpoint);
        Ok(())
    }

    async fn append(&self, record: TwinRecord) -> Result<Appended, TwinError> {
        self.check_online()?;
        let mut inner = self.inner.write().await;

        let key = record.key();
        if inner.index.contains_key(&key) {
            return Ok(Appended::Duplicate);
        }

        inner.version += 1;
        let version = inner.version;
        let position = inner.entries.len();
        inner.entries.push(TwinEntry {
            key: key.clone(),
            version,
            stored_at: Utc::now(),
            record,
        });
        inner.index.insert(key, position);

        Ok(Appended::Stored(version))
    }

    async fn records_for(&self, intent_id: &IntentId) -> Result<Vec<TwinEntry>, TwinError> {
        self.check_online()?;
        let inner = self.inner.read().await;
        Ok(inner
            .entries
            .iter()
            .filter(|e| e.record.intent_id() == intent_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::{
        Capability, Expectation, ExpectationKind, Intent, LifecycleState, OwnerId, Report,
        ReportEnvelope, SubIntent,
    };
    use uuid::Uuid;

    fn envelope(sub: Uuid, sequence: u64) -> TwinRecord {
        TwinRecord::Report(ReportEnvelope {
            intent_id: IntentId::new("I1"),
            intent_version: 1,
            owner: OwnerId::default(),
            report: Report::state(sub, sequence, LifecycleState::Received),
            received_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_append_is_idempotent() {
        let store = InMemoryTwinStore::new();
        let sub = Uuid::new_v4();

        assert_eq!(store.append(envelope(sub, 1)).await.unwrap(), Appended::Stored(1));
        assert_eq!(store.append(envelope(sub, 1)).await.unwrap(), Appended::Duplicate);
        assert_eq!(store.append(envelope(sub, 2)).await.unwrap(), Appended::Stored(2));

        assert_eq!(store.len().await, 2);
        assert_eq!(store.version().await, 2);
    }

    #[tokio::test]
    async fn test_records_for_intent() {
        let store = InMemoryTwinStore::new();
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
        let sub_id = sub.id;

        store
            .append(TwinRecord::SubIntent { sub_intent: sub, handler: "ec21".into() })
            .await
            .unwrap();
        store.append(envelope(sub_id, 1)).await.unwrap();

        let records = store.records_for(&IntentId::new("I1")).await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(matches!(records[0].record, TwinRecord::SubIntent { .. }));
        assert!(store.records_for(&IntentId::new("I2")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lookup_and_offline() {
        let store = InMemoryTwinStore::with_endpoints([HandlerEndpoint::new(
            "EC21",
            "http://ec21:8080",
            Capability::Workload,
        )]);

        let found = store.lookup_target(&TargetId::new("EC21")).await.unwrap();
        assert_eq!(found.unwrap().address, "http://ec21:8080");
        assert!(store.lookup_target(&TargetId::new("EC99")).await.unwrap().is_none());

        store.set_offline(true);
        let err = store.lookup_target(&TargetId::new("EC21")).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.lookup_count(), 3);
    }
}
