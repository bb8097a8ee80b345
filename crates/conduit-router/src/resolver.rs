//! Target to endpoint resolution.
//!
//! A read-through cache in front of the twin store. Entries expire after a
//! configurable TTL so infrastructure changes become visible without a
//! restart. Negative answers are never cached.

use std::sync::Arc;
use std::time::{Duration, Instant};

use conduit_core::{HandlerEndpoint, ResolveError, RetryPolicy, TargetId};
use conduit_twin::TwinStore;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Configuration for the resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Cache entry lifetime in seconds.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Bound on a single twin lookup in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Retry budget for transient lookup failures.
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_ttl_secs() -> u64 {
    60
}
fn default_timeout_ms() -> u64 {
    2_000
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            timeout_ms: default_timeout_ms(),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedEndpoint {
    endpoint: HandlerEndpoint,
    fetched_at: Instant,
}

/// Resolves targets to handler endpoints.
///
/// Injected into the router at construction; safe to share across tasks.
pub struct EndpointResolver {
    store: Arc<dyn TwinStore>,
    cache: DashMap<TargetId, CachedEndpoint>,
    ttl: Duration,
    timeout: Duration,
    retry: RetryPolicy,
}

impl EndpointResolver {
    /// Create a resolver backed by `store`.
    pub fn new(store: Arc<dyn TwinStore>, config: &ResolverConfig) -> Self {
        Self {
            store,
            cache: DashMap::new(),
            ttl: Duration::from_secs(config.ttl_secs),
            timeout: Duration::from_millis(config.timeout_ms),
            retry: config.retry.clone(),
        }
    }

    /// Resolve `target`, retrying transient failures within the configured budget.
    pub async fn resolve(&self, target: &TargetId) -> Result<HandlerEndpoint, ResolveError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.resolve_once(target).await {
                Err(e) if e.is_transient() && !self.retry.is_exhausted(attempts) => {
                    let delay = self.retry.delay_for(attempts - 1);
                    tracing::debug!(
                        target_id = %target,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying endpoint resolution"
                    );
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }

    /// A single cache-or-twin lookup, bounded by the configured timeout.
    pub async fn resolve_once(&self, target: &TargetId) -> Result<HandlerEndpoint, ResolveError> {
        if let Some(endpoint) = self.cached(target) {
            return Ok(endpoint);
        }

        let lookup = tokio::time::timeout(self.timeout, self.store.lookup_target(target)).await;
        match lookup {
            Ok(Ok(Some(endpoint))) => {
                self.prime(endpoint.clone());
                Ok(endpoint)
            }
            Ok(Ok(None)) => Err(ResolveError::UnknownTarget(target.clone())),
            Ok(Err(e)) if !e.is_transient() => {
                tracing::warn!(target_id = %target, error = %e, "twin store refused lookup");
                Err(ResolveError::LookupRefused {
                    target: target.clone(),
                    message: e.to_string(),
                })
            }
            Ok(Err(e)) => Err(ResolveError::TransientResolutionFailure {
                target: target.clone(),
                message: e.to_string(),
            }),
            Err(_) => Err(ResolveError::TransientResolutionFailure {
                target: target.clone(),
                message: format!("lookup timed out after {}ms", self.timeout.as_millis()),
            }),
        }
    }

    /// Put an endpoint in the cache, e.g. right after registering it.
    pub fn prime(&self, endpoint: HandlerEndpoint) {
        self.cache.insert(
            endpoint.target.clone(),
            CachedEndpoint {
                endpoint,
                fetched_at: Instant::now(),
            },
        );
    }

    /// Drop the cached entry for `target`.
    pub fn invalidate(&self, target: &TargetId) {
        self.cache.remove(target);
    }

    /// Number of cached entries, expired ones included.
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    fn cached(&self, target: &TargetId) -> Option<HandlerEndpoint> {
        let entry = self.cache.get(target)?;
        if entry.fetched_at.elapsed() < self.ttl {
            return Some(entry.endpoint.clone());
        }
        drop(entry);
        self.cache.remove(target);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use conduit_core::{Capability, IntentId, TwinError};
    use conduit_twin::{Appended, InMemoryTwinStore, TwinEntry, TwinRecord};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Twin store that answers every lookup with a client error.
    #[derive(Default)]
    struct RefusingStore {
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl TwinStore for RefusingStore {
        async fn lookup_target(&self, _: &TargetId) -> Result<Option<HandlerEndpoint>, TwinError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Err(TwinError::Refused {
                status: 400,
                message: "malformed target".into(),
            })
        }

        async fn register_endpoint(&self, _: HandlerEndpoint) -> Result<(), TwinError> {
            Ok(())
        }

        async fn append(&self, _: TwinRecord) -> Result<Appended, TwinError> {
            Ok(Appended::Duplicate)
        }

        async fn records_for(&self, _: &IntentId) -> Result<Vec<TwinEntry>, TwinError> {
            Ok(Vec::new())
        }
    }

    fn config(ttl_secs: u64) -> ResolverConfig {
        ResolverConfig {
            ttl_secs,
            timeout_ms: 500,
            retry: RetryPolicy::new(3).with_initial_delay(1).with_max_delay(5),
        }
    }

    fn twin() -> InMemoryTwinStore {
        InMemoryTwinStore::with_endpoints([HandlerEndpoint::new(
            "EC21",
            "http://ec21:3000",
            Capability::Workload,
        )])
    }

    #[tokio::test]
    async fn test_resolve_reads_through_cache() {
        let store = twin();
        let resolver = EndpointResolver::new(Arc::new(store.clone()), &config(60));
        let target = TargetId::new("EC21");

        let first = resolver.resolve(&target).await.unwrap();
        let second = resolver.resolve(&target).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.lookup_count(), 1);

        assert_eq!(resolver.cached_len(), 1);

        resolver.invalidate(&target);
        assert_eq!(resolver.cached_len(), 0);
        resolver.resolve(&target).await.unwrap();
        assert_eq!(store.lookup_count(), 2);
    }

    #[tokio::test]
    async fn test_expired_entries_are_refetched() {
        let store = twin();
        let resolver = EndpointResolver::new(Arc::new(store.clone()), &config(0));
        let target = TargetId::new("EC21");

        resolver.resolve(&target).await.unwrap();
        resolver.resolve(&target).await.unwrap();
        assert_eq!(store.lookup_count(), 2);
    }

    #[tokio::test]
    async fn test_unknown_target_is_permanent() {
        let store = twin();
        let resolver = EndpointResolver::new(Arc::new(store.clone()), &config(60));

        let err = resolver.resolve(&TargetId::new("EC99")).await.unwrap_err();
        assert_eq!(err, ResolveError::UnknownTarget(TargetId::new("EC99")));
        assert_eq!(store.lookup_count(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_twin_is_transient_and_retried() {
        let store = twin();
        store.set_offline(true);
        let resolver = EndpointResolver::new(Arc::new(store.clone()), &config(60));

        let err = resolver.resolve(&TargetId::new("EC21")).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.lookup_count(), 3);
    }

    #[tokio::test]
    async fn test_cached_entry_survives_outage() {
        let store = twin();
        let resolver = EndpointResolver::new(Arc::new(store.clone()), &config(60));
        let target = TargetId::new("EC21");

        resolver.resolve(&target).await.unwrap();
        store.set_offline(true);
        assert!(resolver.resolve(&target).await.is_ok());
    }

    #[tokio::test]
    async fn test_refused_lookup_is_not_retried() {
        let store = Arc::new(RefusingStore::default());
        let resolver = EndpointResolver::new(store.clone(), &config(60));

        let err = resolver.resolve(&TargetId::new("EC21")).await.unwrap_err();
        assert!(matches!(err, ResolveError::LookupRefused { .. }));
        assert!(!err.is_transient());
        assert_eq!(store.lookups.load(Ordering::SeqCst), 1);
    }
}
