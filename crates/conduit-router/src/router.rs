//! Intent splitting.
//!
//! Non-reporting expectations are grouped by (kind, target), in order of
//! first appearance. Each group becomes one sub-intent carrying a verbatim
//! copy of every reporting expectation. Any unclassified expectation fails
//! the whole route.

use std::collections::HashMap;
use std::sync::Arc;

use conduit_core::{
    ExpectationKind, HandlerEndpoint, Intent, ResolveError, RouteError, SubIntent, TargetId,
};
use futures::future::join_all;

use crate::resolver::EndpointResolver;

/// A sub-intent paired with the endpoint it goes to.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedSubIntent {
    pub sub_intent: SubIntent,
    pub endpoint: HandlerEndpoint,
}

/// Splits intents and resolves where each part goes.
pub struct IntentRouter {
    resolver: Arc<EndpointResolver>,
}

impl IntentRouter {
    /// Create a router using the given resolver.
    pub fn new(resolver: Arc<EndpointResolver>) -> Self {
        Self { resolver }
    }

    /// The resolver this router uses.
    pub fn resolver(&self) -> &Arc<EndpointResolver> {
        &self.resolver
    }

    /// Classify and group without resolving.
    ///
    /// Returns the distinct (kind, target) pairs in first-appearance order.
    pub fn plan(intent: &Intent) -> Result<Vec<(ExpectationKind, TargetId)>, RouteError> {
        let mut groups: Vec<(ExpectationKind, TargetId)> = Vec::new();

        for expectation in intent.routable_expectations() {
            if let ExpectationKind::Unknown(type_name) = &expectation.kind {
                return Err(RouteError::UnclassifiedExpectation {
                    expectation: expectation.id.clone(),
                    type_name: type_name.clone(),
                });
            }
            // The parser and builder both guarantee a target here.
            let Some(target) = &expectation.target else {
                continue;
            };
            let key = (expectation.kind.clone(), target.clone());
            if !groups.contains(&key) {
                groups.push(key);
            }
        }

        if groups.is_empty() {
            return Err(RouteError::NothingToRoute(intent.id.to_string()));
        }
        Ok(groups)
    }

    /// Split `intent` (at `version`) into sub-intents and resolve their endpoints.
    ///
    /// All or nothing: on error no sub-intent exists and nothing may be dispatched.
    pub async fn route(
        &self,
        intent: &Intent,
        version: u32,
    ) -> Result<Vec<RoutedSubIntent>, RouteError> {
        let groups = Self::plan(intent)?;

        let mut targets: Vec<&TargetId> = Vec::new();
        for (_, target) in &groups {
            if !targets.contains(&target) {
                targets.push(target);
            }
        }

        let lookups = join_all(targets.iter().map(|t| self.resolver.resolve(t))).await;
        let mut endpoints: HashMap<&TargetId, HandlerEndpoint> = HashMap::new();
        for (target, lookup) in targets.iter().zip(lookups) {
            let endpoint = lookup.map_err(|e| match e {
                ResolveError::UnknownTarget(t) => RouteError::UnknownTarget(t),
                ResolveError::TransientResolutionFailure { target, message } => {
                    RouteError::ResolutionUnavailable { target, message }
                }
                ResolveError::LookupRefused { target, message } => {
                    RouteError::ResolutionRefused { target, message }
                }
            })?;
            endpoints.insert(*target, endpoint);
        }

        let mut routed = Vec::with_capacity(groups.len());
        for (kind, target) in &groups {
            let Some(endpoint) = endpoints.get(target) else {
                continue;
            };
            if !endpoint.capability.supports(kind) {
                return Err(RouteError::UnsupportedTarget {
                    target: target.clone(),
                    kind: kind.label().to_string(),
                });
            }
            routed.push(RoutedSubIntent {
                sub_intent: SubIntent::project(intent, version, kind, target),
                endpoint: endpoint.clone(),
            });
        }

        tracing::debug!(
            intent_id = %intent.id,
            version,
            sub_intents = routed.len(),
            "intent routed"
        );
        Ok(routed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::ResolverConfig;
    use conduit_core::{Capability, Expectation, RetryPolicy};
    use conduit_twin::InMemoryTwinStore;

    fn router(store: &InMemoryTwinStore) -> IntentRouter {
        let config = ResolverConfig {
            retry: RetryPolicy::new(2).with_initial_delay(1).with_max_delay(1),
            ..Default::default()
        };
        IntentRouter::new(Arc::new(EndpointResolver::new(Arc::new(store.clone()), &config)))
    }

    fn twin() -> InMemoryTwinStore {
        InMemoryTwinStore::with_endpoints([
            HandlerEndpoint::new("EC21", "http://ec21:3000", Capability::Workload),
            HandlerEndpoint::new("EC22", "http://ec22:3000", Capability::Both),
            HandlerEndpoint::new("network", "http://net:3000", Capability::Network),
        ])
    }

    #[tokio::test]
    async fn test_combined_intent_splits_in_two() {
        let intent = Intent::builder()
            .id("I1")
            .expectation(Expectation::workload("de1", "EC21"))
            .expectation(Expectation::network("ne1", "network"))
            .expectation(Expectation::reporting("re1"))
            .build()
            .unwrap();

        let routed = router(&twin()).route(&intent, 1).await.unwrap();
        assert_eq!(routed.len(), 2);

        assert_eq!(routed[0].sub_intent.kind, ExpectationKind::WorkloadDeployment);
        assert_eq!(routed[0].endpoint.address, "http://ec21:3000");
        assert_eq!(routed[1].sub_intent.kind, ExpectationKind::NetworkConfiguration);
        assert_eq!(routed[1].endpoint.address, "http://net:3000");
        assert_ne!(routed[0].sub_intent.id, routed[1].sub_intent.id);

        for r in &routed {
            assert_eq!(r.sub_intent.routed_expectations().count(), 1);
            assert_eq!(r.sub_intent.reporting_expectations().count(), 1);
        }
    }

    #[tokio::test]
    async fn test_one_sub_intent_per_distinct_pair() {
        let intent = Intent::builder()
            .id("I2")
            .expectation(Expectation::workload("de1", "EC21"))
            .expectation(Expectation::workload("de2", "EC22"))
            .expectation(Expectation::workload("de3", "EC21"))
            .expectation(Expectation::network("ne1", "EC22"))
            .build()
            .unwrap();

        let routed = router(&twin()).route(&intent, 1).await.unwrap();
        let pairs: Vec<(String, &str)> = routed
            .iter()
            .map(|r| (r.sub_intent.kind.label().to_string(), r.sub_intent.target.as_str()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("workload-deployment".to_string(), "EC21"),
                ("workload-deployment".to_string(), "EC22"),
                ("network-configuration".to_string(), "EC22"),
            ]
        );

        let ids: Vec<&str> = routed[0]
            .sub_intent
            .routed_expectations()
            .map(|e| e.id.as_str())
            .collect();
        assert_eq!(ids, vec!["de1", "de3"]);
    }

    #[tokio::test]
    async fn test_unknown_expectation_fails_whole_route() {
        let intent = Intent::builder()
            .id("I3")
            .expectation(Expectation::workload("de1", "EC21"))
            .expectation(
                Expectation::new("pe1", ExpectationKind::Unknown("icm:PropertyExpectation".into()))
                    .target("EC21"),
            )
            .build()
            .unwrap();

        let err = router(&twin()).route(&intent, 1).await.unwrap_err();
        assert!(matches!(err, RouteError::UnclassifiedExpectation { .. }));
    }

    #[tokio::test]
    async fn test_unknown_target_fails_route() {
        let intent = Intent::builder()
            .id("I4")
            .expectation(Expectation::workload("de1", "EC21"))
            .expectation(Expectation::workload("de2", "EC99"))
            .build()
            .unwrap();

        let err = router(&twin()).route(&intent, 1).await.unwrap_err();
        assert_eq!(err, RouteError::UnknownTarget(TargetId::new("EC99")));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_capability_mismatch() {
        let intent = Intent::builder()
            .id("I5")
            .expectation(Expectation::network("ne1", "EC21"))
            .build()
            .unwrap();

        let err = router(&twin()).route(&intent, 1).await.unwrap_err();
        assert!(matches!(err, RouteError::UnsupportedTarget { .. }));
    }

    #[tokio::test]
    async fn test_twin_outage_is_transient() {
        let store = twin();
        store.set_offline(true);
        let intent = Intent::builder()
            .id("I6")
            .expectation(Expectation::workload("de1", "EC21"))
            .build()
            .unwrap();

        let err = router(&store).route(&intent, 1).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_reporting_only_intent_has_nothing_to_route() {
        let intent = Intent::builder()
            .id("I7")
            .expectation(Expectation::reporting("re1"))
            .build()
            .unwrap();
        assert!(matches!(
            IntentRouter::plan(&intent),
            Err(RouteError::NothingToRoute(_))
        ));
    }
}
