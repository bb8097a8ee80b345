//! Resolved handler endpoints.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::intent::ExpectationKind;
use crate::types::TargetId;

/// Which expectation kinds a handler can execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Workload,
    Network,
    Both,
}

impl Capability {
    /// Returns true if a handler with this capability can execute `kind`.
    pub fn supports(&self, kind: &ExpectationKind) -> bool {
        match kind {
            ExpectationKind::WorkloadDeployment => {
                matches!(self, Capability::Workload | Capability::Both)
            }
            ExpectationKind::NetworkConfiguration => {
                matches!(self, Capability::Network | Capability::Both)
            }
            ExpectationKind::Reporting | ExpectationKind::Unknown(_) => false,
        }
    }
}

/// A live handler address for one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerEndpoint {
    /// The target this endpoint serves.
    pub target: TargetId,

    /// Base address, e.g. `http://ec21-handler:3000`.
    pub address: String,

    /// Kinds the handler can execute.
    pub capability: Capability,
}

impl HandlerEndpoint {
    /// Create an endpoint.
    pub fn new(target: impl Into<TargetId>, address: impl Into<String>, capability: Capability) -> Self {
        Self {
            target: target.into(),
            address: address.into(),
            capability,
        }
    }

    /// URL of the handler's sub-intent intake.
    pub fn accept_url(&self) -> String {
        format!("{}/api/v1/subintents", self.address.trim_end_matches('/'))
    }

    /// URL used to withdraw one sub-intent.
    pub fn withdraw_url(&self, sub_intent_id: Uuid) -> String {
        format!("{}/{}", self.accept_url(), sub_intent_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_support() {
        assert!(Capability::Both.supports(&ExpectationKind::NetworkConfiguration));
        assert!(Capability::Workload.supports(&ExpectationKind::WorkloadDeployment));
        assert!(!Capability::Workload.supports(&ExpectationKind::NetworkConfiguration));
        assert!(!Capability::Both.supports(&ExpectationKind::Reporting));
    }

    #[test]
    fn test_urls() {
        let endpoint = HandlerEndpoint::new("EC21", "http://ec21:3000/", Capability::Workload);
        assert_eq!(endpoint.accept_url(), "http://ec21:3000/api/v1/subintents");
        let id = Uuid::nil();
        assert_eq!(
            endpoint.withdraw_url(id),
            format!("http://ec21:3000/api/v1/subintents/{}", id)
        );
    }
}
