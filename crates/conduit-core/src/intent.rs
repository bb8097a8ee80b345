//! Intent types and builder.
//!
//! An Intent is an owner's semantic declaration of a desired outcome. It is
//! immutable once accepted; an update is a new version, never an in-place
//! mutation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::condition::ConditionTree;
use crate::error::ParseError;
use crate::parser;
use crate::types::{IntentId, OwnerId, Priority, TargetId};

/// A parsed intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    /// Identifier declared by the payload.
    pub id: IntentId,

    /// Party that submitted the intent and receives its reports.
    pub owner: OwnerId,

    /// Priority level for this intent.
    pub priority: Priority,

    /// Free-text description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Typed sub-goals, in source order.
    pub expectations: Vec<Expectation>,

    /// Graph nodes the parser did not consume, verbatim and in source order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fragments: Vec<serde_json::Value>,

    /// Creation timestamp declared by the payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    /// The submitted payload, kept verbatim for audit.
    #[serde(default)]
    pub raw: String,
}

/// Structural equality: every semantic field, ignoring the verbatim `raw` copy.
impl PartialEq for Intent {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.owner == other.owner
            && self.priority == other.priority
            && self.description == other.description
            && self.expectations == other.expectations
            && self.fragments == other.fragments
            && self.created_at == other.created_at
    }
}

/// Classified type of an expectation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectationKind {
    /// Deploy a workload on a target (e.g. a datacenter).
    WorkloadDeployment,
    /// Configure the network towards a target.
    NetworkConfiguration,
    /// Configure what handlers must report. Never routed on its own.
    Reporting,
    /// Anything outside the taxonomy; carries the original type name.
    Unknown(String),
}

impl ExpectationKind {
    /// Classify a graph type name by its local name.
    pub fn classify(type_name: &str) -> Self {
        match parser::local_name(type_name) {
            "DeploymentExpectation" | "WorkloadDeploymentExpectation" => {
                ExpectationKind::WorkloadDeployment
            }
            "NetworkExpectation" | "NetworkConfigurationExpectation" => {
                ExpectationKind::NetworkConfiguration
            }
            "ReportingExpectation" => ExpectationKind::Reporting,
            _ => ExpectationKind::Unknown(type_name.to_string()),
        }
    }

    /// Graph type name emitted by the serializer.
    pub fn type_name(&self) -> &str {
        match self {
            ExpectationKind::WorkloadDeployment => "DeploymentExpectation",
            ExpectationKind::NetworkConfiguration => "NetworkExpectation",
            ExpectationKind::Reporting => "ReportingExpectation",
            ExpectationKind::Unknown(original) => original,
        }
    }

    /// Short name used in logs and error messages.
    pub fn label(&self) -> &str {
        match self {
            ExpectationKind::WorkloadDeployment => "workload-deployment",
            ExpectationKind::NetworkConfiguration => "network-configuration",
            ExpectationKind::Reporting => "reporting",
            ExpectationKind::Unknown(_) => "unknown",
        }
    }

    /// Returns true for kinds that are delivered to a handler.
    pub fn is_routable(&self) -> bool {
        matches!(
            self,
            ExpectationKind::WorkloadDeployment | ExpectationKind::NetworkConfiguration
        )
    }
}

/// Reporting settings carried by a reporting expectation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportingConfig {
    /// How often observations should be reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,

    /// Lifecycle events the owner wants reported.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<String>,
}

/// One typed sub-goal of an intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expectation {
    /// Node id from the payload.
    pub id: String,

    /// Classified type.
    pub kind: ExpectationKind,

    /// Where the expectation must be realized. Reporting expectations have none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Conditions scoped to this expectation.
    #[serde(default)]
    pub conditions: ConditionTree,

    /// Present on reporting expectations only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reporting: Option<ReportingConfig>,
}

impl Expectation {
    /// Create an expectation of the given kind.
    pub fn new(id: impl Into<String>, kind: ExpectationKind) -> Self {
        let reporting = (kind == ExpectationKind::Reporting).then(ReportingConfig::default);
        Self {
            id: id.into(),
            kind,
            target: None,
            description: None,
            conditions: ConditionTree::new(),
            reporting,
        }
    }

    /// A workload-deployment expectation on `target`.
    pub fn workload(id: impl Into<String>, target: impl Into<TargetId>) -> Self {
        Self::new(id, ExpectationKind::WorkloadDeployment).target(target)
    }

    /// A network-configuration expectation on `target`.
    pub fn network(id: impl Into<String>, target: impl Into<TargetId>) -> Self {
        Self::new(id, ExpectationKind::NetworkConfiguration).target(target)
    }

    /// A target-less reporting expectation.
    pub fn reporting(id: impl Into<String>) -> Self {
        Self::new(id, ExpectationKind::Reporting)
    }

    /// Set the target.
    pub fn target(mut self, target: impl Into<TargetId>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Set the description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Replace the condition tree.
    pub fn conditions(mut self, conditions: ConditionTree) -> Self {
        self.conditions = conditions;
        self
    }
}

/// Builder for creating Intents with a fluent API.
#[derive(Debug, Default)]
pub struct IntentBuilder {
    id: Option<IntentId>,
    owner: OwnerId,
    priority: Priority,
    description: Option<String>,
    expectations: Vec<Expectation>,
    created_at: Option<DateTime<Utc>>,
}

impl IntentBuilder {
    /// Create a new IntentBuilder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the intent id.
    pub fn id(mut self, id: impl Into<IntentId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the owner.
    pub fn owner(mut self, owner: impl Into<OwnerId>) -> Self {
        self.owner = owner.into();
        self
    }

    /// Set the priority.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Add an expectation.
    pub fn expectation(mut self, expectation: Expectation) -> Self {
        self.expectations.push(expectation);
        self
    }

    /// Set the declared creation time.
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    /// Build the Intent, applying the same checks as the parser.
    pub fn build(self) -> std::result::Result<Intent, ParseError> {
        let id = self.id.ok_or(ParseError::MissingIntentId)?;
        if self.expectations.is_empty() {
            return Err(ParseError::NoExpectations(id.to_string()));
        }
        for e in &self.expectations {
            if e.kind != ExpectationKind::Reporting && e.target.is_none() {
                return Err(ParseError::MissingTarget {
                    expectation: e.id.clone(),
                    kind: e.kind.label().to_string(),
                });
            }
        }

        let mut intent = Intent {
            id,
            owner: self.owner,
            priority: self.priority,
            description: self.description,
            expectations: self.expectations,
            fragments: Vec::new(),
            created_at: self.created_at,
            raw: String::new(),
        };
        intent.raw = intent.to_graph().to_string();
        Ok(intent)
    }
}

impl Intent {
    /// Create a new IntentBuilder.
    pub fn builder() -> IntentBuilder {
        IntentBuilder::new()
    }

    /// Parse a graph payload. See [`parser::parse`].
    pub fn parse(raw: &str) -> std::result::Result<Intent, ParseError> {
        parser::parse(raw)
    }

    /// Serialize back to the graph payload format.
    pub fn to_graph(&self) -> serde_json::Value {
        parser::to_graph(self)
    }

    /// Expectations that are delivered to handlers.
    pub fn routable_expectations(&self) -> impl Iterator<Item = &Expectation> {
        self.expectations.iter().filter(|e| e.kind != ExpectationKind::Reporting)
    }

    /// Reporting expectations, copied into every sub-intent.
    pub fn reporting_expectations(&self) -> impl Iterator<Item = &Expectation> {
        self.expectations.iter().filter(|e| e.kind == ExpectationKind::Reporting)
    }

    /// SHA-256 of the canonical graph form, hex-encoded.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.to_graph().to_string().as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}
