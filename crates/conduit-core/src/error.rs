//! Error types for the Conduit pipeline.
//!
//! Every failure is scoped to one intent or sub-intent. Parse and route
//! failures go back to the submitter synchronously; delivery and report
//! failures only ever show up as a degraded lifecycle state.

use thiserror::Error;
use uuid::Uuid;

use crate::types::TargetId;

/// A payload could not be turned into an [`Intent`](crate::Intent).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("payload has no @graph array")]
    MissingGraph,

    #[error("graph entry {index} is not an object")]
    MalformedNode { index: usize },

    #[error("node id {0} is declared more than once")]
    DuplicateNode(String),

    #[error("payload contains no Intent node")]
    MissingIntent,

    #[error("payload declares {0} Intent nodes, expected exactly one")]
    MultipleIntents(usize),

    #[error("Intent node has no @id")]
    MissingIntentId,

    #[error("Intent {0} has no expectations")]
    NoExpectations(String),

    #[error("node {0} is referenced but never defined")]
    DanglingReference(String),

    #[error("expectation {0} is referenced more than once")]
    SharedExpectation(String),

    #[error("expectation {expectation} ({kind}) has no target")]
    MissingTarget { expectation: String, kind: String },

    #[error("condition {0} is referenced more than once or forms a cycle")]
    SharedCondition(String),

    #[error("condition {0} has no operator")]
    MissingOperator(String),

    #[error("condition {condition} has unrecognized operator '{operator}'")]
    UnknownOperator { condition: String, operator: String },

    #[error("invalid {property} on {node}: {message}")]
    InvalidProperty {
        node: String,
        property: String,
        message: String,
    },
}

/// Endpoint resolution failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolveError {
    /// The twin store affirmatively has no such target. Permanent.
    #[error("unknown target {0}")]
    UnknownTarget(TargetId),

    /// The twin store could not be reached in time. Retryable.
    #[error("transient failure resolving {target}: {message}")]
    TransientResolutionFailure { target: TargetId, message: String },

    /// The twin store answered the lookup with a permanent error.
    #[error("twin store refused to resolve {target}: {message}")]
    LookupRefused { target: TargetId, message: String },
}

impl ResolveError {
    /// Returns true if retrying the lookup can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ResolveError::TransientResolutionFailure { .. })
    }
}

/// An intent could not be routed. Nothing is dispatched when this is returned.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RouteError {
    #[error("expectation {expectation} has unclassified type '{type_name}'")]
    UnclassifiedExpectation {
        expectation: String,
        type_name: String,
    },

    #[error("intent {0} has no routable expectations")]
    NothingToRoute(String),

    #[error("unknown target {0}")]
    UnknownTarget(TargetId),

    #[error("handler for {target} cannot execute {kind} expectations")]
    UnsupportedTarget { target: TargetId, kind: String },

    #[error("target {target} could not be resolved: {message}")]
    ResolutionUnavailable { target: TargetId, message: String },

    #[error("target {target} was refused by the twin store: {message}")]
    ResolutionRefused { target: TargetId, message: String },
}

impl RouteError {
    /// Returns true if resubmitting the same payload later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, RouteError::ResolutionUnavailable { .. })
    }
}

/// A sub-intent delivery attempt failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeliveryError {
    /// The handler explicitly refused the sub-intent.
    #[error("delivery rejected: {reason}")]
    Rejected { reason: String },

    /// The handler did not answer within the delivery timeout.
    #[error("delivery timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    /// Connection-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The handler answered with an unexpected HTTP status.
    #[error("handler answered {status}: {body}")]
    Status { status: u16, body: String },
}

impl DeliveryError {
    /// Returns true if the delivery should be attempted again.
    pub fn is_retryable(&self) -> bool {
        match self {
            DeliveryError::Rejected { .. } => false,
            DeliveryError::Timeout { .. } | DeliveryError::Transport(_) => true,
            DeliveryError::Status { status, .. } => *status >= 500 || *status == 429,
        }
    }
}

/// An inbound report was dropped. Never surfaced to the reporter as a fault.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReportValidationError {
    #[error("report references unknown sub-intent {0}")]
    UnknownSubIntent(Uuid),

    #[error("duplicate report {sequence} for sub-intent {sub_intent_id}")]
    Duplicate { sub_intent_id: Uuid, sequence: u64 },

    #[error("report {sequence} for sub-intent {sub_intent_id} regresses past {last}")]
    Regressed {
        sub_intent_id: Uuid,
        sequence: u64,
        last: u64,
    },
}

/// Twin store access failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TwinError {
    #[error("twin store unreachable: {0}")]
    Unreachable(String),

    #[error("twin store refused the request ({status}): {message}")]
    Refused { status: u16, message: String },

    #[error("twin store payload error: {0}")]
    Serialization(String),
}

impl TwinError {
    /// Returns true if the request may succeed when retried.
    pub fn is_transient(&self) -> bool {
        match self {
            TwinError::Unreachable(_) => true,
            TwinError::Refused { status, .. } => *status >= 500,
            TwinError::Serialization(_) => false,
        }
    }
}

/// Main error type for Conduit operations.
#[derive(Error, Debug, Clone)]
pub enum ConduitError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error(transparent)]
    Report(#[from] ReportValidationError),

    #[error(transparent)]
    Twin(#[from] TwinError),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Resource not found.
    #[error("Resource not found: {resource_type} with id {id}")]
    NotFound { resource_type: String, id: String },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Connection error.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A remote API answered with an error status.
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Internal error (should not happen).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConduitError {
    /// Returns true if this error is recoverable by retrying.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ConduitError::Resolve(e) => e.is_transient(),
            ConduitError::Route(e) => e.is_transient(),
            ConduitError::Delivery(e) => e.is_retryable(),
            ConduitError::Twin(e) => e.is_transient(),
            ConduitError::Connection(_) => true,
            ConduitError::Api { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// Convenience Result type for Conduit operations.
pub type Result<T> = std::result::Result<T, ConduitError>;

impl From<serde_json::Error> for ConduitError {
    fn from(err: serde_json::Error) -> Self {
        ConduitError::Serialization(err.to_string())
    }
}
