//! # Conduit Core
//!
//! Semantic data model shared by every Conduit component.
//!
//! This crate provides:
//! - [`Intent`] - an owner's declaration of a desired outcome, with its
//!   [`Expectation`]s and their [`ConditionTree`]s
//! - [`parser`] - graph payload to [`Intent`] and back
//! - [`SubIntent`] - the per-target projection delivered to one handler
//! - [`Report`] - lifecycle and observation reports flowing back
//! - [`HandlerEndpoint`] - a resolved handler address
//! - [`ConduitError`] - the error taxonomy of the pipeline

pub mod condition;
pub mod endpoint;
pub mod error;
pub mod intent;
pub mod parser;
pub mod report;
pub mod retry;
pub mod subintent;
pub mod types;

// Re-exports for convenience
pub use condition::{Condition, ConditionTree, Operator, Quantity};
pub use endpoint::{Capability, HandlerEndpoint};
pub use error::{
    ConduitError, DeliveryError, ParseError, ReportValidationError, ResolveError, Result,
    RouteError, TwinError,
};
pub use intent::{Expectation, ExpectationKind, Intent, IntentBuilder, ReportingConfig};
pub use report::{
    LifecycleState, ObservationReport, Report, ReportBody, ReportEnvelope, StatePrecedence,
    StateReport, UpdateState,
};
pub use retry::RetryPolicy;
pub use subintent::{Acceptance, DeliveryStatus, SubIntent};
pub use types::*;

/// Prelude module for common imports
pub mod prelude {
    pub use crate::condition::{Condition, ConditionTree, Operator, Quantity};
    pub use crate::endpoint::{Capability, HandlerEndpoint};
    pub use crate::error::{ConduitError, Result};
    pub use crate::intent::{Expectation, ExpectationKind, Intent, IntentBuilder};
    pub use crate::report::{LifecycleState, Report, ReportBody};
    pub use crate::subintent::{Acceptance, SubIntent};
    pub use crate::types::{IntentId, OwnerId, Priority, TargetId};
}
