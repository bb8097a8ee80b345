//! The handler adapter contract.

use async_trait::async_trait;
use conduit_core::{Acceptance, Capability, ConduitError, SubIntent};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where an adapter sits in the handler chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerRole {
    /// Executes sub-intents itself and persists them to the twin store.
    #[default]
    Leaf,
    /// Hands sub-intents on to another handler. Never persists.
    Forwarding,
}

impl HandlerRole {
    /// Returns true if accepted sub-intents must be written to the twin store.
    pub fn persists(&self) -> bool {
        matches!(self, HandlerRole::Leaf)
    }
}

/// Trait for handler adapters.
///
/// `accept` must answer quickly; realization happens in the background and
/// is reported through a [`ReportEmitter`](crate::emitter::ReportEmitter).
/// Accepting an already known sub-intent id returns the first answer
/// without side effects.
#[async_trait]
pub trait HandlerAdapter: Send + Sync {
    /// Position in the handler chain.
    fn role(&self) -> HandlerRole;

    /// Expectation kinds this adapter executes.
    fn capability(&self) -> Capability;

    /// Take or refuse a sub-intent.
    ///
    /// `Err` means "try again later"; nothing was recorded.
    async fn accept(&self, sub_intent: SubIntent) -> Result<Acceptance, ConduitError>;

    /// Stop realizing a sub-intent.
    ///
    /// Returns `None` if the id is unknown, otherwise whether this call
    /// changed anything.
    async fn withdraw(&self, sub_intent_id: Uuid) -> Option<bool>;
}
