//! # Conduit SDK
//!
//! Client SDK for Conduit nodes, plus the HTTP transports nodes and
//! handlers use to talk to each other.

pub mod client;
pub mod emitter;
pub mod stream;
pub mod transport;

pub use client::{ConduitClient, IntentResponse, ReportAck, SubIntentResponse, SubmitResponse};
pub use emitter::HttpReportEmitter;
pub use stream::{IntentStream, StateEvent};
pub use transport::HttpHandlerTransport;

/// Prelude module for common imports.
pub mod prelude {
    pub use crate::client::ConduitClient;
    pub use crate::stream::IntentStream;
    pub use conduit_core::prelude::*;
}
