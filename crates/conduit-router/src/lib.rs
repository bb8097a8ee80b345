//! # Conduit Router
//!
//! Splits intents into per-target sub-intents, resolves handler endpoints
//! through the twin store and delivers sub-intents to handlers.

pub mod dispatch;
pub mod resolver;
pub mod router;
pub mod transport;

pub use dispatch::{DispatchConfig, DispatchOutcome, Delivery, Dispatcher};
pub use resolver::{EndpointResolver, ResolverConfig};
pub use router::{IntentRouter, RoutedSubIntent};
pub use transport::HandlerTransport;
