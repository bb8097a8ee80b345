//! # Conduit Twin
//!
//! Read/write contract of the digital twin store: the durable graph store of
//! every persisted sub-intent and report, and the registry the endpoint
//! resolver queries for handler addresses.

pub mod http;
pub mod record;
pub mod store;

pub use http::HttpTwinStore;
pub use record::{Appended, TwinEntry, TwinRecord};
pub use store::{InMemoryTwinStore, TwinStore};
