//! # Conduit Handler
//!
//! The handler side of sub-intent delivery: the adapter contract, an
//! idempotent session table, a reference leaf adapter and a forwarding
//! adapter.

pub mod adapter;
pub mod emitter;
pub mod forwarding;
pub mod local;
pub mod protocol;
pub mod reference;
pub mod session;

pub use adapter::{HandlerAdapter, HandlerRole};
pub use emitter::{ChannelEmitter, ReportEmitter};
pub use forwarding::ForwardingAdapter;
pub use local::LocalTransport;
pub use protocol::{WithdrawAck, IDEMPOTENCY_KEY_HEADER};
pub use reference::{Executor, ReferenceAdapter, ReferenceConfig, StaticExecutor};
pub use session::{AdapterSessions, Claim, SessionState};
