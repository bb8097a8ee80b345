//! HTTP and WebSocket API.

pub mod endpoints;
pub mod handler;
pub mod health;
pub mod intent;
pub mod report;
pub mod ws;
