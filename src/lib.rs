//! chat-relay - multi-node WebSocket chat fan-out over a pub/sub bus
//!
//! This is the library interface for the relay, allowing integration tests
//! and tooling to run nodes programmatically.

pub mod api;
pub mod auth;
pub mod bus;
pub mod config;
pub mod error;
pub mod logging;
pub mod relay;
pub mod store;
pub mod workers;

pub use config::Config;
pub use error::Error;
pub use relay::RelayServer;
