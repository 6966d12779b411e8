//! Configuration management for the relay
//!
//! All options come from the environment (optionally seeded from a dotenv
//! file), mirroring how the service is deployed.

pub mod loader;
mod schema;

pub use loader::{from_env, load};
pub use schema::*;
