//! HTTP surface: router, WebSocket upgrade, login, TLS

pub mod routes;
pub mod server;
mod tls;
pub mod websocket;

pub use server::{create_router, App, AppState, SharedState};
