//! WebSocket endpoint
//!
//! Identity is settled before the upgrade: a bearer token (query or header)
//! for registered subscribers, a display name for guests. The socket is then
//! handed off to a relay session.

use std::collections::HashMap;

use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{info, warn};

use crate::auth::{subscriber_from_request, IdentityRejection};
use crate::relay::Session;

use super::server::SharedState;

/// `GET /ws`: authenticate, upgrade, and start the session tasks.
pub async fn ws_handler(
    State(state): State<SharedState>,
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if state.relay.is_stopping() {
        return (StatusCode::GONE, "Server is shutting down").into_response();
    }

    let subscriber = match subscriber_from_request(&params, &headers) {
        Ok(subscriber) => subscriber,
        Err(IdentityRejection::InvalidToken) => {
            warn!("Forbidden request. Denied");
            return (StatusCode::FORBIDDEN, "Forbidden").into_response();
        }
        Err(IdentityRejection::MissingCredentials) => {
            warn!("Invalid request. Denied");
            return (StatusCode::BAD_REQUEST, "Login or userid required").into_response();
        }
    };

    info!(name = %subscriber.name, "Creating new session");

    let relay = state.relay.clone();
    ws.on_upgrade(move |socket| async move {
        if let Err(err) = Session::spawn(relay, socket, subscriber).await {
            // Shutdown raced the upgrade; dropping the socket closes it.
            warn!("Session rejected: {}", err);
        }
    })
}
