//! HTTP route handlers

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::auth::{issue_token, verify_password, TokenMeta};
use crate::workers::WorkerSupervisor;

use super::server::SharedState;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub name: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<TokenMeta>,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub status: String,
}

impl LoginResponse {
    fn failed(name: &str) -> Self {
        Self {
            token: None,
            name: name.to_string(),
            email: None,
            status: "failed".to_string(),
        }
    }
}

/// `POST /login`: verify credentials and issue a bearer token.
pub async fn login(
    State(state): State<SharedState>,
    Json(request): Json<LoginRequest>,
) -> impl IntoResponse {
    let stored = match state.subscriber_store.get_by_name(&request.name).await {
        Ok(stored) => stored,
        Err(err) => {
            error!("Login lookup failed: {}", err);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(LoginResponse::failed(&request.name)),
            );
        }
    };

    let Some(subscriber) = stored else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(LoginResponse::failed(&request.name)),
        );
    };

    let valid = subscriber
        .password_hash
        .as_deref()
        .map(|hash| verify_password(&request.password, hash))
        .unwrap_or(false);
    if !valid {
        return (
            StatusCode::UNAUTHORIZED,
            Json(LoginResponse::failed(&request.name)),
        );
    }

    match issue_token(&subscriber) {
        Ok(token) => (
            StatusCode::OK,
            Json(LoginResponse {
                token: Some(token),
                name: subscriber.name,
                email: subscriber.email,
                status: "success".to_string(),
            }),
        ),
        Err(err) => {
            error!("Token issue failed: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(LoginResponse::failed(&request.name)),
            )
        }
    }
}

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "healthy" }))
}

/// Live counters for the loopback debug endpoint.
pub async fn debug_stats(State(state): State<SharedState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "sessions": state.relay.session_count().await,
        "channels": state.relay.channel_count().await,
        "workers": WorkerSupervisor::instance().worker_count(),
        "stopping": state.relay.is_stopping(),
    }))
}
