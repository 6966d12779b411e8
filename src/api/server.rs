//! HTTP server wiring and lifecycle

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::bus::Bus;
use crate::config::{Config, CorsConfig};
use crate::error::Result;
use crate::relay::RelayServer;
use crate::store::{ChannelStore, SubscriberStore};

use super::{routes, tls, websocket};

/// Application state shared across handlers
pub struct AppState {
    pub relay: Arc<RelayServer>,
    pub subscriber_store: Arc<dyn SubscriberStore>,
    pub config: Config,
}

pub type SharedState = Arc<AppState>;

/// Create the router with all routes
pub fn create_router(state: SharedState) -> Router {
    let cors = cors_layer(&state.config.cors);
    Router::new()
        .route("/ws", get(websocket::ws_handler))
        .route("/login", post(routes::login))
        .route("/health", get(routes::health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn cors_layer(config: &CorsConfig) -> CorsLayer {
    if config.is_permissive() {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring unparseable allowed origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
}

/// One bound, serving relay node.
pub struct App {
    pub addr: SocketAddr,
    relay: Arc<RelayServer>,
    shutdown: CancellationToken,
    server_task: JoinHandle<()>,
    debug_task: Option<JoinHandle<()>>,
}

impl App {
    /// Start the relay control plane, bind the listener, and serve.
    pub async fn bind(
        config: Config,
        bus: Arc<dyn Bus>,
        channel_store: Arc<dyn ChannelStore>,
        subscriber_store: Arc<dyn SubscriberStore>,
    ) -> Result<App> {
        let relay = RelayServer::new(
            bus,
            channel_store,
            subscriber_store.clone(),
            config.database.record_transient,
        );
        relay.start().await?;

        let state: SharedState = Arc::new(AppState {
            relay: relay.clone(),
            subscriber_store,
            config: config.clone(),
        });
        let router = create_router(state.clone());

        let bind_addr = format!("{}:{}", config.server.host, config.server.port);
        let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        info!(
            "Server running in the '{}' environment. Listening on {}",
            config.env, addr
        );

        let server_task = if config.is_development() {
            let token = shutdown.clone();
            tokio::spawn(async move {
                let serve = axum::serve(listener, router)
                    .with_graceful_shutdown(async move { token.cancelled().await });
                if let Err(err) = serve.await {
                    error!("Error starting server: {}", err);
                }
            })
        } else {
            let tls_config = tls::load_server_config(".ssh/cert.pem", ".ssh/key.pem")?;
            let token = shutdown.clone();
            tokio::spawn(async move {
                tls::serve(listener, tls_config, router, token).await;
            })
        };

        let debug_task = config
            .is_development()
            .then(|| spawn_debug_listener(state.clone()));

        Ok(App {
            addr,
            relay,
            shutdown,
            server_task,
            debug_task,
        })
    }

    pub fn relay(&self) -> Arc<RelayServer> {
        self.relay.clone()
    }

    /// Stop the relay graph first so sessions flush close frames, then the
    /// HTTP listener.
    pub async fn shutdown(self) {
        self.relay.stop().await;
        self.shutdown.cancel();
        let _ = self.server_task.await;
        if let Some(task) = self.debug_task {
            task.abort();
            let _ = task.await;
        }
    }
}

/// Loopback-only introspection endpoint, development builds of the
/// deployment only.
fn spawn_debug_listener(state: SharedState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let router = Router::new()
            .route("/debug/health", get(routes::health))
            .route("/debug/stats", get(routes::debug_stats))
            .with_state(state);
        match tokio::net::TcpListener::bind("127.0.0.1:6060").await {
            Ok(listener) => {
                if let Err(err) = axum::serve(listener, router).await {
                    error!("Debug listener error: {}", err);
                }
            }
            Err(err) => {
                // Another local node already exposes the endpoint.
                warn!("Debug listener bind failed: {}", err);
            }
        }
    })
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App").field("addr", &self.addr).finish()
    }
}
