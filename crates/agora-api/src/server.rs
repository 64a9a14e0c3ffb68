//! API server implementation.
//!
//! Wires the store, schema registry, dispatcher, and background runner into
//! an axum application with health/readiness probes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Json;
use serde::Serialize;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use agora_core::{AccountId, Error, Result};
use agora_flow::{Dispatcher, Runner, RunnerConfig, SchemaRegistry};
use agora_store::Store;

use crate::config::{Config, CorsConfig};
use crate::routes;

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// Service status.
    pub status: String,
}

/// Readiness check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ReadyResponse {
    /// Service readiness status.
    pub ready: bool,
    /// Optional message about readiness state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Shared application state for all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// The relational store (single source of truth).
    pub store: Store,
    /// Compiled capability schemas.
    pub registry: Arc<SchemaRegistry>,
    /// Task dispatch orchestrator.
    pub dispatcher: Arc<Dispatcher>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Creates new application state, constructing the dispatcher.
    #[must_use]
    pub fn new(config: Config, store: Store, registry: Arc<SchemaRegistry>) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            Arc::clone(&registry),
            config.public_base_url.clone(),
        ));
        Self {
            config,
            store,
            registry,
            dispatcher,
        }
    }
}

/// Builds the full application router.
#[must_use]
pub fn router(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .nest("/v1", routes::v1_routes(&state))
        .layer(TraceLayer::new_for_http());

    if let Some(cors) = cors_layer(&state.config.cors) {
        app = app.layer(cors);
    }
    app.with_state(state)
}

/// The Agora API server.
pub struct Server {
    state: Arc<AppState>,
}

impl Server {
    /// Creates a server from configuration and wired dependencies.
    #[must_use]
    pub fn new(config: Config, store: Store, registry: Arc<SchemaRegistry>) -> Self {
        Self {
            state: Arc::new(AppState::new(config, store, registry)),
        }
    }

    /// Returns the shared application state (tests, embedding).
    #[must_use]
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Starts the background runner and serves HTTP until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot bind or the server fails.
    pub async fn serve(self) -> Result<()> {
        let config = &self.state.config;
        let runner = Runner::new(
            self.state.store.clone(),
            Arc::clone(&self.state.dispatcher),
            RunnerConfig {
                concurrency: config.runner_concurrency,
                poll_interval: Duration::from_millis(config.runner_poll_interval_ms),
            },
        )
        .start();

        let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::internal(format!("failed to bind {addr}: {e}")))?;
        tracing::info!(addr = %addr, "agora-api listening");

        let app = router(Arc::clone(&self.state));
        let result = axum::serve(listener, app)
            .await
            .map_err(|e| Error::internal(format!("server error: {e}")));

        runner.join().await;
        result
    }
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    // The seeded platform account doubles as a storage liveness probe.
    match state.store.get_account(AccountId::platform()) {
        Ok(_) => (
            StatusCode::OK,
            Json(ReadyResponse {
                ready: true,
                message: None,
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                ready: false,
                message: Some(e.to_string()),
            }),
        ),
    }
}

fn cors_layer(config: &CorsConfig) -> Option<CorsLayer> {
    if config.allowed_origins.is_empty() {
        return None;
    }
    let layer = if config.allowed_origins.iter().any(|origin| origin == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    };
    Some(layer.max_age(Duration::from_secs(config.max_age_seconds)))
}
