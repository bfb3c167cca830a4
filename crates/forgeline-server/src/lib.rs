//! forgeline server
//!
//! HTTP/SSE boundary for refactoring pipelines: start sessions, stream their
//! progress, answer checkpoints and cancel. This is a library crate; the
//! server is started via `start_server()`.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, http::Method, routing::get, Json, Router};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use forgeline_core::{ForgelineConfig, SessionRegistry};

pub mod error;
pub mod routes;
pub mod types;

use types::HealthResponse;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Every live and recently finished session.
    pub registry: Arc<SessionRegistry>,
}

impl AppState {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Registry wired to the default collaborators for `config`.
    pub fn from_config(config: &ForgelineConfig) -> anyhow::Result<Self> {
        Ok(Self::new(Arc::new(SessionRegistry::from_config(config)?)))
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .nest("/api", routes::api_router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the server and block until ctrl-c.
pub async fn start_server(config: ForgelineConfig) -> anyhow::Result<()> {
    start_server_with_shutdown(config, shutdown_signal()).await
}

/// Start the server and block until `shutdown` resolves. Live sessions are
/// cancelled on shutdown so their event streams end and connections drain.
pub async fn start_server_with_shutdown(
    config: ForgelineConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", config.server.port).parse()?;
    let state = AppState::from_config(&config)?;
    let sweeper = state.registry.spawn_sweeper(config.sweep_interval());

    let registry = Arc::clone(&state.registry);
    let app = build_router(state);

    tracing::info!("forgeline server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            tracing::info!("Shutting down, cancelling live sessions");
            registry.cancel_all();
        })
        .await;

    sweeper.abort();
    served?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for ctrl+c: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_sessions: state.registry.active_count(),
    })
}
