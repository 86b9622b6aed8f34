//! HTTP server implementation for the agent API

use axum::{middleware, routing::get, Router};
use prometheus::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use super::auth::{self, Credentials};
use super::handlers::{self, DashboardTemplate};
use crate::core::Result;

/// Shared state of the HTTP handlers
#[derive(Clone)]
pub struct ApiState {
    /// Credentials for the protected routes
    pub credentials: Arc<Credentials>,
    /// Registry rendered on `/metrics`
    pub registry: Registry,
    /// Dashboard page source
    pub dashboard: Arc<DashboardTemplate>,
}

impl ApiState {
    /// Bundle the handler dependencies
    pub fn new(credentials: Credentials, registry: Registry, dashboard: DashboardTemplate) -> Self {
        Self {
            credentials: Arc::new(credentials),
            registry,
            dashboard: Arc::new(dashboard),
        }
    }
}

/// Creates the application router with all routes and middleware
pub fn create_app(state: ApiState) -> Router {
    let protected = Router::new()
        .route("/stats", get(handlers::stats_handler))
        .route("/dashboard", get(handlers::dashboard_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_basic_auth));

    Router::new()
        .route("/metrics", get(handlers::metrics_handler))
        .merge(protected)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// Serve the API on `addr` until `shutdown` is cancelled
pub async fn start_server(addr: SocketAddr, state: ApiState, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Starting HTTP server on {}", addr);
    tracing::info!("Dashboard available at http://{}/dashboard", addr);

    axum::serve(listener, create_app(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!("HTTP server stopped");
    Ok(())
}
