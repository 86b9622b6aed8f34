//! HTTP request handlers for the agent API

use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, StatusCode},
    response::{Html, IntoResponse, Json, Response},
};
use std::path::PathBuf;
use tracing::warn;

use super::server::ApiState;
use crate::core::{Error, Result};
use crate::system::{metrics, stats, MemorySnapshot};

const BUILTIN_DASHBOARD: &str = include_str!("../../assets/dashboard.html");

/// Source of the dashboard page
#[derive(Debug, Clone)]
pub enum DashboardTemplate {
    /// Page compiled into the binary
    Builtin,
    /// Page read from disk on every request
    File(PathBuf),
}

impl DashboardTemplate {
    /// Template for an optional configured path
    pub fn from_config(path: Option<PathBuf>) -> Self {
        path.map_or(Self::Builtin, Self::File)
    }

    /// Produce the page
    pub async fn render(&self) -> Result<String> {
        match self {
            Self::Builtin => Ok(BUILTIN_DASHBOARD.to_string()),
            Self::File(path) => tokio::fs::read_to_string(path).await.map_err(|e| {
                Error::render(format!("could not load dashboard template {}: {}", path.display(), e))
            }),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
    }
}

/// `GET /stats`
pub async fn stats_handler() -> Json<MemorySnapshot> {
    Json(stats::capture())
}

/// `GET /dashboard`
pub async fn dashboard_handler(State(state): State<ApiState>) -> Result<Html<String>> {
    match state.dashboard.render().await {
        Ok(page) => Ok(Html(page)),
        Err(e) => {
            warn!(error = %e, "dashboard render failed");
            Err(e)
        }
    }
}

/// `GET /metrics`
pub async fn metrics_handler(State(state): State<ApiState>) -> Result<Response> {
    let body = metrics::collect_metrics(&state.registry)?;
    Ok(([(CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response())
}
