//! # API Module
//!
//! HTTP surface of the agent.
//!
//! ## Endpoints Overview
//! - `GET /metrics` - Prometheus text exposition, unauthenticated
//! - `GET /stats` - Current memory snapshot as JSON, Basic auth
//! - `GET /dashboard` - HTML dashboard polling `/stats`, Basic auth

pub mod auth;
pub mod handlers;
pub mod server;

// Re-export commonly used items
pub use auth::Credentials;
pub use handlers::DashboardTemplate;
pub use server::{create_app, start_server, ApiState};
