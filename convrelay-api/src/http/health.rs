//! Health check endpoints
//!
//! `/health` serves monitoring probes; `/status` is the cross-origin
//! reachability check front-end integrations hit before connecting.

use axum::{response::IntoResponse, routing::get, Router};

use crate::http::AppState;

/// Health check router
pub fn create_health_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status_check))
}

/// Basic health check (always returns OK if server is running)
pub async fn health_check() -> impl IntoResponse {
    "OK"
}

/// Reachability check for browser clients
pub async fn status_check() -> impl IntoResponse {
    "Hello, cross-origin world!"
}
