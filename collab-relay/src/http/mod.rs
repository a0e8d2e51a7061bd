//! HTTP endpoints for collab-relay.
//!
//! Provides the WebSocket endpoint plus health checks and metrics.

pub mod health;
mod metrics;
mod ws;

use crate::server::CollabRelay;
use axum::{routing::get, Extension, Router};
use std::sync::Arc;

pub use health::HealthStatus;
pub use ws::ConnectParams;

/// Build the HTTP router with all endpoints.
pub fn build_router(relay: Arc<CollabRelay>) -> Router {
    Router::new()
        .route("/ws/:session_id", get(ws::ws_handler))
        .route("/health", get(health::health_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .layer(Extension(relay))
}
