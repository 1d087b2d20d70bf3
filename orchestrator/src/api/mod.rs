//! API module for the secbox orchestrator
//!
//! Provides endpoints for:
//! - One-shot command execution
//! - Container lifecycle control
//! - Background task control
//! - The interactive terminal WebSocket and its session listing
//! - Health checks and metrics

mod error;
pub mod handlers;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use crate::AppState;

pub use error::ApiError;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let terminal_path = state.config.terminal.path.clone();

    Router::new()
        // Health check
        .route("/health", get(handlers::health::health_check))
        // Prometheus metrics
        .route("/metrics", get(crate::metrics::metrics_handler))
        // Terminal WebSocket
        .route(&terminal_path, get(handlers::terminal::terminal_upgrade))
        .nest("/api", api_routes())
        .with_state(state)
}

/// JSON API routes
fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/execute", post(handlers::execute::execute_command))
        .route("/vm", post(handlers::vm::vm_action))
        .route("/tasks", post(handlers::tasks::task_action))
        .route("/terminal/sessions", get(handlers::terminal::list_sessions))
}
