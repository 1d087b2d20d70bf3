//! Health check handler

use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, Json};
use once_cell::sync::Lazy;

use crate::container::ContainerStatus;
use crate::models::{HealthResponse, HealthStatus};
use crate::AppState;

/// Server start time for uptime calculation
static START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

/// Health check endpoint
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let uptime = START_TIME.elapsed().as_secs();
    let active_sessions = state.registry.count().await;
    let engine_version = state.container_manager.engine().version().await.ok();

    let container_status = if engine_version.is_some() {
        state
            .container_manager
            .status(&state.config.container.name)
            .await
            .unwrap_or(ContainerStatus::Error)
    } else {
        ContainerStatus::Error
    };

    // Determine health status
    let status = if engine_version.is_some() {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime,
        active_sessions,
        engine_version,
        container_status,
    })
}

/// Touch the start time so uptime counts from server start
pub fn mark_started() {
    Lazy::force(&START_TIME);
}
