//! Prometheus metrics export
//!
//! Provides metrics endpoint for monitoring and alerting

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, response::IntoResponse};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

use crate::AppState;

/// Installed Prometheus recorder; unset when metrics are disabled
static METRICS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder
///
/// Until this runs, the `record_*` functions are no-ops.
pub fn init_metrics() -> Result<()> {
    if METRICS_HANDLE.get().is_some() {
        return Ok(());
    }

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("secbox_command_duration_seconds".to_string()),
            &[0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0],
        )
        .context("Invalid histogram buckets")?
        .install_recorder()
        .context("Failed to install metrics recorder")?;

    let _ = METRICS_HANDLE.set(handle);
    Ok(())
}

/// Record a one-shot command by outcome (`success`, `timeout`, `execution_error`, ...)
pub fn record_command(outcome: &str, duration_secs: f64) {
    counter!("secbox_commands_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("secbox_command_duration_seconds", "outcome" => outcome.to_string())
        .record(duration_secs);
}

/// Record a command rejected by the validator
pub fn record_restricted_command(rule: &str) {
    counter!("secbox_restricted_commands_total", "rule" => rule.to_string()).increment(1);
}

pub fn record_terminal_opened() {
    counter!("secbox_terminal_sessions_total").increment(1);
    gauge!("secbox_terminal_sessions_active").increment(1.0);
}

pub fn record_terminal_closed(reason: &str) {
    counter!("secbox_terminal_sessions_closed_total", "reason" => reason.to_string()).increment(1);
    gauge!("secbox_terminal_sessions_active").decrement(1.0);
}

/// Record an orchestrator status change
pub fn record_task_transition(kind: &str, status: &str) {
    counter!(
        "secbox_task_transitions_total",
        "kind" => kind.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Prometheus metrics endpoint handler
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let Some(handle) = METRICS_HANDLE.get() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            [("Content-Type", "text/plain; version=0.0.4")],
            "metrics disabled\n".to_string(),
        );
    };

    // Update gauges with current values
    gauge!("secbox_terminal_sessions_active").set(state.registry.count().await as f64);
    gauge!("secbox_total_executions").set(state.total_executions.load(Ordering::Relaxed) as f64);
    gauge!("secbox_total_errors").set(state.total_errors.load(Ordering::Relaxed) as f64);

    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        handle.render(),
    )
}
