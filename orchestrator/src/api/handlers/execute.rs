//! Command execution handler

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{extract::rejection::JsonRejection, extract::State, Json};

use crate::api::ApiError;
use crate::error::SandboxError;
use crate::models::{ExecuteRequest, ExecuteResponse};
use crate::AppState;

/// Run one shell command in the container and return its output
pub async fn execute_command(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let Json(request) = payload?;

    let command = request
        .command_str()
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| {
            SandboxError::InvalidInput("Command is required and must be a non-empty string".into())
        })?;

    // Commands only ever run in the managed container
    let container = state.config.container.name.as_str();

    state.total_executions.fetch_add(1, Ordering::Relaxed);

    match state.gateway.execute(container, command).await {
        Ok(output) => Ok(Json(ExecuteResponse {
            output: output.combined(),
        })),
        Err(e) => {
            state.total_errors.fetch_add(1, Ordering::Relaxed);
            Err(e.into())
        }
    }
}
