//! Container lifecycle handler

use std::sync::Arc;

use axum::{extract::rejection::JsonRejection, extract::State, Json};
use tracing::info;

use crate::api::ApiError;
use crate::container::ContainerStatus;
use crate::models::{VmRequest, VmResponse};
use crate::AppState;

/// Start, stop or inspect the managed container
pub async fn vm_action(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<VmRequest>, JsonRejection>,
) -> Result<Json<VmResponse>, ApiError> {
    let Json(request) = payload?;
    let name = state.config.container.name.clone();
    let manager = &state.container_manager;

    let response = match request.action.as_str() {
        "start" => {
            let handle = manager.ensure_running(&state.config.container.spec()).await?;
            VmResponse {
                container: name,
                running: handle.running(),
                id: Some(handle.id),
                status: handle.status,
            }
        }
        "stop" => {
            let remove = request.remove || state.config.container.remove_on_stop;
            manager.stop(&name, remove).await?;
            info!(container = %name, remove, "Container stop requested");
            let handle = manager.find(&name).await?;
            VmResponse {
                container: name,
                running: false,
                id: handle.as_ref().map(|h| h.id.clone()),
                status: handle
                    .map(|h| h.status)
                    .unwrap_or(ContainerStatus::NotFound),
            }
        }
        "status" => match manager.find(&name).await? {
            Some(handle) => VmResponse {
                container: name,
                running: handle.running(),
                id: Some(handle.id),
                status: handle.status,
            },
            None => VmResponse {
                container: name,
                running: false,
                id: None,
                status: ContainerStatus::NotFound,
            },
        },
        other => {
            return Err(ApiError::BadRequest(format!(
                "Unknown action '{}', expected start, stop or status",
                other
            )))
        }
    };

    Ok(Json(response))
}
