//! Background task handler

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    response::{IntoResponse, Response},
    Json,
};

use crate::api::ApiError;
use crate::models::{TaskRequest, TaskStartResponse, TaskStatusResponse};
use crate::tasks::TaskStatus;
use crate::AppState;

/// Dispatch `start`, `stop` and `status` to the task orchestrator
pub async fn task_action(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<TaskRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;

    match request.action.as_str() {
        "start" => {
            let params = request.string_params().map_err(ApiError::BadRequest)?;
            let started = state.tasks.start(params).await?;
            Ok(Json(TaskStartResponse {
                success: true,
                url: Some(started.url),
                status: started.status,
                is_running: Some(started.status == TaskStatus::Running),
            })
            .into_response())
        }
        "stop" => {
            let status = state.tasks.stop().await?;
            Ok(Json(TaskStartResponse {
                success: true,
                url: None,
                status,
                is_running: Some(false),
            })
            .into_response())
        }
        "status" => {
            let snapshot = state.tasks.status().await?;
            Ok(Json(TaskStatusResponse {
                status: snapshot.status,
                credentials: snapshot.credentials,
                ips: snapshot.ips,
                url: snapshot.url,
                error: snapshot.error,
            })
            .into_response())
        }
        other => Err(ApiError::BadRequest(format!(
            "Unknown action '{}', expected start, stop or status",
            other
        ))),
    }
}
