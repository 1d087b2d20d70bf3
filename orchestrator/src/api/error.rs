//! API error handling

use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::error::SandboxError;
use crate::models::ErrorResponse;

/// API error types
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Sandbox(err) => match err {
                SandboxError::InvalidInput(_) => StatusCode::BAD_REQUEST,
                SandboxError::Restricted(_) => StatusCode::FORBIDDEN,
                SandboxError::NotFound(_) => StatusCode::NOT_FOUND,
                SandboxError::EngineUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                SandboxError::Engine { .. }
                | SandboxError::Timeout(_)
                | SandboxError::VmNotRunning(_)
                | SandboxError::ExecutionError { .. }
                | SandboxError::StreamError(_)
                | SandboxError::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        let body = match &self {
            ApiError::Sandbox(SandboxError::ExecutionError { message, stderr }) => {
                ErrorResponse::new(message.clone()).with_output(stderr.clone())
            }
            other => ErrorResponse::new(other.to_string()),
        };

        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "Request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "Request rejected");
        }

        (status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (SandboxError::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (SandboxError::Restricted("x".into()), StatusCode::FORBIDDEN),
            (SandboxError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (SandboxError::EngineUnavailable("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (SandboxError::Timeout(Duration::from_secs(30)), StatusCode::INTERNAL_SERVER_ERROR),
            (SandboxError::VmNotRunning("vm".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }
}
