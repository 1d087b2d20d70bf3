//! Error taxonomy shared by the registry client, gateway, bridge and task orchestrator

use std::time::Duration;

use bollard::errors::Error as BollardError;
use thiserror::Error;

/// Errors surfaced by container operations
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Malformed or missing request fields
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Command matched a denylist rule
    #[error("Command restricted: {0}")]
    Restricted(String),

    /// Container (or exec) does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Engine control socket unreachable
    #[error("Container engine unavailable: {0}")]
    EngineUnavailable(String),

    /// Any other engine error, passed through with its status code
    #[error("Container engine error ({status}): {message}")]
    Engine { status: u16, message: String },

    /// One-shot exec exceeded its budget
    #[error("Command timed out after {} seconds", .0.as_secs())]
    Timeout(Duration),

    /// Target container could not be brought into the running state
    #[error("Container {0} is not running")]
    VmNotRunning(String),

    /// Non-zero exit or container-side failure
    #[error("Execution failed: {message}")]
    ExecutionError { message: String, stderr: String },

    /// PTY or transport failure during an interactive session
    #[error("Stream error: {0}")]
    StreamError(String),

    /// Background task failure carrying the originating message
    #[error("Task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, SandboxError>;

impl SandboxError {
    /// Short machine-readable kind, used for metrics labels and logs
    pub fn kind(&self) -> &'static str {
        match self {
            SandboxError::InvalidInput(_) => "invalid_input",
            SandboxError::Restricted(_) => "restricted",
            SandboxError::NotFound(_) => "not_found",
            SandboxError::EngineUnavailable(_) => "engine_unavailable",
            SandboxError::Engine { .. } => "engine",
            SandboxError::Timeout(_) => "timeout",
            SandboxError::VmNotRunning(_) => "vm_not_running",
            SandboxError::ExecutionError { .. } => "execution_error",
            SandboxError::StreamError(_) => "stream_error",
            SandboxError::Task(_) => "task",
        }
    }
}

impl From<BollardError> for SandboxError {
    fn from(err: BollardError) -> Self {
        match err {
            BollardError::DockerResponseServerError {
                status_code: 404,
                message,
            } => SandboxError::NotFound(message),
            BollardError::DockerResponseServerError {
                status_code,
                message,
            } => SandboxError::Engine {
                status: status_code,
                message,
            },
            BollardError::IOError { .. }
            | BollardError::HyperResponseError { .. }
            | BollardError::RequestTimeoutError => SandboxError::EngineUnavailable(err.to_string()),
            other => SandboxError::Engine {
                status: 500,
                message: other.to_string(),
            },
        }
    }
}
