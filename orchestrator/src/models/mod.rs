//! Data models for the secbox orchestrator
//!
//! This module defines all HTTP request/response types.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::container::ContainerStatus;
use crate::tasks::TaskStatus;
use crate::tty::TerminalSession;

// ============================================================================
// Execution Models
// ============================================================================

/// Request to run a shell command in the container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    /// Command string; kept untyped so a non-string is reported as invalid input
    #[serde(default)]
    pub command: Option<serde_json::Value>,
}

impl ExecuteRequest {
    /// The command when it is a string
    pub fn command_str(&self) -> Option<&str> {
        self.command.as_ref().and_then(|c| c.as_str())
    }
}

/// Successful command output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub output: String,
}

// ============================================================================
// Container Models
// ============================================================================

/// Container lifecycle action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmRequest {
    /// `start`, `stop` or `status`
    pub action: String,

    /// Remove the container after stopping it
    #[serde(default)]
    pub remove: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmResponse {
    pub container: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub status: ContainerStatus,
    pub running: bool,
}

// ============================================================================
// Task Models
// ============================================================================

/// Orchestrator action; every other field is a helper parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    /// `start`, `stop` or `status`
    pub action: String,

    #[serde(flatten)]
    pub params: HashMap<String, serde_json::Value>,
}

impl TaskRequest {
    /// Helper parameters as strings; nested values are rejected
    pub fn string_params(&self) -> Result<HashMap<String, String>, String> {
        self.params
            .iter()
            .map(|(key, value)| {
                let value = match value {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Number(n) => n.to_string(),
                    serde_json::Value::Bool(b) => b.to_string(),
                    _ => return Err(format!("Parameter {} must be a string", key)),
                };
                Ok((key.clone(), value))
            })
            .collect()
    }
}

/// Response to `start`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStartResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_running: Option<bool>,
}

/// Response to `status` and `stop`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusResponse {
    pub status: TaskStatus,
    pub credentials: Vec<String>,
    pub ips: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ============================================================================
// Terminal Models
// ============================================================================

/// Query parameters of the terminal upgrade request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TerminalQuery {
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default)]
    pub cols: Option<u16>,
    #[serde(default)]
    pub rows: Option<u16>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionsResponse {
    pub sessions: Vec<TerminalSession>,
    pub total: usize,
}

// ============================================================================
// Health Models
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub active_sessions: u64,
    #[serde(default)]
    pub engine_version: Option<String>,
    pub container_status: ContainerStatus,
}

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

// ============================================================================
// Error Models
// ============================================================================

/// Error body: `{error, output?}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            output: None,
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }
}
