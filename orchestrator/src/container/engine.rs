//! Container engine control interface
//!
//! Everything the orchestrator needs from the engine daemon goes through
//! [`ContainerEngine`]. The production implementation is
//! [`super::DockerEngine`]; tests substitute an in-memory fake.

use std::pin::Pin;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;

use crate::error::Result;

/// Observed container status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    NotFound,
    Created,
    Running,
    Exited,
    Error,
}

impl ContainerStatus {
    /// Map an engine state string ("running", "exited", ...) to a status
    pub fn from_state(state: &str) -> Self {
        match state.to_ascii_lowercase().as_str() {
            "running" => ContainerStatus::Running,
            "created" => ContainerStatus::Created,
            "exited" | "paused" | "removing" => ContainerStatus::Exited,
            _ => ContainerStatus::Error,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::NotFound => "not_found",
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Exited => "exited",
            ContainerStatus::Error => "error",
        }
    }
}

/// A container known to the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerHandle {
    /// Engine-assigned ID
    pub id: String,
    /// Human-readable name
    pub name: String,
    pub status: ContainerStatus,
}

impl ContainerHandle {
    pub fn running(&self) -> bool {
        self.status == ContainerStatus::Running
    }
}

/// Options used when a container has to be created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub privileged: bool,
    pub cap_add: Vec<String>,
    pub network_mode: Option<String>,
}

/// A process to launch inside a running container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecSpec {
    pub cmd: Vec<String>,
    /// `KEY=VALUE` pairs
    pub env: Vec<String>,
    pub user: Option<String>,
    pub working_dir: Option<String>,
}

impl ExecSpec {
    pub fn new(cmd: Vec<String>) -> Self {
        Self {
            cmd,
            ..Default::default()
        }
    }

    /// Wrap a shell string with the given shell prefix (e.g. `["/bin/sh", "-c"]`)
    pub fn shell(shell: &[String], script: impl Into<String>) -> Self {
        let mut cmd = shell.to_vec();
        cmd.push(script.into());
        Self::new(cmd)
    }

    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }
}

/// Captured result of a one-shot exec
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i64,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Terminal window size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

/// Live PTY-mode exec: output from the process and a writer into its stdin
pub struct PtyStream {
    pub exec_id: String,
    pub output: BoxStream<'static, Result<Vec<u8>>>,
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

impl std::fmt::Debug for PtyStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyStream")
            .field("exec_id", &self.exec_id)
            .finish_non_exhaustive()
    }
}

/// Lifecycle and exec calls against the container engine
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Engine version string; fails with `EngineUnavailable` if unreachable
    async fn version(&self) -> Result<String>;

    /// Exact-name lookup, including stopped containers
    async fn find(&self, name: &str) -> Result<Option<ContainerHandle>>;

    /// Create a container, returning its ID
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start(&self, id: &str) -> Result<()>;

    async fn stop(&self, id: &str) -> Result<()>;

    async fn remove(&self, id: &str) -> Result<()>;

    async fn inspect(&self, id: &str) -> Result<ContainerHandle>;

    /// Run a process to completion and capture its output
    async fn exec(&self, id: &str, spec: ExecSpec) -> Result<ExecOutput>;

    /// Start an interactive process with a TTY attached to stdin/stdout/stderr
    async fn exec_pty(&self, id: &str, spec: ExecSpec) -> Result<PtyStream>;

    async fn resize_pty(&self, exec_id: &str, size: TerminalSize) -> Result<()>;
}
