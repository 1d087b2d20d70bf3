//! Configuration module for the secbox orchestrator
//!
//! Supports configuration via:
//! - YAML/TOML config files
//! - Environment variables (with SECBOX_ prefix)

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::container::ContainerSpec;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for the JSON log file
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Engine socket path (platform default when unset)
    #[serde(default)]
    pub docker_socket: Option<String>,

    /// Stop the managed container when the orchestrator shuts down
    #[serde(default)]
    pub stop_container_on_shutdown: bool,

    /// Managed container settings
    #[serde(default)]
    pub container: ContainerConfig,

    /// One-shot command gateway settings
    #[serde(default)]
    pub exec: ExecConfig,

    /// Interactive terminal settings
    #[serde(default)]
    pub terminal: TerminalConfig,

    /// Background task orchestrator settings
    #[serde(default)]
    pub tasks: TaskConfig,

    /// Metrics settings
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// The disposable container commands run in
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Container name, also the default terminal target
    #[serde(default = "default_container_name")]
    pub name: String,

    /// Image to create the container from
    #[serde(default = "default_image")]
    pub image: String,

    /// Keep-alive command for the container's main process
    #[serde(default = "default_container_command")]
    pub command: Vec<String>,

    /// Run privileged
    #[serde(default)]
    pub privileged: bool,

    /// Extra capabilities (raw sockets for scanners)
    #[serde(default = "default_cap_add")]
    pub cap_add: Vec<String>,

    /// Network mode override
    #[serde(default)]
    pub network_mode: Option<String>,

    /// Grace period before the engine kills a stopping container
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_seconds: i64,

    /// Remove the container after stopping it
    #[serde(default)]
    pub remove_on_stop: bool,
}

/// Command gateway settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecConfig {
    /// Maximum execution time in seconds
    #[serde(default = "default_exec_timeout")]
    pub timeout_seconds: u64,

    /// Shell prefix the command string is appended to
    #[serde(default = "default_exec_shell")]
    pub shell: Vec<String>,

    /// Also reject backgrounding and nohup
    #[serde(default)]
    pub strict: bool,
}

/// Interactive terminal settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalConfig {
    /// WebSocket upgrade path
    #[serde(default = "default_terminal_path")]
    pub path: String,

    /// Interactive shell command
    #[serde(default = "default_terminal_shell")]
    pub shell: Vec<String>,

    /// TERM exported to the shell
    #[serde(default = "default_term")]
    pub term: String,

    #[serde(default = "default_cols")]
    pub default_cols: u16,

    #[serde(default = "default_rows")]
    pub default_rows: u16,
}

/// How captured lines are consumed from the task's capture files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    /// Track a byte offset per file and never truncate
    #[default]
    Offset,
    /// Read then truncate the file
    Truncate,
}

/// Background task orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Task kind reported to clients
    #[serde(default = "default_task_kind")]
    pub kind: String,

    /// Scratch directory inside the container (wiped on every start)
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: String,

    /// Helper launched detached inside the container
    #[serde(default = "default_launch_command")]
    pub launch_command: String,

    /// `pkill -f` patterns matching the helper and its children
    #[serde(default = "default_process_patterns")]
    pub process_patterns: Vec<String>,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_poll_max_attempts")]
    pub poll_max_attempts: u32,

    #[serde(default)]
    pub capture_mode: CaptureMode,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable Prometheus metrics endpoint
    #[serde(default = "default_true")]
    pub enabled: bool,
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/secbox")
}

fn default_container_name() -> String {
    "secbox-vm".to_string()
}

fn default_image() -> String {
    "kalilinux/kali-rolling".to_string()
}

fn default_container_command() -> Vec<String> {
    vec!["tail".to_string(), "-f".to_string(), "/dev/null".to_string()]
}

fn default_cap_add() -> Vec<String> {
    vec!["NET_ADMIN".to_string(), "NET_RAW".to_string()]
}

fn default_stop_timeout() -> i64 {
    10
}

fn default_exec_timeout() -> u64 {
    30
}

fn default_exec_shell() -> Vec<String> {
    vec!["/bin/sh".to_string(), "-c".to_string()]
}

fn default_terminal_path() -> String {
    "/ws/terminal".to_string()
}

fn default_terminal_shell() -> Vec<String> {
    vec!["/bin/bash".to_string()]
}

fn default_term() -> String {
    "xterm-256color".to_string()
}

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

fn default_task_kind() -> String {
    "capture".to_string()
}

fn default_scratch_dir() -> String {
    "/tmp/secbox-task".to_string()
}

fn default_launch_command() -> String {
    "/opt/secbox/task.sh".to_string()
}

fn default_process_patterns() -> Vec<String> {
    vec!["/opt/secbox/task.sh".to_string()]
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_poll_max_attempts() -> u32 {
    15
}

fn default_true() -> bool {
    true
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            name: default_container_name(),
            image: default_image(),
            command: default_container_command(),
            privileged: false,
            cap_add: default_cap_add(),
            network_mode: None,
            stop_timeout_seconds: default_stop_timeout(),
            remove_on_stop: false,
        }
    }
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_exec_timeout(),
            shell: default_exec_shell(),
            strict: false,
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            path: default_terminal_path(),
            shell: default_terminal_shell(),
            term: default_term(),
            default_cols: default_cols(),
            default_rows: default_rows(),
        }
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            kind: default_task_kind(),
            scratch_dir: default_scratch_dir(),
            launch_command: default_launch_command(),
            process_patterns: default_process_patterns(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_max_attempts: default_poll_max_attempts(),
            capture_mode: CaptureMode::default(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            log_dir: default_log_dir(),
            docker_socket: None,
            stop_container_on_shutdown: false,
            container: ContainerConfig::default(),
            exec: ExecConfig::default(),
            terminal: TerminalConfig::default(),
            tasks: TaskConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl ContainerConfig {
    /// Creation options for the managed container
    pub fn spec(&self) -> ContainerSpec {
        ContainerSpec {
            name: self.name.clone(),
            image: self.image.clone(),
            command: self.command.clone(),
            privileged: self.privileged,
            cap_add: self.cap_add.clone(),
            network_mode: self.network_mode.clone(),
        }
    }
}

impl ExecConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl TaskConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl AppConfig {
    /// Load configuration from file and environment variables
    pub fn load() -> Result<Self> {
        // Try to load .env file if present
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            // Start with defaults
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // Load from config file if present
            .add_source(config::File::with_name("config/secbox").required(false))
            .add_source(config::File::with_name("/etc/secbox/config").required(false))
            // Override with environment variables (SECBOX_ prefix)
            .add_source(
                config::Environment::with_prefix("SECBOX")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;

        Ok(app_config)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("Port cannot be 0");
        }

        if self.container.name.trim().is_empty() {
            anyhow::bail!("Container name cannot be empty");
        }

        if self.container.image.trim().is_empty() {
            anyhow::bail!("Container image cannot be empty");
        }

        if self.exec.timeout_seconds == 0 {
            anyhow::bail!("Execution timeout cannot be 0");
        }

        if self.exec.shell.is_empty() || self.terminal.shell.is_empty() {
            anyhow::bail!("Shell command cannot be empty");
        }

        if self.tasks.poll_interval_ms == 0 || self.tasks.poll_max_attempts == 0 {
            anyhow::bail!("Task poll interval and attempts must be positive");
        }

        // The scratch directory is wiped with `rm -rf` on every task start
        let scratch = self.tasks.scratch_dir.trim_end_matches('/');
        if !self.tasks.scratch_dir.starts_with('/') || scratch.is_empty() {
            anyhow::bail!("Task scratch directory must be an absolute path other than /");
        }

        if !self.terminal.path.starts_with('/') {
            anyhow::bail!("Terminal path must start with '/'");
        }

        Ok(())
    }
}
