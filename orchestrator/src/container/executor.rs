//! One-shot command execution within the managed container

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, SandboxError};

use super::engine::ExecSpec;
use super::manager::ContainerManager;
use super::validator::CommandValidator;

/// Captured output of a successful command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandOutput {
    /// Text shown to the user: stdout, followed by any stderr the tool printed
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}{}", self.stdout, self.stderr)
        }
    }
}

/// Validates free-text commands and runs them inside a container
pub struct CommandGateway {
    manager: Arc<ContainerManager>,
    validator: Arc<dyn CommandValidator>,
    shell: Vec<String>,
    timeout: Duration,
}

impl CommandGateway {
    pub fn new(
        manager: Arc<ContainerManager>,
        validator: Arc<dyn CommandValidator>,
        shell: Vec<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            manager,
            validator,
            shell,
            timeout,
        }
    }

    /// Execute `command` through the container's shell
    ///
    /// Restricted commands are rejected before any engine call. Each call is an
    /// independent execution; nothing is cached.
    pub async fn execute(&self, container: &str, command: &str) -> Result<CommandOutput> {
        let command = command.trim();
        if command.is_empty() {
            return Err(SandboxError::InvalidInput("Command cannot be empty".into()));
        }

        if let Err(violation) = self.validator.validate(command) {
            warn!(
                container = %container,
                rule = ?violation.rule,
                "Restricted command rejected"
            );
            crate::metrics::record_restricted_command(&format!("{:?}", violation.rule));
            return Err(SandboxError::Restricted(violation.to_string()));
        }

        let handle = self.manager.start_existing(container).await?;

        let execution_id = Uuid::new_v4();
        let start_time = Instant::now();

        debug!(
            execution_id = %execution_id,
            container = %container,
            command = %command,
            "Executing command"
        );

        let spec = ExecSpec::shell(&self.shell, command);
        let result = timeout(self.timeout, self.manager.engine().exec(&handle.id, spec)).await;

        let duration_ms = start_time.elapsed().as_millis() as u64;

        let output = match result {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!(execution_id = %execution_id, error = %e, "Execution failed");
                crate::metrics::record_command(e.kind(), start_time.elapsed().as_secs_f64());
                return Err(e);
            }
            Err(_) => {
                warn!(execution_id = %execution_id, "Execution timed out");
                crate::metrics::record_command("timeout", start_time.elapsed().as_secs_f64());
                return Err(SandboxError::Timeout(self.timeout));
            }
        };

        let stdout = output.stdout_lossy();
        let stderr = output.stderr_lossy();

        if !output.success() {
            info!(
                execution_id = %execution_id,
                exit_code = output.exit_code,
                duration_ms = duration_ms,
                "Command exited with non-zero status"
            );
            crate::metrics::record_command("execution_error", start_time.elapsed().as_secs_f64());
            return Err(SandboxError::ExecutionError {
                message: format!("Command exited with status {}", output.exit_code),
                stderr,
            });
        }

        info!(
            execution_id = %execution_id,
            duration_ms = duration_ms,
            "Execution completed"
        );
        crate::metrics::record_command("success", start_time.elapsed().as_secs_f64());

        Ok(CommandOutput {
            stdout,
            stderr,
            duration_ms,
        })
    }
}
