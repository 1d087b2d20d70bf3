//! bollard-backed container engine

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecResults};
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, error, info};

use crate::error::{Result, SandboxError};

use super::engine::{
    ContainerEngine, ContainerHandle, ContainerSpec, ContainerStatus, ExecOutput, ExecSpec,
    PtyStream, TerminalSize,
};

/// Seconds to wait for the daemon before a request is considered failed
const ENGINE_TIMEOUT_SECS: u64 = 120;

/// Container engine speaking the Docker-compatible API over a local socket
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
    stop_timeout_secs: i64,
}

impl DockerEngine {
    /// Connect to the engine socket (or the platform default when `socket` is `None`)
    pub fn connect(socket: Option<&str>, stop_timeout_secs: i64) -> Result<Self> {
        let docker = match socket {
            Some(path) => Docker::connect_with_socket(
                path,
                ENGINE_TIMEOUT_SECS,
                bollard::API_DEFAULT_VERSION,
            ),
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| {
            error!(error = %e, "Failed to configure container engine client");
            SandboxError::EngineUnavailable(e.to_string())
        })?;

        Ok(Self {
            docker,
            stop_timeout_secs,
        })
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn version(&self) -> Result<String> {
        let version = self
            .docker
            .version()
            .await
            .map_err(|e| SandboxError::EngineUnavailable(e.to_string()))?;
        Ok(version.version.unwrap_or_else(|| "unknown".to_string()))
    }

    async fn find(&self, name: &str) -> Result<Option<ContainerHandle>> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![format!("^/{}$", name)]);

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self.docker.list_containers(Some(options)).await?;

        // The name filter is a pattern match; confirm the exact name
        let wanted = format!("/{}", name);
        let found = containers.into_iter().find(|c| {
            c.names
                .as_ref()
                .map(|names| names.iter().any(|n| n == &wanted || n == name))
                .unwrap_or(false)
        });

        Ok(found.map(|c| ContainerHandle {
            id: c.id.unwrap_or_default(),
            name: name.to_string(),
            status: c
                .state
                .as_deref()
                .map(ContainerStatus::from_state)
                .unwrap_or(ContainerStatus::Error),
        }))
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        debug!(name = %spec.name, image = %spec.image, "Creating container");

        let host_config = HostConfig {
            privileged: Some(spec.privileged),
            cap_add: if spec.cap_add.is_empty() {
                None
            } else {
                Some(spec.cap_add.clone())
            },
            network_mode: spec.network_mode.clone(),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            tty: Some(true),
            open_stdin: Some(true),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self.docker.create_container(Some(options), config).await?;

        info!(name = %spec.name, id = %response.id, "Container created");
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        match self
            .docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            // Already started
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn stop(&self, id: &str) -> Result<()> {
        let options = StopContainerOptions {
            t: self.stop_timeout_secs,
        };

        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // Already stopped
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        self.docker.remove_container(id, Some(options)).await?;
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerHandle> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;

        let status = match info.state {
            Some(state) if state.running.unwrap_or(false) => ContainerStatus::Running,
            Some(state) => state
                .status
                .map(|s| ContainerStatus::from_state(&s.to_string()))
                .unwrap_or(ContainerStatus::Error),
            None => ContainerStatus::Error,
        };

        Ok(ContainerHandle {
            id: info.id.unwrap_or_else(|| id.to_string()),
            name: info
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            status,
        })
    }

    async fn exec(&self, id: &str, spec: ExecSpec) -> Result<ExecOutput> {
        let options = CreateExecOptions {
            cmd: Some(spec.cmd),
            env: if spec.env.is_empty() { None } else { Some(spec.env) },
            user: spec.user,
            working_dir: spec.working_dir,
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        };

        let exec = self.docker.create_exec(id, options).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        match self.docker.start_exec(&exec.id, None).await? {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    match chunk? {
                        bollard::container::LogOutput::StdErr { message } => {
                            stderr.extend_from_slice(&message)
                        }
                        other => stdout.extend_from_slice(&other.into_bytes()),
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(SandboxError::ExecutionError {
                    message: "Exec was detached unexpectedly".to_string(),
                    stderr: String::new(),
                });
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code: inspect.exit_code.unwrap_or(0),
        })
    }

    async fn exec_pty(&self, id: &str, spec: ExecSpec) -> Result<PtyStream> {
        let options = CreateExecOptions {
            cmd: Some(spec.cmd),
            env: if spec.env.is_empty() { None } else { Some(spec.env) },
            user: spec.user,
            working_dir: spec.working_dir,
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(true),
            ..Default::default()
        };

        let exec = self.docker.create_exec(id, options).await?;

        match self.docker.start_exec(&exec.id, None).await? {
            StartExecResults::Attached { output, input } => {
                let output = output
                    .map(|chunk| {
                        chunk
                            .map(|log| log.into_bytes().to_vec())
                            .map_err(|e| SandboxError::StreamError(e.to_string()))
                    })
                    .boxed();

                debug!(container = %id, exec_id = %exec.id, "PTY exec attached");

                Ok(PtyStream {
                    exec_id: exec.id,
                    output,
                    input,
                })
            }
            StartExecResults::Detached => Err(SandboxError::StreamError(
                "Exec was detached unexpectedly".to_string(),
            )),
        }
    }

    async fn resize_pty(&self, exec_id: &str, size: TerminalSize) -> Result<()> {
        self.docker
            .resize_exec(
                exec_id,
                ResizeExecOptions {
                    height: size.rows,
                    width: size.cols,
                },
            )
            .await?;
        Ok(())
    }
}
