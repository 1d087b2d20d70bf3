//! Container lifecycle management

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{Result, SandboxError};

use super::engine::{ContainerEngine, ContainerHandle, ContainerSpec, ContainerStatus};

/// Looks up, creates, starts and stops named containers
pub struct ContainerManager {
    /// Engine control interface
    engine: Arc<dyn ContainerEngine>,
}

impl ContainerManager {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self { engine }
    }

    /// Underlying engine, for exec-level operations
    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    /// Exact-name lookup, including stopped containers
    pub async fn find(&self, name: &str) -> Result<Option<ContainerHandle>> {
        self.engine.find(name).await
    }

    /// Current status, `NotFound` when the container does not exist
    pub async fn status(&self, name: &str) -> Result<ContainerStatus> {
        Ok(self
            .find(name)
            .await?
            .map(|h| h.status)
            .unwrap_or(ContainerStatus::NotFound))
    }

    /// Make sure exactly one running container named `spec.name` exists
    ///
    /// Running containers are left alone, stopped ones are started and
    /// missing ones are created then started.
    pub async fn ensure_running(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        let handle = match self.find(&spec.name).await? {
            Some(handle) if handle.running() => {
                debug!(container = %spec.name, "Container already running");
                return Ok(handle);
            }
            Some(handle) => {
                info!(container = %spec.name, status = %handle.status.as_str(), "Starting stopped container");
                handle
            }
            None => {
                info!(container = %spec.name, image = %spec.image, "Container not found, creating");
                let id = self.engine.create(spec).await?;
                ContainerHandle {
                    id,
                    name: spec.name.clone(),
                    status: ContainerStatus::Created,
                }
            }
        };

        self.engine.start(&handle.id).await?;
        let handle = self.engine.inspect(&handle.id).await?;

        if !handle.running() {
            warn!(container = %spec.name, status = %handle.status.as_str(), "Container did not reach running state");
            return Err(SandboxError::VmNotRunning(spec.name.clone()));
        }

        info!(container = %spec.name, id = %handle.id, "Container running");
        Ok(handle)
    }

    /// Start an existing container once if it is not running
    ///
    /// Fails with `NotFound` if the container does not exist and with
    /// `VmNotRunning` if it is still down after the start attempt.
    pub async fn start_existing(&self, name: &str) -> Result<ContainerHandle> {
        let handle = self
            .find(name)
            .await?
            .ok_or_else(|| SandboxError::NotFound(format!("container {}", name)))?;

        if handle.running() {
            return Ok(handle);
        }

        info!(container = %name, "Container not running, attempting start");
        if let Err(e) = self.engine.start(&handle.id).await {
            warn!(container = %name, error = %e, "Start attempt failed");
        }

        let handle = self.engine.inspect(&handle.id).await?;
        if handle.running() {
            Ok(handle)
        } else {
            Err(SandboxError::VmNotRunning(name.to_string()))
        }
    }

    /// Stop a container if it is running, optionally removing it afterwards
    ///
    /// Stopping an already stopped container is a no-op.
    pub async fn stop(&self, name: &str, remove: bool) -> Result<()> {
        let handle = self
            .find(name)
            .await?
            .ok_or_else(|| SandboxError::NotFound(format!("container {}", name)))?;

        if handle.running() {
            self.engine.stop(&handle.id).await?;
            info!(container = %name, "Container stopped");
        } else {
            debug!(container = %name, "Container already stopped");
        }

        if remove {
            self.engine.remove(&handle.id).await?;
            info!(container = %name, "Container removed");
        }

        Ok(())
    }
}
