//! Container management module for the secbox orchestrator
//!
//! Handles all interactions with the container engine including:
//! - Finding, creating, starting and stopping the managed container
//! - Validating and executing one-shot commands inside it
//! - Opening PTY-mode execs for the terminal bridge

mod docker;
pub(crate) mod engine;
mod executor;
mod manager;
pub mod validator;

#[cfg(test)]
pub(crate) mod testing;

pub use docker::DockerEngine;
pub use engine::{
    ContainerEngine, ContainerHandle, ContainerSpec, ContainerStatus, ExecOutput, ExecSpec,
    PtyStream, TerminalSize,
};
pub use executor::{CommandGateway, CommandOutput};
pub use manager::ContainerManager;
pub use validator::{CommandValidator, DenylistValidator};
