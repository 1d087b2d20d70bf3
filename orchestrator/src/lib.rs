//! secbox orchestrator library
//!
//! Drives a disposable security-tooling container: one-shot command execution
//! behind a denylist, an interactive terminal bridged over WebSocket, and a
//! background task orchestrator that polls helper status files.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

pub mod api;
pub mod config;
pub mod container;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod tasks;
pub mod tty;

use container::{
    CommandGateway, CommandValidator, ContainerEngine, ContainerManager, DenylistValidator,
    TerminalSize,
};
use tasks::TaskOrchestrator;
use tty::{SessionRegistry, TerminalBridge};

/// Application state shared across all handlers
pub struct AppState {
    pub config: config::AppConfig,
    pub container_manager: Arc<ContainerManager>,
    pub gateway: CommandGateway,
    pub terminal: TerminalBridge,
    pub tasks: Arc<TaskOrchestrator>,
    pub registry: Arc<SessionRegistry>,
    pub total_executions: AtomicU64,
    pub total_errors: AtomicU64,
}

impl AppState {
    /// Wire every component to one engine
    pub fn new(config: config::AppConfig, engine: Arc<dyn ContainerEngine>) -> Self {
        let container_manager = Arc::new(ContainerManager::new(engine));
        let registry = Arc::new(SessionRegistry::new());

        let validator: Arc<dyn CommandValidator> = if config.exec.strict {
            Arc::new(DenylistValidator::strict())
        } else {
            Arc::new(DenylistValidator::standard())
        };

        let gateway = CommandGateway::new(
            container_manager.clone(),
            validator,
            config.exec.shell.clone(),
            config.exec.timeout(),
        );

        let terminal = TerminalBridge::new(
            container_manager.clone(),
            registry.clone(),
            config.terminal.shell.clone(),
            &config.terminal.term,
        );

        let tasks = Arc::new(TaskOrchestrator::new(
            container_manager.clone(),
            config.container.spec(),
            config.exec.shell.clone(),
            config.tasks.clone(),
        ));

        Self {
            config,
            container_manager,
            gateway,
            terminal,
            tasks,
            registry,
            total_executions: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
        }
    }

    /// Terminal size applied when the client does not send one
    pub fn default_terminal_size(&self) -> TerminalSize {
        TerminalSize {
            cols: self.config.terminal.default_cols,
            rows: self.config.terminal.default_rows,
        }
    }
}
