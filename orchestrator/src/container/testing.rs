//! In-memory engine used by unit tests across the crate

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Result, SandboxError};

use super::engine::{
    ContainerEngine, ContainerHandle, ContainerSpec, ContainerStatus, ExecOutput, ExecSpec,
    PtyStream, TerminalSize,
};

/// A recorded engine call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Find(String),
    Create(String),
    Start(String),
    Stop(String),
    Remove(String),
    Inspect(String),
    /// Container ID and the last element of the command vector (the shell script)
    Exec(String, String),
    ExecPty(String),
    Resize(String, TerminalSize),
}

type Responder = Box<dyn FnMut(&ExecSpec) -> Result<ExecOutput> + Send>;

/// Scripted container engine that records every call
pub struct FakeEngine {
    containers: Mutex<HashMap<String, ContainerHandle>>,
    calls: Mutex<Vec<Call>>,
    responder: Mutex<Responder>,
    pty: Mutex<Option<PtyStream>>,
    /// When false, `start` succeeds but the container stays exited
    start_takes_effect: bool,
    exec_delay: Option<Duration>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            containers: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            responder: Mutex::new(Box::new(|_| Ok(ExecOutput::default()))),
            pty: Mutex::new(None),
            start_takes_effect: true,
            exec_delay: None,
        }
    }

    /// Seed a container with the given status
    pub fn with_container(self, name: &str, status: ContainerStatus) -> Self {
        self.containers.lock().unwrap().insert(
            name.to_string(),
            ContainerHandle {
                id: format!("id-{}", name),
                name: name.to_string(),
                status,
            },
        );
        self
    }

    pub fn with_responder<F>(self, responder: F) -> Self
    where
        F: FnMut(&ExecSpec) -> Result<ExecOutput> + Send + 'static,
    {
        *self.responder.lock().unwrap() = Box::new(responder);
        self
    }

    pub fn with_pty(self, pty: PtyStream) -> Self {
        *self.pty.lock().unwrap() = Some(pty);
        self
    }

    pub fn with_broken_start(mut self) -> Self {
        self.start_takes_effect = false;
        self
    }

    pub fn with_exec_delay(mut self, delay: Duration) -> Self {
        self.exec_delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    /// Shell scripts passed to one-shot execs, in order
    pub fn scripts(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                Call::Exec(_, script) => Some(script.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn by_id(&self, id: &str) -> Option<ContainerHandle> {
        self.containers
            .lock()
            .unwrap()
            .values()
            .find(|h| h.id == id)
            .cloned()
    }

    fn set_status(&self, id: &str, status: ContainerStatus) {
        let mut containers = self.containers.lock().unwrap();
        if let Some(handle) = containers.values_mut().find(|h| h.id == id) {
            handle.status = status;
        }
    }
}

/// Successful exec output with the given stdout
pub fn stdout(text: &str) -> ExecOutput {
    ExecOutput {
        stdout: text.as_bytes().to_vec(),
        stderr: Vec::new(),
        exit_code: 0,
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn version(&self) -> Result<String> {
        Ok("fake-1.0".to_string())
    }

    async fn find(&self, name: &str) -> Result<Option<ContainerHandle>> {
        self.record(Call::Find(name.to_string()));
        Ok(self.containers.lock().unwrap().get(name).cloned())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        self.record(Call::Create(spec.name.clone()));
        let id = format!("id-{}", spec.name);
        self.containers.lock().unwrap().insert(
            spec.name.clone(),
            ContainerHandle {
                id: id.clone(),
                name: spec.name.clone(),
                status: ContainerStatus::Created,
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.record(Call::Start(id.to_string()));
        if self.by_id(id).is_none() {
            return Err(SandboxError::NotFound(id.to_string()));
        }
        if self.start_takes_effect {
            self.set_status(id, ContainerStatus::Running);
        }
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.record(Call::Stop(id.to_string()));
        self.set_status(id, ContainerStatus::Exited);
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.record(Call::Remove(id.to_string()));
        self.containers.lock().unwrap().retain(|_, h| h.id != id);
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerHandle> {
        self.record(Call::Inspect(id.to_string()));
        self.by_id(id)
            .ok_or_else(|| SandboxError::NotFound(id.to_string()))
    }

    async fn exec(&self, id: &str, spec: ExecSpec) -> Result<ExecOutput> {
        let script = spec.cmd.last().cloned().unwrap_or_default();
        self.record(Call::Exec(id.to_string(), script));
        if let Some(delay) = self.exec_delay {
            tokio::time::sleep(delay).await;
        }
        let mut responder = self.responder.lock().unwrap();
        (responder)(&spec)
    }

    async fn exec_pty(&self, id: &str, _spec: ExecSpec) -> Result<PtyStream> {
        self.record(Call::ExecPty(id.to_string()));
        self.pty
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| SandboxError::StreamError("no PTY scripted".to_string()))
    }

    async fn resize_pty(&self, exec_id: &str, size: TerminalSize) -> Result<()> {
        self.record(Call::Resize(exec_id.to_string(), size));
        Ok(())
    }
}
