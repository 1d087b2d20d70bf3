//! Byte relay between a client WebSocket and a PTY-mode exec
//!
//! A connection moves through `Connecting -> Attaching -> Streaming -> Closed`.
//! While streaming, two pumps run side by side: process output to client
//! frames, and client frames to process input (or PTY resizes). Whichever pump
//! finishes first records the close reason and cancels the shared token; the
//! other pump observes the token and returns. Teardown runs once, after both
//! pumps have returned.

use std::borrow::Cow;
use std::fmt::Display;
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message};
use futures::stream::BoxStream;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::container::{ContainerEngine, ContainerManager, ExecSpec, PtyStream, TerminalSize};
use crate::error::Result;

use super::control::{self, ClientInput};
use super::{SessionPhase, SessionRegistry};

/// Maximum close-frame reason length allowed by the WebSocket protocol
const MAX_CLOSE_REASON: usize = 123;

/// Why a terminal session ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "message", rename_all = "snake_case")]
pub enum CloseReason {
    /// Client sent a close frame or dropped the connection
    ClientClosed,
    /// Client transport failed
    ClientError(String),
    /// Process stream ended
    ProcessExited,
    /// Process stream failed
    StreamError(String),
    /// Container or exec could not be attached
    AttachFailed(String),
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientClosed => "client_closed",
            CloseReason::ClientError(_) => "client_error",
            CloseReason::ProcessExited => "process_exited",
            CloseReason::StreamError(_) => "stream_error",
            CloseReason::AttachFailed(_) => "attach_failed",
        }
    }

    /// Whether the client side may still accept a close frame
    fn client_open(&self) -> bool {
        !matches!(self, CloseReason::ClientClosed | CloseReason::ClientError(_))
    }

    fn close_frame(&self) -> CloseFrame<'static> {
        let (code, reason) = match self {
            CloseReason::ProcessExited => (close_code::NORMAL, "process exited".to_string()),
            CloseReason::StreamError(msg) => (close_code::ERROR, format!("stream error: {}", msg)),
            CloseReason::AttachFailed(msg) => (close_code::ERROR, format!("attach failed: {}", msg)),
            CloseReason::ClientClosed | CloseReason::ClientError(_) => {
                (close_code::NORMAL, String::new())
            }
        };

        CloseFrame {
            code,
            reason: Cow::Owned(truncate_reason(reason)),
        }
    }
}

fn truncate_reason(mut reason: String) -> String {
    if reason.len() > MAX_CLOSE_REASON {
        let mut end = MAX_CLOSE_REASON;
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        reason.truncate(end);
    }
    reason
}

/// One-shot close signal shared by the two pumps
struct Closer {
    token: CancellationToken,
    reason: OnceCell<CloseReason>,
}

impl Closer {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: OnceCell::new(),
        }
    }

    /// Record the first close reason and cancel both pumps; later calls are ignored
    fn close(&self, reason: CloseReason) {
        if self.reason.set(reason).is_err() {
            debug!("Session already closing");
        }
        self.token.cancel();
    }

    fn reason(&self) -> CloseReason {
        self.reason.get().cloned().unwrap_or(CloseReason::ClientClosed)
    }
}

/// Attaches PTY execs to containers and relays bytes for WebSocket clients
pub struct TerminalBridge {
    manager: Arc<ContainerManager>,
    registry: Arc<SessionRegistry>,
    shell: Vec<String>,
    env: Vec<String>,
}

impl TerminalBridge {
    pub fn new(
        manager: Arc<ContainerManager>,
        registry: Arc<SessionRegistry>,
        shell: Vec<String>,
        term: &str,
    ) -> Self {
        Self {
            manager,
            registry,
            shell,
            env: vec![format!("TERM={}", term)],
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Resolve the container and start an interactive shell with a TTY
    async fn attach(&self, container: &str) -> Result<PtyStream> {
        let handle = self.manager.start_existing(container).await?;
        let spec = ExecSpec::new(self.shell.clone()).with_env(self.env.clone());
        self.manager.engine().exec_pty(&handle.id, spec).await
    }

    /// Serve one client connection until either side disconnects
    pub async fn run<S, R, E>(
        &self,
        container: String,
        initial_size: Option<TerminalSize>,
        mut sink: S,
        mut stream: R,
    ) -> CloseReason
    where
        S: Sink<Message> + Unpin + Send,
        S::Error: Display,
        R: Stream<Item = std::result::Result<Message, E>> + Unpin + Send,
        E: Display,
    {
        let session_id = self.registry.register(&container).await;
        crate::metrics::record_terminal_opened();
        info!(session_id = %session_id, container = %container, "Terminal connection established");

        self.registry.set_phase(&session_id, SessionPhase::Attaching).await;

        let PtyStream {
            exec_id,
            mut output,
            mut input,
        } = match self.attach(&container).await {
            Ok(pty) => pty,
            Err(e) => {
                warn!(session_id = %session_id, container = %container, error = %e, "Failed to attach terminal");
                let reason = CloseReason::AttachFailed(e.to_string());
                let _ = sink.send(Message::Close(Some(reason.close_frame()))).await;
                let _ = sink.close().await;
                self.finish(&session_id, &reason).await;
                return reason;
            }
        };

        self.registry.set_exec(&session_id, &exec_id).await;
        self.registry.set_phase(&session_id, SessionPhase::Streaming).await;
        debug!(session_id = %session_id, exec_id = %exec_id, "Terminal streaming");

        let engine = self.manager.engine().as_ref();

        if let Some(size) = initial_size {
            self.apply_resize(engine, &session_id, &exec_id, size).await;
        }

        let closer = Closer::new();

        tokio::join!(
            pump_output(&mut output, &mut sink, &closer),
            self.pump_input(&mut stream, &mut input, engine, &session_id, &exec_id, &closer),
        );

        let reason = closer.reason();

        // Teardown: release the process stream, then the client
        drop(output);
        if let Err(e) = input.shutdown().await {
            debug!(session_id = %session_id, error = %e, "Process stdin already closed");
        }
        if reason.client_open() {
            let _ = sink.send(Message::Close(Some(reason.close_frame()))).await;
        }
        let _ = sink.close().await;

        self.finish(&session_id, &reason).await;
        reason
    }

    async fn pump_input<R, E>(
        &self,
        stream: &mut R,
        input: &mut (impl AsyncWrite + Unpin + Send),
        engine: &dyn ContainerEngine,
        session_id: &Uuid,
        exec_id: &str,
        closer: &Closer,
    ) where
        R: Stream<Item = std::result::Result<Message, E>> + Unpin + Send,
        E: Display,
    {
        loop {
            let message = tokio::select! {
                _ = closer.token.cancelled() => break,
                message = stream.next() => message,
            };

            let message = match message {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    closer.close(CloseReason::ClientError(e.to_string()));
                    break;
                }
                None => {
                    closer.close(CloseReason::ClientClosed);
                    break;
                }
            };

            match control::classify(message) {
                ClientInput::Resize(size) => {
                    self.apply_resize(engine, session_id, exec_id, size).await;
                }
                ClientInput::Data(bytes) => {
                    let written = match input.write_all(&bytes).await {
                        Ok(()) => input.flush().await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = written {
                        closer.close(CloseReason::StreamError(e.to_string()));
                        break;
                    }
                }
                ClientInput::Close => {
                    closer.close(CloseReason::ClientClosed);
                    break;
                }
                ClientInput::Ignore => {}
            }
        }
    }

    async fn apply_resize(
        &self,
        engine: &dyn ContainerEngine,
        session_id: &Uuid,
        exec_id: &str,
        size: TerminalSize,
    ) {
        match engine.resize_pty(exec_id, size).await {
            Ok(()) => self.registry.set_size(session_id, size).await,
            Err(e) => {
                warn!(session_id = %session_id, cols = size.cols, rows = size.rows, error = %e, "PTY resize failed")
            }
        }
    }

    async fn finish(&self, session_id: &Uuid, reason: &CloseReason) {
        self.registry.set_phase(session_id, SessionPhase::Closed).await;
        self.registry.remove(session_id).await;
        crate::metrics::record_terminal_closed(reason.as_str());
        info!(session_id = %session_id, reason = %reason.as_str(), "Terminal session closed");
    }
}

/// Forward process output to the client as binary frames, in order
async fn pump_output<S>(
    output: &mut BoxStream<'static, Result<Vec<u8>>>,
    sink: &mut S,
    closer: &Closer,
) where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display,
{
    loop {
        let chunk = tokio::select! {
            _ = closer.token.cancelled() => break,
            chunk = output.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => {
                if let Err(e) = sink.send(Message::Binary(bytes)).await {
                    closer.close(CloseReason::ClientError(e.to_string()));
                    break;
                }
            }
            Some(Err(e)) => {
                closer.close(CloseReason::StreamError(e.to_string()));
                break;
            }
            None => {
                closer.close(CloseReason::ProcessExited);
                break;
            }
        }
    }
}
