//! Interactive TTY sessions bridged over WebSocket
//!
//! Each WebSocket connection owns at most one PTY-mode exec inside the target
//! container. Live sessions are tracked in a [`SessionRegistry`].

pub mod bridge;
pub mod control;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::container::TerminalSize;

pub use bridge::{CloseReason, TerminalBridge};

/// Per-connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Connecting,
    Attaching,
    Streaming,
    Closed,
}

/// A live terminal session
#[derive(Debug, Clone, Serialize)]
pub struct TerminalSession {
    pub session_id: Uuid,
    pub container: String,
    pub exec_id: Option<String>,
    pub phase: SessionPhase,
    pub size: Option<TerminalSize>,
    pub created_at: DateTime<Utc>,
}

/// Live terminal sessions by ID
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, TerminalSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new connection in the `Connecting` phase
    pub async fn register(&self, container: &str) -> Uuid {
        let session_id = Uuid::new_v4();
        let session = TerminalSession {
            session_id,
            container: container.to_string(),
            exec_id: None,
            phase: SessionPhase::Connecting,
            size: None,
            created_at: Utc::now(),
        };
        self.sessions.write().await.insert(session_id, session);
        session_id
    }

    pub async fn set_phase(&self, session_id: &Uuid, phase: SessionPhase) {
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            session.phase = phase;
        }
    }

    pub async fn set_exec(&self, session_id: &Uuid, exec_id: &str) {
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            session.exec_id = Some(exec_id.to_string());
        }
    }

    pub async fn set_size(&self, session_id: &Uuid, size: TerminalSize) {
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            session.size = Some(size);
        }
    }

    /// Remove a session, returning it if it was still registered
    pub async fn remove(&self, session_id: &Uuid) -> Option<TerminalSession> {
        self.sessions.write().await.remove(session_id)
    }

    pub async fn get(&self, session_id: &Uuid) -> Option<TerminalSession> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// List active sessions, oldest first
    pub async fn list(&self) -> Vec<TerminalSession> {
        let mut sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    pub async fn count(&self) -> u64 {
        self.sessions.read().await.len() as u64
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_registry_lifecycle() {
        let registry = SessionRegistry::new();
        let id = registry.register("secbox-vm").await;

        registry.set_phase(&id, SessionPhase::Streaming).await;
        registry.set_exec(&id, "exec-1").await;
        registry.set_size(&id, TerminalSize { cols: 100, rows: 30 }).await;

        let session = registry.get(&id).await.unwrap();
        assert_eq!(session.phase, SessionPhase::Streaming);
        assert_eq!(session.exec_id.as_deref(), Some("exec-1"));
        assert_eq!(registry.count().await, 1);

        assert!(registry.remove(&id).await.is_some());
        assert!(registry.remove(&id).await.is_none());
        assert!(registry.list().await.is_empty());
    }
}
