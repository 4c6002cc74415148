//! Advisory MCP session registry.
//!
//! Sessions are created on `initialize` and removed on `DELETE /mcp`. The
//! registry never rejects a request for an unknown id; it exists so that
//! server-initiated notifications can reach open SSE streams.

use crate::constants::{
    MCP_DEFAULT_PROTOCOL_VERSION, MCP_SESSION_CHANNEL_CAPACITY, MCP_SESSION_ID_BYTES,
    MCP_SUPPORTED_PROTOCOL_VERSIONS,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::debug;

/// Where a session is in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// `initialize` answered, waiting for `initialized`.
    Initialized,
    /// Handshake complete.
    Ready,
}

pub struct Session {
    pub id: String,
    pub protocol_version: &'static str,
    pub created_at: Instant,
    state: Mutex<SessionState>,
    tx: broadcast::Sender<Value>,
}

impl Session {
    fn new(id: String, protocol_version: &'static str) -> Self {
        let (tx, _) = broadcast::channel(MCP_SESSION_CHANNEL_CAPACITY);
        Self {
            id,
            protocol_version,
            created_at: Instant::now(),
            state: Mutex::new(SessionState::Initialized),
            tx,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Receive server-initiated messages for this session.
    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.tx.subscribe()
    }

    /// Queue a message; returns how many open streams received it.
    pub fn send(&self, message: Value) -> usize {
        self.tx.send(message).unwrap_or(0)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("protocol_version", &self.protocol_version)
            .field("state", &self.state())
            .finish()
    }
}

/// In-memory session store.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session with a fresh id.
    pub fn create(&self, protocol_version: &'static str) -> Arc<Session> {
        let session = Arc::new(Session::new(generate_session_id(), protocol_version));
        self.sessions
            .write()
            .insert(session.id.clone(), Arc::clone(&session));
        debug!(session = %session.id, protocol = protocol_version, "MCP session created");
        session
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    /// Record the `initialized` notification. Unknown ids are ignored.
    pub fn mark_ready(&self, id: &str) -> bool {
        match self.get(id) {
            Some(session) => {
                *session.state.lock() = SessionState::Ready;
                true
            }
            None => false,
        }
    }

    /// Terminate a session; open streams for it end.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.sessions.write().remove(id).is_some();
        if removed {
            debug!(session = %id, "MCP session terminated");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send a message to every session; returns the number of streams reached.
    pub fn broadcast(&self, message: &Value) -> usize {
        let sessions: Vec<Arc<Session>> = self.sessions.read().values().cloned().collect();
        sessions
            .iter()
            .map(|session| session.send(message.clone()))
            .sum()
    }
}

/// 16 random bytes, base64url without padding (22 characters).
pub fn generate_session_id() -> String {
    let bytes: [u8; MCP_SESSION_ID_BYTES] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Whether `id` has the shape of an id produced by [`generate_session_id`].
pub fn is_valid_session_id(id: &str) -> bool {
    URL_SAFE_NO_PAD
        .decode(id)
        .map(|bytes| bytes.len() == MCP_SESSION_ID_BYTES)
        .unwrap_or(false)
}

/// Map a requested protocol version to one this server speaks.
///
/// Returns the version to use and whether the request was honoured as-is.
pub fn negotiate_protocol_version(requested: Option<&str>) -> (&'static str, bool) {
    match requested {
        None => (MCP_DEFAULT_PROTOCOL_VERSION, true),
        Some(v) => match MCP_SUPPORTED_PROTOCOL_VERSIONS.iter().find(|s| **s == v) {
            Some(supported) => (*supported, true),
            None => (MCP_DEFAULT_PROTOCOL_VERSION, false),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_session_id_shape() {
        let id = generate_session_id();
        assert_eq!(id.len(), 22);
        assert!(id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert!(is_valid_session_id(&id));
        assert_ne!(id, generate_session_id());
    }

    #[test]
    fn test_invalid_session_ids() {
        assert!(!is_valid_session_id(""));
        assert!(!is_valid_session_id("short"));
        assert!(!is_valid_session_id("not+valid/base64url====="));
    }

    #[test]
    fn test_negotiate_protocol_version() {
        assert_eq!(negotiate_protocol_version(None), ("2025-03-26", true));
        assert_eq!(
            negotiate_protocol_version(Some("2024-11-05")),
            ("2024-11-05", true)
        );
        assert_eq!(
            negotiate_protocol_version(Some("1999-01-01")),
            ("2025-03-26", false)
        );
    }

    #[test]
    fn test_session_lifecycle() {
        let registry = SessionRegistry::new();
        let session = registry.create("2025-03-26");
        assert_eq!(registry.len(), 1);
        assert_eq!(session.state(), SessionState::Initialized);

        assert!(registry.mark_ready(&session.id));
        assert_eq!(session.state(), SessionState::Ready);
        assert!(!registry.mark_ready("unknown"));

        assert!(registry.remove(&session.id));
        assert!(!registry.remove(&session.id));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscribers() {
        let registry = SessionRegistry::new();
        let a = registry.create("2025-03-26");
        let _b = registry.create("2025-03-26");
        let mut rx = a.subscribe();

        let delivered = registry.broadcast(&json!({"method": "x"}));
        assert_eq!(delivered, 1);
        assert_eq!(rx.recv().await.unwrap(), json!({"method": "x"}));
    }
}
