//! Registry of active sessions keyed by session id.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use super::types::{SessionError, SessionHandle};

/// Concurrency-safe table of running sessions.
///
/// Cloning shares the underlying table.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<SessionHandle>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. An id that is already active is rejected.
    pub async fn register(&self, session: Arc<SessionHandle>) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        let session_id = session.session_id().to_string();
        if sessions.contains_key(&session_id) {
            return Err(SessionError::DuplicateSession { session_id });
        }
        sessions.insert(session_id, session);
        drop(sessions);
        Ok(())
    }

    /// Look up an active session.
    pub async fn lookup(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Remove a session by id; no-op if absent.
    pub async fn remove(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        let removed = self.sessions.write().await.remove(session_id);
        if removed.is_some() {
            debug!(session_id, "Session removed from registry");
        }
        removed
    }

    /// Remove `session`'s entry, but only if it is still the registered one.
    pub(crate) async fn remove_entry(&self, session: &Arc<SessionHandle>) -> bool {
        let mut sessions = self.sessions.write().await;
        let is_same = sessions
            .get(session.session_id())
            .is_some_and(|s| Arc::ptr_eq(s, session));
        if is_same {
            sessions.remove(session.session_id());
        }
        is_same
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Ids of all active sessions.
    pub async fn ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Request termination of every active session. Returns how many were signalled.
    pub async fn kill_all(&self) -> usize {
        let sessions: Vec<Arc<SessionHandle>> =
            self.sessions.read().await.values().cloned().collect();
        let killed = sessions.iter().filter(|s| s.kill()).count();
        if killed > 0 {
            info!(count = killed, "Requested termination of all sessions");
        }
        killed
    }
}
