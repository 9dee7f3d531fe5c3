//! Session manager for tracking active sessions
//!
//! Uses DashMap for concurrent access with entry API to avoid deadlocks.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::settings::SettingsManager;
use crate::transport::ClientHandle;
use crate::types::{AgentError, Engine, Result};

use super::session::Session;

/// Manager for active sessions
///
/// Provides thread-safe session storage and lookup using DashMap.
/// Uses entry API for atomic operations to prevent duplicate creation.
#[derive(Debug, Default)]
pub struct SessionManager {
    /// Active sessions keyed by session_id
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionManager {
    /// Create a new session manager
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Create a new session and store it
    pub fn create_session(
        &self,
        session_id: String,
        cwd: PathBuf,
        engine: Engine,
        model: Option<String>,
        client: ClientHandle,
        settings: Arc<SettingsManager>,
    ) -> Result<Arc<Session>> {
        let entry = self.sessions.entry(session_id.clone());
        match entry {
            dashmap::Entry::Occupied(_) => Err(AgentError::SessionAlreadyExists(session_id)),
            dashmap::Entry::Vacant(vacant) => {
                let session = Session::new(session_id, cwd, engine, model, client, settings);
                vacant.insert(Arc::clone(&session));
                Ok(session)
            }
        }
    }

    /// Get an existing session
    pub fn get_session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|r| Arc::clone(&r))
    }

    /// Get an existing session or return SessionNotFound error
    pub fn get_session_or_error(&self, session_id: &str) -> Result<Arc<Session>> {
        self.get_session(session_id)
            .ok_or_else(|| AgentError::SessionNotFound(session_id.to_string()))
    }

    /// Remove a session
    pub fn remove_session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.remove(session_id).map(|(_, v)| v)
    }

    /// Check if a session exists
    pub fn has_session(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Get the number of active sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Get all session IDs
    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|r| r.key().clone()).collect()
    }

    /// Shut down every session (bridges stopped, sockets unlinked)
    pub async fn shutdown_all(&self) {
        let sessions: Vec<Arc<Session>> =
            self.sessions.iter().map(|r| Arc::clone(&r)).collect();
        self.sessions.clear();
        for session in sessions {
            session.shutdown().await;
        }
    }
}
