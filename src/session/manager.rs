//! Session registry: creation, lookup, and bulk teardown.
//!
//! The manager is the only long-lived owner of sessions. All registry
//! mutation happens under one lock, so no caller can observe a
//! half-registered session. There is no ambient global registry — the
//! manager is passed by reference wherever sessions are needed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};
use uuid::Uuid;

use crate::agent::args::PromptOptions;
use crate::agent::client::AgentClient;
use crate::session::session::Session;
use crate::{AppError, Result};

/// Options for [`SessionManager::create_session`].
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Caller-provided identifier; generated when absent.
    pub id: Option<String>,
    /// Session-scoped prompt options; manager defaults when absent.
    pub prompt_options: Option<PromptOptions>,
}

/// Exclusive owner of the identifier → session mapping.
pub struct SessionManager {
    client: Arc<AgentClient>,
    defaults: PromptOptions,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionManager {
    /// Create an empty registry over `client`, with `defaults` applied
    /// to sessions created without their own prompt options.
    #[must_use]
    pub fn new(client: Arc<AgentClient>, defaults: PromptOptions) -> Self {
        Self {
            client,
            defaults,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate and register a fresh session.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Session`] if a caller-provided identifier is
    /// already registered.
    pub fn create_session(&self, options: Option<SessionOptions>) -> Result<Arc<Session>> {
        let options = options.unwrap_or_default();
        let id = options.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let prompt_options = options
            .prompt_options
            .unwrap_or_else(|| self.defaults.clone());

        let session = Session::new(id.clone(), Arc::clone(&self.client), prompt_options);

        let mut map = self.lock_sessions();
        if map.contains_key(&id) {
            return Err(AppError::Session(format!("session {id} already exists")));
        }
        map.insert(id.clone(), Arc::clone(&session));
        drop(map);

        debug!(session_id = %id, "session created");
        Ok(session)
    }

    /// Look up a session by identifier.
    #[must_use]
    pub fn get_session(&self, id: &str) -> Option<Arc<Session>> {
        self.lock_sessions().get(id).cloned()
    }

    /// Destroy and deregister a session. A no-op for unknown ids.
    pub fn destroy_session(&self, id: &str) {
        let removed = self.lock_sessions().remove(id);
        if let Some(session) = removed {
            session.destroy();
            debug!(session_id = %id, "session destroyed");
        }
    }

    /// Destroy every registered session and empty the registry.
    pub fn destroy_all(&self) {
        let drained: Vec<Arc<Session>> = {
            let mut map = self.lock_sessions();
            map.drain().map(|(_, session)| session).collect()
        };
        let count = drained.len();
        for session in drained {
            session.destroy();
        }
        if count > 0 {
            info!(count, "destroyed all sessions");
        }
    }

    /// Number of live registered sessions.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.lock_sessions().len()
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("active_sessions", &self.active_sessions())
            .finish_non_exhaustive()
    }
}
