use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Live streaming sessions by id, so a client can cancel one it started.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, CancellationToken>>,
}

/// Registration for one session. Dropping it unregisters the session, so the
/// entry disappears on every exit path of the stream that owns it.
#[derive(Debug)]
pub struct SessionHandle {
    id: String,
    token: CancellationToken,
    registry: Arc<SessionRegistry>,
}

impl SessionRegistry {
    pub fn register(self: &Arc<Self>) -> SessionHandle {
        let id = Uuid::new_v4().to_string();
        let token = CancellationToken::new();
        self.lock().insert(id.clone(), token.clone());
        debug!(session_id = %id, "session registered");
        SessionHandle {
            id,
            token,
            registry: Arc::clone(self),
        }
    }

    /// Returns `false` when no live session has this id.
    pub fn cancel(&self, id: &str) -> bool {
        match self.lock().get(id) {
            Some(token) => {
                token.cancel();
                debug!(session_id = %id, "session cancelled by client");
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.id);
    }
}
