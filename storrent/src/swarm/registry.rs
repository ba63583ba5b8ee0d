use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::peer::peer_message::Message;
use crate::peer::session_handle::SessionHandle;

/// Posible `SessionRegistry` errors.
#[derive(Debug)]
pub enum RegistryError {
    PoisonedLock,
}

/// The one place that knows every live peer session.
///
/// Sessions register themselves after the handshake and are removed on
/// close; the choking controller, the supervisor and the HAVE/cancel
/// broadcasts all work off this registry instead of sharing raw maps.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session. Returns false (without replacing) when a
    /// session with the same key is already live.
    pub fn insert(&self, handle: Arc<SessionHandle>) -> Result<bool, RegistryError> {
        let mut sessions = self.lock_sessions()?;
        if sessions.contains_key(handle.key()) {
            return Ok(false);
        }
        sessions.insert(handle.key().to_string(), handle);
        Ok(true)
    }

    pub fn remove(&self, key: &str) -> Result<Option<Arc<SessionHandle>>, RegistryError> {
        Ok(self.lock_sessions()?.remove(key))
    }

    pub fn get(&self, key: &str) -> Result<Option<Arc<SessionHandle>>, RegistryError> {
        Ok(self.lock_sessions()?.get(key).cloned())
    }

    /// A point-in-time copy of every live session handle.
    pub fn snapshot(&self) -> Vec<Arc<SessionHandle>> {
        match self.sessions.lock() {
            Ok(sessions) => sessions.values().cloned().collect(),
            Err(_) => vec![],
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().map(|sessions| sessions.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Announces a freshly verified piece to every open session. Only the
    /// verification path may call this.
    pub fn broadcast_have(&self, piece: u32) {
        for handle in self.snapshot() {
            if !handle.is_closed() {
                let _ = handle.send(&Message::have(piece));
            }
        }
    }

    /// Sends `cancel` for the block to every session other than `except`
    /// that still has it in flight, and drops it from their pipelines.
    /// Returns how many sessions were canceled.
    pub fn cancel_duplicates(&self, piece: u32, offset: u32, except: &str) -> usize {
        let mut canceled = 0;
        for handle in self.snapshot() {
            if handle.key() == except || handle.is_closed() {
                continue;
            }
            let removed = match handle.lock_status() {
                Ok(mut status) => match status.active_requests.remove(&(piece, offset)) {
                    Some(request) => {
                        status.pending_count = status.pending_count.saturating_sub(1);
                        Some(request.length)
                    }
                    None => None,
                },
                Err(_) => None,
            };
            if let Some(length) = removed {
                let _ = handle.send(&Message::cancel(piece, offset, length));
                canceled += 1;
            }
        }
        canceled
    }

    fn lock_sessions(
        &self,
    ) -> Result<MutexGuard<HashMap<String, Arc<SessionHandle>>>, RegistryError> {
        self.sessions
            .lock()
            .map_err(|_| RegistryError::PoisonedLock)
    }
}
