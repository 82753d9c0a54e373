//! Session registry.
//!
//! The registry is the authoritative answer to "is this stream running on
//! this host". It is only touched while the scheduler's state lock is held.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::launcher::ProcessHandle;

/// One running external process for a stream.
///
/// The session exclusively owns its process handle. Dropping a session
/// requests termination, so a session can never leak its process.
#[derive(Debug)]
pub struct Session {
    /// Unique per launch, so a late exit notice never matches a newer session.
    pub session_id: String,
    pub stream_id: String,
    pub started_at: DateTime<Utc>,
    handle: ProcessHandle,
}

impl Session {
    pub fn new(stream_id: impl Into<String>, session_id: impl Into<String>, handle: ProcessHandle) -> Self {
        Self {
            session_id: session_id.into(),
            stream_id: stream_id.into(),
            started_at: Utc::now(),
            handle,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.pid()
    }

    /// Ask the process to stop. Idempotent.
    pub fn terminate(&self) {
        self.handle.terminate();
    }

    /// Whether a stop has already been requested for this session.
    pub fn is_terminating(&self) -> bool {
        self.handle.is_terminating()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.handle.terminate();
    }
}

/// Error returned by registry mutations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Session already registered for stream: {0}")]
    AlreadyRegistered(String),
}

/// Map of stream id to its running session.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session.
    ///
    /// Fails if the stream already has one; the rejected session is dropped,
    /// which terminates its process.
    pub fn put(&mut self, id: impl Into<String>, session: Session) -> Result<(), RegistryError> {
        let id = id.into();
        if self.sessions.contains_key(&id) {
            return Err(RegistryError::AlreadyRegistered(id));
        }
        self.sessions.insert(id, session);
        Ok(())
    }

    /// Remove a session. Removing an absent id is a no-op.
    pub fn remove(&mut self, id: &str) -> Option<Session> {
        self.sessions.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn size(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Ids of all registered streams, sorted for stable output.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }
}
