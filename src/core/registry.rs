//! Process-wide table of live call sessions.
//!
//! The registry maps a call identifier to its session without owning it: the
//! bridge task that runs the call holds the only strong reference, and the
//! entry is erased exactly once at teardown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;

use crate::core::session::CallSession;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("A session for call {0} is already registered")]
    Duplicate(String),

    #[error("Session capacity reached ({0} active calls)")]
    CapacityReached(usize),
}

/// Concurrent call-id → session lookup with an optional session cap.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Weak<CallSession>>,
    max_sessions: Option<usize>,
    /// Number of entries, maintained next to the map so the cap can be
    /// enforced without locking every shard
    entries: AtomicUsize,
}

impl SessionRegistry {
    pub fn new(max_sessions: Option<usize>) -> Self {
        Self {
            sessions: DashMap::new(),
            max_sessions,
            entries: AtomicUsize::new(0),
        }
    }

    pub fn max_sessions(&self) -> Option<usize> {
        self.max_sessions
    }

    /// Register a session under its call id.
    pub fn insert(&self, session: &Arc<CallSession>) -> Result<(), RegistryError> {
        let call_id = session.call_id().to_string();

        if let Some(max) = self.max_sessions {
            let reserved = self.entries.fetch_add(1, Ordering::SeqCst);
            if reserved >= max {
                self.entries.fetch_sub(1, Ordering::SeqCst);
                return Err(RegistryError::CapacityReached(max));
            }
        } else {
            self.entries.fetch_add(1, Ordering::SeqCst);
        }

        match self.sessions.entry(call_id) {
            Entry::Occupied(mut entry) => {
                // The slot is already counted; give back this reservation either way
                self.entries.fetch_sub(1, Ordering::SeqCst);
                if entry.get().strong_count() > 0 {
                    return Err(RegistryError::Duplicate(entry.key().clone()));
                }
                tracing::warn!(call_id = %entry.key(), "Replacing stale registry entry");
                entry.insert(Arc::downgrade(session));
                Ok(())
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::downgrade(session));
                Ok(())
            }
        }
    }

    /// Erase the entry for `session`. Returns `true` only for the call that
    /// actually removed it.
    pub fn remove(&self, session: &Arc<CallSession>) -> bool {
        let removed = self
            .sessions
            .remove_if(session.call_id(), |_, weak| {
                std::ptr::eq(weak.as_ptr(), Arc::as_ptr(session))
            })
            .is_some();

        if removed {
            self.entries.fetch_sub(1, Ordering::SeqCst);
        }
        removed
    }

    /// Look up a live session.
    pub fn get(&self, call_id: &str) -> Option<Arc<CallSession>> {
        self.sessions.get(call_id).and_then(|weak| weak.upgrade())
    }

    pub fn contains(&self, call_id: &str) -> bool {
        self.get(call_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Whether a new session would be refused.
    pub fn is_at_capacity(&self) -> bool {
        self.max_sessions
            .is_some_and(|max| self.entries.load(Ordering::SeqCst) >= max)
    }
}
