//! Active-session cancel table.
//!
//! Maps in-flight session ids to their work cancellation tokens so a stop
//! intent arriving on a different task can interrupt a running start.

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

/// Registry of cancel handles for in-flight session tasks.
#[derive(Default)]
pub struct ActiveSessions {
    map: DashMap<String, CancellationToken>,
}

impl ActiveSessions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the work token for a session, replacing any stale entry
    /// from a previous attempt.
    pub fn register(&self, session_id: &str, token: CancellationToken) {
        self.map.insert(session_id.to_string(), token);
    }

    /// Cancels the session's work if it is registered. Returns whether a
    /// handle was found; stop handling tolerates `false` (the stop may have
    /// arrived before the start registered).
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.map.get(session_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn unregister(&self, session_id: &str) {
        self.map.remove(session_id);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
