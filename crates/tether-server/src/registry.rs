//! Live session set and event fan-out.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

use tether_proto::{Envelope, Event};

use crate::session::SessionHandle;

/// Tracks every live session for broadcast and cleanup.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, handle: SessionHandle) {
        let _ = self.sessions.write().insert(handle.id().to_owned(), handle);
    }

    pub(crate) fn remove(&self, id: &str) -> bool {
        self.sessions.write().remove(id).is_some()
    }

    /// Look up a live session by id.
    pub fn get(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.read().get(id).cloned()
    }

    /// Snapshot of every live session handle.
    pub fn handles(&self) -> Vec<SessionHandle> {
        self.sessions.read().values().cloned().collect()
    }

    /// Number of live sessions.
    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Fan a named event out to every live session, best-effort. Returns
    /// how many sessions accepted it.
    pub fn broadcast(&self, event: impl Into<String>, data: Value) -> usize {
        let json = match Envelope::Event(Event::new(event, data)).encode() {
            Ok(json) => json,
            Err(error) => {
                warn!(%error, "failed to serialize event");
                return 0;
            }
        };

        let mut recipients = 0;
        for handle in self.handles() {
            if handle.send_raw(json.clone()) {
                recipients += 1;
            } else {
                warn!(session = %handle.id(), "failed to enqueue event (queue full or session gone)");
            }
        }
        debug!(recipients, "broadcast event");
        recipients
    }
}
