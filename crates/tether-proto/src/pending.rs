//! Registry of outstanding calls awaiting their responses.
//!
//! Owned exclusively by the task driving one connection; that task
//! serializes every mutation, so no internal locking is needed. Exactly-once
//! resolution falls out of ownership: completing a call consumes its oneshot
//! sender, and whichever path removes the entry first wins — the other finds
//! nothing.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::envelope::Response;
use crate::error::CallError;

/// What a waiting caller eventually receives.
pub type CallReply = Result<Value, CallError>;

/// Outstanding calls keyed by call id.
#[derive(Default)]
pub struct PendingCalls {
    waiters: HashMap<String, oneshot::Sender<CallReply>>,
}

impl PendingCalls {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter under `id`, returning the receiving half.
    pub fn register(&mut self, id: impl Into<String>) -> oneshot::Receiver<CallReply> {
        let (tx, rx) = oneshot::channel();
        self.insert(id, tx);
        rx
    }

    /// Register an externally created waiter under `id`.
    pub fn insert(&mut self, id: impl Into<String>, waiter: oneshot::Sender<CallReply>) {
        let _ = self.waiters.insert(id.into(), waiter);
    }

    /// Complete the waiter matching `response`, if any.
    ///
    /// Returns `false` when no waiter exists — a late response arriving
    /// after its call already timed out, which is silently ignored.
    pub fn resolve(&mut self, response: Response) -> bool {
        let Some(waiter) = self.waiters.remove(&response.id) else {
            return false;
        };
        let _ = waiter.send(response.into_result().map_err(CallError::Remote));
        true
    }

    /// Drop the waiter for `id` without completing it (the caller already
    /// gave up). Returns whether an entry existed.
    pub fn cancel(&mut self, id: &str) -> bool {
        self.waiters.remove(id).is_some()
    }

    /// Drain every waiter, completing each with `error`.
    pub fn fail_all(&mut self, error: &CallError) {
        for (_, waiter) in self.waiters.drain() {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    /// Number of outstanding calls.
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Whether no calls are outstanding.
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}
