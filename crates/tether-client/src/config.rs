//! Client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_proto::{DEFAULT_CALL_TIMEOUT, DEFAULT_LIVENESS_TIMEOUT};

/// Configuration for a [`crate::Client`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Deadline for a single `invoke` (default 20 s).
    pub call_timeout: Duration,
    /// Maximum inbound silence before the connection is declared broken
    /// (default 15 s). Also paces retries after a failed reconnect.
    pub liveness_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
        }
    }
}

impl ClientConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-call deadline.
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Set the liveness deadline.
    #[must_use]
    pub fn with_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout = timeout;
        self
    }
}
