//! Server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_proto::DEFAULT_HEARTBEAT_INTERVAL;

/// Configuration for a [`crate::Server`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Interval between unconditional heartbeat pings sent to every
    /// connected peer (default 1 s).
    pub heartbeat_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}
