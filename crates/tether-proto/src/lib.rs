//! # tether-proto
//!
//! The wire protocol shared by the `tether` client and server:
//! envelope shapes and their classification rule, the error kinds an
//! invocation can surface, and the pending-call registry that matches
//! responses to outstanding calls exactly once.

#![deny(unsafe_code)]

pub mod envelope;
pub mod error;
pub mod pending;

pub use envelope::{Call, Envelope, Event, Ping, Response};
pub use error::CallError;
pub use pending::PendingCalls;

use std::time::Duration;

/// Default deadline for a single remote call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(20);

/// Default maximum inbound silence before a connection is declared broken.
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(15);

/// Default interval between server-sent heartbeat pings.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
