//! Connection state and the typed signal bus.

use serde_json::Value;

/// Observable lifecycle state of a [`crate::Client`].
///
/// `Broken` is a software-detected overlay: the liveness monitor saw no
/// traffic within its deadline. It clears the moment a fresh transport
/// reports open. The other four mirror the transport's own readiness.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport handshake in progress.
    Connecting = 0,
    /// Transport open and usable.
    Open = 1,
    /// Transport shutting down.
    Closing = 2,
    /// No transport attached.
    Closed = 3,
    /// Liveness deadline elapsed; recovery in progress.
    Broken = 4,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
            Self::Broken => write!(f, "broken"),
        }
    }
}

/// Everything a [`crate::Client`] can notify its embedder about, delivered
/// over a broadcast channel. The first three are the connection's own
/// lifecycle notifications — the reserved `wsopen`/`wsclose`/`wsbroken`
/// names guard them; `Event` carries application events pushed by the peer.
#[derive(Clone, Debug, PartialEq)]
pub enum Signal {
    /// The transport became open.
    Open,
    /// The transport closed (deliberately or because the peer went away).
    Closed,
    /// The liveness deadline elapsed; an automatic reopen follows.
    Broken,
    /// The peer pushed a named event.
    Event {
        /// Event name (never one of the reserved lifecycle names).
        event: String,
        /// Event payload.
        data: Value,
    },
}
