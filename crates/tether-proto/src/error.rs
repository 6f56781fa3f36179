//! Error kinds surfaced to the invoking side.

use std::time::Duration;

/// Why an invocation failed. Each kind is local to the one call that
/// observed it; none of them poisons the connection.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    /// A send was attempted while no transport was attached.
    #[error("not connected")]
    NotConnected,

    /// The call's deadline elapsed with no matching response.
    #[error("call {id} timed out after {timeout:?}")]
    Timeout {
        /// The unanswered call's id.
        id: String,
        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// The remote handler failed; the message is the peer's own rendering
    /// of the failure (an unknown method arrives this way too).
    #[error("{0}")]
    Remote(String),

    /// The connection was deliberately closed while the call was in flight,
    /// or before it was issued.
    #[error("connection closed")]
    Closed,
}

impl CallError {
    /// Whether this failure came from the remote peer rather than the
    /// local connection machinery.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }
}
