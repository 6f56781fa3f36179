//! Wire-format envelopes and the rule that tells them apart.
//!
//! Every frame is one JSON object. Classification looks at which fields are
//! present, in order: an `event` field makes it an [`Event`]; otherwise `id`
//! plus `method` makes it a [`Call`]; a bare `id` makes it a [`Response`];
//! a `ping` field is heartbeat noise. Anything else is malformed and gets
//! dropped by the receiving loop — never delivered, never fatal.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle notification: the transport became open.
pub const EVENT_OPEN: &str = "wsopen";
/// Lifecycle notification: the transport closed.
pub const EVENT_CLOSE: &str = "wsclose";
/// Lifecycle notification: the liveness deadline elapsed.
pub const EVENT_BROKEN: &str = "wsbroken";

/// Event names owned by the connection itself. A remote peer reusing one of
/// these is discarded so an application event can never impersonate a
/// lifecycle signal.
pub const RESERVED_EVENTS: [&str; 3] = [EVENT_OPEN, EVENT_CLOSE, EVENT_BROKEN];

/// Whether `name` collides with a connection lifecycle notification.
pub fn is_reserved_event(name: &str) -> bool {
    RESERVED_EVENTS.contains(&name)
}

/// A request to execute a named method on the remote peer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Call {
    /// Unique call identifier, echoed by the matching [`Response`].
    pub id: String,
    /// Method name.
    pub method: String,
    /// Positional parameters.
    #[serde(default)]
    pub params: Vec<Value>,
}

impl Call {
    /// Build a call with a fresh random id.
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            method: method.into(),
            params,
        }
    }
}

/// The outcome of a [`Call`], correlated by id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Echoed call identifier.
    pub id: String,
    /// Result payload (present on success).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// String-rendered failure (present on error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    /// Build a success response.
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response.
    pub fn err(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(error.into()),
        }
    }

    /// Collapse into the caller-facing outcome. An `error` field wins over
    /// any `result`; a success with no `result` yields `null`.
    pub fn into_result(self) -> Result<Value, String> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// A one-way, uncorrelated named payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event name.
    pub event: String,
    /// Event payload.
    #[serde(default)]
    pub data: Value,
}

impl Event {
    /// Build an event.
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// Server-sent heartbeat frame. Exists only to be inbound traffic for the
/// peer's liveness monitor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    /// Millisecond wall-clock timestamp at send time.
    pub ping: u64,
}

impl Ping {
    /// A ping stamped with the current time.
    #[allow(clippy::cast_possible_truncation)]
    pub fn now() -> Self {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self { ping: ms }
    }
}

/// One classified unit of wire traffic.
#[derive(Clone, Debug, PartialEq)]
pub enum Envelope {
    /// Remote method invocation request.
    Call(Call),
    /// Result or error for an earlier call.
    Response(Response),
    /// Uncorrelated named payload.
    Event(Event),
    /// Heartbeat frame.
    Ping(Ping),
}

/// Why a frame could not be classified.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The frame was not valid JSON, or a recognized shape had the wrong
    /// field types.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// Valid JSON, but no classifying field was present.
    #[error("unclassifiable message")]
    Unclassifiable,
}

impl Envelope {
    /// Classify and decode one text frame.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(text)?;
        if value.get("event").is_some() {
            Ok(Self::Event(serde_json::from_value(value)?))
        } else if value.get("id").is_some() {
            if value.get("method").is_some() {
                Ok(Self::Call(serde_json::from_value(value)?))
            } else {
                Ok(Self::Response(serde_json::from_value(value)?))
            }
        } else if value.get("ping").is_some() {
            Ok(Self::Ping(serde_json::from_value(value)?))
        } else {
            Err(DecodeError::Unclassifiable)
        }
    }

    /// Serialize to one text frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::Call(c) => serde_json::to_string(c),
            Self::Response(r) => serde_json::to_string(r),
            Self::Event(e) => serde_json::to_string(e),
            Self::Ping(p) => serde_json::to_string(p),
        }
    }
}

impl From<Call> for Envelope {
    fn from(c: Call) -> Self {
        Self::Call(c)
    }
}

impl From<Response> for Envelope {
    fn from(r: Response) -> Self {
        Self::Response(r)
    }
}

impl From<Event> for Envelope {
    fn from(e: Event) -> Self {
        Self::Event(e)
    }
}

impl From<Ping> for Envelope {
    fn from(p: Ping) -> Self {
        Self::Ping(p)
    }
}
