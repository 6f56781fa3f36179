//! Request handler bindings and dispatch.
//!
//! A session's handler is resolved once at bind time into a tagged
//! [`HandlerBinding`]: either one callable that receives the method name, or
//! a method-name lookup table. Either shape may expose an [`EventSource`]
//! the session forwards to the peer as event envelopes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;

use tether_proto::{Call, Event, Response};

use crate::session::SessionInfo;

const EVENT_SOURCE_CAPACITY: usize = 64;

/// Failure produced while servicing one call. Rendered to a string in the
/// response envelope; never structured on the wire.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// No handler entry matched the method name.
    #[error("Unknown method {0}")]
    UnknownMethod(String),
    /// The handler itself failed.
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    /// Build a [`HandlerError::Failed`] from any message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::Failed(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::Failed(message.into())
    }
}

/// One named method in a [`MethodTable`].
#[async_trait]
pub trait MethodHandler: Send + Sync {
    /// Execute with the call's positional parameters.
    async fn handle(&self, params: Vec<Value>) -> Result<Value, HandlerError>;
}

/// A single callable that multiplexes every method itself.
#[async_trait]
pub trait DirectHandler: Send + Sync {
    /// Execute `method` with the call's positional parameters.
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, HandlerError>;
}

/// Method-name lookup table.
#[derive(Default)]
pub struct MethodTable {
    handlers: HashMap<String, Arc<dyn MethodHandler>>,
}

impl MethodTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a method name, replacing any previous entry.
    pub fn register(&mut self, method: &str, handler: impl MethodHandler + 'static) {
        let _ = self.handlers.insert(method.to_owned(), Arc::new(handler));
    }

    /// Whether a method is registered.
    pub fn has_method(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    /// All registered method names (sorted).
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    fn get(&self, method: &str) -> Option<Arc<dyn MethodHandler>> {
        self.handlers.get(method).cloned()
    }
}

/// Outbound event channel a handler can expose. Emissions are forwarded to
/// the bound session verbatim as event envelopes, best-effort.
#[derive(Clone)]
pub struct EventSource {
    tx: broadcast::Sender<Event>,
}

impl EventSource {
    /// Create a new event source.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_SOURCE_CAPACITY);
        Self { tx }
    }

    /// Emit a named event toward every subscribed session. Lost emissions
    /// (no subscriber yet) are logged, not errors.
    pub fn emit(&self, event: impl Into<String>, data: Value) {
        let event = Event::new(event, data);
        if self.tx.send(event).is_err() {
            warn!("event emitted with no bound session");
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventSource {
    fn default() -> Self {
        Self::new()
    }
}

/// How inbound calls reach handler code.
#[derive(Clone)]
pub enum HandlerBinding {
    /// One callable taking `(method, params)`.
    Direct(Arc<dyn DirectHandler>),
    /// Method-name lookup table.
    Table(Arc<MethodTable>),
}

/// The API bound to one session: a dispatch shape plus an optional event
/// source.
#[derive(Clone)]
pub struct Api {
    binding: HandlerBinding,
    events: Option<EventSource>,
}

impl Api {
    /// Bind a single multiplexing callable.
    pub fn direct(handler: impl DirectHandler + 'static) -> Self {
        Self {
            binding: HandlerBinding::Direct(Arc::new(handler)),
            events: None,
        }
    }

    /// Bind a method table.
    pub fn table(table: MethodTable) -> Self {
        Self {
            binding: HandlerBinding::Table(Arc::new(table)),
            events: None,
        }
    }

    /// Attach an event source whose emissions the session forwards to the
    /// peer.
    #[must_use]
    pub fn with_events(mut self, events: EventSource) -> Self {
        self.events = Some(events);
        self
    }

    /// The attached event source, if any.
    pub fn events(&self) -> Option<&EventSource> {
        self.events.as_ref()
    }

    /// Service one call and produce its response.
    ///
    /// Every failure path — lookup miss included — becomes an error
    /// response addressed to the call's id, never a transport-level
    /// failure.
    pub async fn dispatch(&self, call: Call) -> Response {
        let Call { id, method, params } = call;
        let outcome = match &self.binding {
            HandlerBinding::Direct(handler) => handler.call(&method, params).await,
            HandlerBinding::Table(table) => match table.get(&method) {
                Some(handler) => handler.handle(params).await,
                None => Err(HandlerError::UnknownMethod(method)),
            },
        };
        match outcome {
            Ok(result) => Response::ok(id, result),
            Err(error) => Response::err(id, error.to_string()),
        }
    }
}

/// What the server binds sessions to: one shared API, or a factory invoked
/// per accepted session.
pub enum ApiProvider {
    /// Every session shares the same API.
    Shared(Api),
    /// Each session gets the factory's output for its own metadata.
    Factory(Arc<dyn Fn(&SessionInfo) -> Api + Send + Sync>),
}

impl ApiProvider {
    /// Build a per-session factory provider.
    pub fn factory(factory: impl Fn(&SessionInfo) -> Api + Send + Sync + 'static) -> Self {
        Self::Factory(Arc::new(factory))
    }

    pub(crate) fn resolve(&self, info: &SessionInfo) -> Api {
        match self {
            Self::Shared(api) => api.clone(),
            Self::Factory(factory) => factory(info),
        }
    }
}

impl From<Api> for ApiProvider {
    fn from(api: Api) -> Self {
        Self::Shared(api)
    }
}
