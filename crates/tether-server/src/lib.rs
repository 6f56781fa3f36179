//! # tether-server
//!
//! The accept side of a tether link: a listener that wraps each inbound
//! WebSocket connection in a session, binds it to a request handler (a
//! single callable or a method table, optionally produced per session by a
//! factory), dispatches calls, forwards handler events, and keeps the peer's
//! liveness monitor fed with periodic heartbeat pings.

#![deny(unsafe_code)]

pub mod config;
pub mod handler;
pub mod registry;
pub mod server;
pub mod session;

pub use config::ServerConfig;
pub use handler::{
    Api, ApiProvider, DirectHandler, EventSource, HandlerBinding, HandlerError, MethodHandler,
    MethodTable,
};
pub use registry::SessionRegistry;
pub use server::Server;
pub use session::{SessionHandle, SessionInfo};
