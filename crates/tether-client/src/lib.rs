//! # tether-client
//!
//! The client half of a tether link: one [`Client`] owns one WebSocket
//! connection, correlates invocations with their responses, watches inbound
//! traffic for liveness, and reopens the transport on its own when the link
//! goes silent.

#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod signal;

pub use config::ClientConfig;
pub use connection::Client;
pub use signal::{ConnectionState, Signal};
