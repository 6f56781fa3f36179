//! Per-connection session lifecycle — from accept through disconnect.
//!
//! Each accepted transport gets one session task that owns the socket, the
//! resolved handler binding, and the heartbeat timer. Heartbeat pings are
//! unconditional: the server sends them so the peer's liveness monitor
//! always has traffic to reset on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tether_proto::{Envelope, Event, Ping};

use crate::handler::{Api, EventSource};
use crate::registry::SessionRegistry;

pub(crate) const SESSION_QUEUE: usize = 256;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Immutable metadata captured when a connection is accepted.
#[derive(Clone, Debug)]
pub struct SessionInfo {
    /// Unique session identifier.
    pub id: String,
    /// Handshake headers as a lookup, names lowercased. Duplicate headers
    /// keep the last value.
    pub headers: HashMap<String, String>,
    /// Handshake headers in wire order.
    pub raw_headers: Vec<(String, String)>,
    /// Whether the transport layer authenticated the peer. Stays `false`
    /// unless the embedder terminates TLS itself and says otherwise.
    pub authorized: bool,
    /// Already-parsed peer certificate metadata, when the transport
    /// provides one.
    pub peer_cert: Option<Value>,
}

impl SessionInfo {
    /// Build session metadata from the handshake's ordered header list.
    pub fn from_raw_headers(raw_headers: Vec<(String, String)>) -> Self {
        let mut headers = HashMap::new();
        for (name, value) in &raw_headers {
            let _ = headers.insert(name.to_ascii_lowercase(), value.clone());
        }
        Self {
            id: Uuid::new_v4().to_string(),
            headers,
            raw_headers,
            authorized: false,
            peer_cert: None,
        }
    }

    /// Attach transport-level TLS metadata.
    #[must_use]
    pub fn with_tls(mut self, authorized: bool, peer_cert: Option<Value>) -> Self {
        self.authorized = authorized;
        self.peer_cert = peer_cert;
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

pub(crate) enum SessionCommand {
    Send(String),
    Rebind(Api),
    Close,
}

/// Cheap handle to a live session, held by the registry.
#[derive(Clone)]
pub struct SessionHandle {
    info: Arc<SessionInfo>,
    cmd_tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub(crate) fn new(info: Arc<SessionInfo>, cmd_tx: mpsc::Sender<SessionCommand>) -> Self {
        Self { info, cmd_tx }
    }

    /// Session identifier.
    pub fn id(&self) -> &str {
        &self.info.id
    }

    /// Accept-time metadata.
    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// Push a named event to this session's peer.
    ///
    /// Returns `false` if the session's queue is full or the session is
    /// gone — event delivery is best-effort.
    pub fn send_event(&self, event: impl Into<String>, data: Value) -> bool {
        match Envelope::Event(Event::new(event, data)).encode() {
            Ok(json) => self.send_raw(json),
            Err(err) => {
                error!(error = %err, "failed to encode event");
                false
            }
        }
    }

    /// Enqueue a pre-encoded frame for this session's peer.
    pub fn send_raw(&self, frame: String) -> bool {
        self.cmd_tx.try_send(SessionCommand::Send(frame)).is_ok()
    }

    /// Swap the session's handler binding at runtime. The old binding's
    /// event subscription is torn down before the new one attaches.
    pub fn rebind(&self, api: Api) -> bool {
        self.cmd_tx.try_send(SessionCommand::Rebind(api)).is_ok()
    }

    /// Ask the session to close its transport.
    pub fn close(&self) -> bool {
        self.cmd_tx.try_send(SessionCommand::Close).is_ok()
    }
}

/// One accepted connection being served.
pub(crate) struct Session {
    pub(crate) info: Arc<SessionInfo>,
    pub(crate) api: Api,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) cmd_tx: mpsc::Sender<SessionCommand>,
    pub(crate) cmd_rx: mpsc::Receiver<SessionCommand>,
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) cancel: CancellationToken,
}

impl Session {
    pub(crate) async fn run(mut self, ws: WebSocketStream<TcpStream>) {
        let (mut sink, mut source) = ws.split();
        let mut events = self.api.events().map(EventSource::subscribe);
        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        // Skip the immediate first tick.
        let _ = heartbeat.tick().await;

        info!(session = %self.info.id, "session started");

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = sink.close().await;
                    break;
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(SessionCommand::Send(frame)) => {
                        if let Err(error) = sink.send(Message::Text(frame.into())).await {
                            debug!(session = %self.info.id, %error, "outbound send failed");
                            break;
                        }
                    }
                    Some(SessionCommand::Rebind(new_api)) => {
                        // Tear down before attaching: no duplicate delivery,
                        // no firing into a stale binding.
                        let _ = events.take();
                        self.api = new_api;
                        events = self.api.events().map(EventSource::subscribe);
                        debug!(session = %self.info.id, "handler rebound");
                    }
                    Some(SessionCommand::Close) | None => {
                        let _ = sink.close().await;
                        break;
                    }
                },
                _ = heartbeat.tick() => {
                    match Envelope::Ping(Ping::now()).encode() {
                        Ok(json) => {
                            if sink.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                        Err(error) => error!(%error, "failed to encode ping"),
                    }
                }
                event = Self::next_event(&mut events), if events.is_some() => match event {
                    Ok(event) => self.forward_event(&mut sink, event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(session = %self.info.id, missed, "event source outpaced session");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        events = None;
                    }
                },
                frame = source.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()),
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => self.handle_text(text),
                        Err(_) => debug!(
                            session = %self.info.id,
                            len = bytes.len(),
                            "dropping non-UTF8 binary frame"
                        ),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        info!(session = %self.info.id, "peer closed");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        warn!(session = %self.info.id, %error, "transport error");
                        break;
                    }
                },
            }
        }

        // Eviction: the heartbeat timer and event subscription die with the
        // task; the registry forgets the handle.
        let _ = self.registry.remove(&self.info.id);
        info!(session = %self.info.id, "session closed");
    }

    async fn next_event(
        events: &mut Option<broadcast::Receiver<Event>>,
    ) -> Result<Event, broadcast::error::RecvError> {
        match events.as_mut() {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }

    /// Route one inbound text frame. A call is dispatched on its own task:
    /// handlers may suspend, and responses are allowed to complete out of
    /// order relative to call arrival.
    fn handle_text(&self, text: &str) {
        match Envelope::decode(text) {
            Ok(Envelope::Call(call)) => {
                debug!(session = %self.info.id, method = %call.method, id = %call.id, "dispatching call");
                let api = self.api.clone();
                let outbound = self.cmd_tx.clone();
                let session = self.info.id.clone();
                let _ = tokio::spawn(async move {
                    let response = api.dispatch(call).await;
                    match Envelope::Response(response).encode() {
                        Ok(json) => {
                            if outbound.send(SessionCommand::Send(json)).await.is_err() {
                                debug!(session = %session, "session gone before response");
                            }
                        }
                        Err(error) => error!(%error, "failed to encode response"),
                    }
                });
            }
            Ok(Envelope::Event(event)) => {
                debug!(session = %self.info.id, event = %event.event, "ignoring inbound event");
            }
            Ok(Envelope::Response(response)) => {
                debug!(session = %self.info.id, id = %response.id, "ignoring response: session issues no calls");
            }
            Ok(Envelope::Ping(_)) => {}
            Err(error) => warn!(session = %self.info.id, %error, "dropping malformed frame"),
        }
    }

    async fn forward_event(&self, sink: &mut WsSink, event: Event) {
        let name = event.event.clone();
        match Envelope::Event(event).encode() {
            Ok(json) => {
                // Best-effort: a dying transport is the inbound loop's
                // problem, not the publisher's.
                if let Err(error) = sink.send(Message::Text(json.into())).await {
                    debug!(session = %self.info.id, event = %name, %error, "event send failed");
                }
            }
            Err(error) => debug!(session = %self.info.id, event = %name, %error, "failed to encode event"),
        }
    }
}
