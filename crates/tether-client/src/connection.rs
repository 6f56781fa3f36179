//! The client connection state machine.
//!
//! A [`Client`] is a cheap handle; each `open()` spawns one connection task
//! that exclusively owns the socket, the pending-call registry, and the
//! liveness deadline. The handle talks to the task over a command channel,
//! so all per-connection state is mutated from a single task and never needs
//! a lock.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tether_proto::envelope::is_reserved_event;
use tether_proto::pending::CallReply;
use tether_proto::{Call, CallError, Envelope, Event, PendingCalls};

use crate::config::ClientConfig;
use crate::signal::{ConnectionState, Signal};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

const SIGNAL_CAPACITY: usize = 32;
const COMMAND_CAPACITY: usize = 64;

/// State the connection task publishes for the handle to read.
struct Shared {
    broken: AtomicBool,
    readiness: AtomicU8,
}

impl Shared {
    fn new() -> Self {
        Self {
            broken: AtomicBool::new(false),
            readiness: AtomicU8::new(ConnectionState::Connecting as u8),
        }
    }

    fn set_readiness(&self, state: ConnectionState) {
        self.readiness.store(state as u8, Ordering::Release);
    }

    fn state(&self) -> ConnectionState {
        if self.broken.load(Ordering::Acquire) {
            return ConnectionState::Broken;
        }
        match self.readiness.load(Ordering::Acquire) {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

enum Command {
    Invoke {
        call: Call,
        reply: oneshot::Sender<CallReply>,
    },
    Cancel {
        id: String,
    },
    Emit {
        event: Event,
    },
}

struct Conn {
    cmd_tx: mpsc::Sender<Command>,
    cancel: CancellationToken,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

/// One logical session over one WebSocket connection.
///
/// Invocations are correlated by random call id, so any number of callers
/// can have calls in flight on the same connection. When the link goes
/// silent past the liveness deadline the client declares it broken, emits
/// [`Signal::Broken`], and reopens it with the last-used URL — deliberate
/// [`Client::close`] is the only state it will not recover from.
pub struct Client {
    url: Mutex<String>,
    config: ClientConfig,
    signals: broadcast::Sender<Signal>,
    conn: Mutex<Option<Conn>>,
}

impl Client {
    /// Create a client for `url` with default configuration. No connection
    /// is made until [`Client::open`].
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_config(url, ClientConfig::default())
    }

    /// Create a client with custom configuration.
    pub fn with_config(url: impl Into<String>, config: ClientConfig) -> Self {
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self {
            url: Mutex::new(url.into()),
            config,
            signals,
            conn: Mutex::new(None),
        }
    }

    /// Open (or reopen) the connection with the last-used URL. Any existing
    /// connection is torn down first.
    pub fn open(&self) {
        let url = self.url.lock().clone();
        self.open_url(url);
    }

    /// Open (or reopen) the connection with a new URL, which becomes the
    /// last-used URL for automatic recovery.
    pub fn open_url(&self, url: impl Into<String>) {
        let url = url.into();
        *self.url.lock() = url.clone();

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let cancel = CancellationToken::new();
        let shared = Arc::new(Shared::new());
        let task = ConnectionTask {
            url,
            config: self.config.clone(),
            shared: shared.clone(),
            signals: self.signals.clone(),
            cmd_rx,
            cancel: cancel.clone(),
            pending: PendingCalls::new(),
        };
        let task = tokio::spawn(task.run());

        let previous = self.conn.lock().replace(Conn {
            cmd_tx,
            cancel,
            shared,
            task,
        });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
    }

    /// Close the connection. Outstanding calls fail fast with
    /// [`CallError::Closed`]; a closed client is not auto-recovered.
    /// Closing an already-closed client is a no-op.
    pub async fn close(&self) {
        let previous = self.conn.lock().take();
        if let Some(previous) = previous {
            previous.cancel.cancel();
            let _ = previous.task.await;
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        let conn = self.conn.lock();
        match conn.as_ref() {
            None => ConnectionState::Closed,
            Some(conn) => conn.shared.state(),
        }
    }

    /// Whether the client has been deliberately closed (or never opened).
    pub fn is_closed(&self) -> bool {
        self.conn.lock().is_none()
    }

    /// Subscribe to lifecycle and application signals.
    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.signals.subscribe()
    }

    /// Suspend until the connection is open.
    ///
    /// Fails immediately with [`CallError::Closed`] if the client was
    /// deliberately closed; while connecting, broken, or recovering it waits
    /// for the next open confirmation.
    pub async fn wait_ready(&self) -> Result<(), CallError> {
        loop {
            let mut signals = self.signals.subscribe();
            if self.is_closed() {
                return Err(CallError::Closed);
            }
            if self.state() == ConnectionState::Open {
                return Ok(());
            }
            loop {
                match signals.recv().await {
                    Ok(Signal::Open) => return Ok(()),
                    Ok(Signal::Closed) => {
                        if self.is_closed() {
                            return Err(CallError::Closed);
                        }
                    }
                    Ok(_) => {}
                    // Fell behind; resubscribe and re-check the state.
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => return Err(CallError::Closed),
                }
            }
        }
    }

    /// Invoke `method` on the remote peer with the configured call timeout.
    pub async fn invoke(&self, method: &str, params: Vec<Value>) -> Result<Value, CallError> {
        self.invoke_timeout(method, params, self.config.call_timeout)
            .await
    }

    /// Invoke `method` with an explicit per-call deadline.
    ///
    /// Waits for readiness first (the deadline covers that wait too);
    /// exactly one of a result, the remote peer's error, or a local failure
    /// comes back.
    pub async fn invoke_timeout(
        &self,
        method: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        let call = Call::new(method, params);
        let id = call.id.clone();

        match tokio::time::timeout(timeout, self.invoke_inner(call)).await {
            Ok(result) => result,
            Err(_) => {
                // The deadline elapsed first; evict the pending entry so a
                // late response finds no waiter.
                if let Some(cmd_tx) = self.command_sender() {
                    let _ = cmd_tx.try_send(Command::Cancel { id: id.clone() });
                }
                Err(CallError::Timeout { id, timeout })
            }
        }
    }

    async fn invoke_inner(&self, call: Call) -> Result<Value, CallError> {
        self.wait_ready().await?;
        let cmd_tx = self.command_sender().ok_or(CallError::Closed)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        cmd_tx
            .send(Command::Invoke {
                call,
                reply: reply_tx,
            })
            .await
            .map_err(|_| CallError::Closed)?;
        reply_rx.await.unwrap_or(Err(CallError::Closed))
    }

    /// Push a named event to the peer, best-effort. Failures are logged and
    /// never surfaced to the caller.
    pub async fn emit(&self, event: impl Into<String>, data: Value) {
        let event = Event::new(event, data);
        let Some(cmd_tx) = self.command_sender() else {
            debug!(event = %event.event, "event dropped: client closed");
            return;
        };
        if cmd_tx.send(Command::Emit { event }).await.is_err() {
            debug!("event dropped: connection task gone");
        }
    }

    fn command_sender(&self) -> Option<mpsc::Sender<Command>> {
        self.conn.lock().as_ref().map(|conn| conn.cmd_tx.clone())
    }
}

/// The task that owns one connection attempt cycle: dial, serve, watch,
/// recover, repeat until deliberately closed.
struct ConnectionTask {
    url: String,
    config: ClientConfig,
    shared: Arc<Shared>,
    signals: broadcast::Sender<Signal>,
    cmd_rx: mpsc::Receiver<Command>,
    cancel: CancellationToken,
    pending: PendingCalls,
}

impl ConnectionTask {
    async fn run(mut self) {
        'session: loop {
            self.shared.set_readiness(ConnectionState::Connecting);
            let ws = tokio::select! {
                () = self.cancel.cancelled() => break 'session,
                result = connect_async(self.url.as_str()) => match result {
                    Ok((ws, _response)) => ws,
                    Err(error) => {
                        warn!(url = %self.url, %error, "connect attempt failed");
                        match self.hold_before_retry().await {
                            ControlFlow::Continue(()) => continue 'session,
                            ControlFlow::Break(()) => break 'session,
                        }
                    }
                },
            };

            // A fresh transport reporting open clears any broken overlay.
            self.shared.broken.store(false, Ordering::Release);
            self.shared.set_readiness(ConnectionState::Open);
            let _ = self.signals.send(Signal::Open);
            info!(url = %self.url, "transport open");

            let (sink, source) = ws.split();
            let mut sink = Some(sink);
            let mut source = Some(source);
            let liveness = tokio::time::sleep(self.config.liveness_timeout);
            tokio::pin!(liveness);

            loop {
                tokio::select! {
                    () = self.cancel.cancelled() => {
                        self.shared.set_readiness(ConnectionState::Closing);
                        if let Some(mut ws) = sink.take() {
                            let _ = ws.close().await;
                        }
                        break 'session;
                    }
                    cmd = self.cmd_rx.recv() => match cmd {
                        Some(cmd) => self.handle_command(cmd, &mut sink).await,
                        None => break 'session,
                    },
                    frame = Self::next_frame(&mut source), if source.is_some() => match frame {
                        Some(Ok(frame)) => {
                            // Any inbound traffic resets the monitor, even a
                            // frame that later fails to parse.
                            liveness.as_mut().reset(Instant::now() + self.config.liveness_timeout);
                            self.handle_frame(frame, &mut sink, &mut source);
                        }
                        Some(Err(error)) => {
                            warn!(%error, "transport error");
                            self.transport_lost(&mut sink, &mut source);
                        }
                        None => self.transport_lost(&mut sink, &mut source),
                    },
                    () = &mut liveness => {
                        self.declare_broken();
                        continue 'session;
                    }
                }
            }
        }

        self.shared.set_readiness(ConnectionState::Closed);
        self.shared.broken.store(false, Ordering::Release);
        self.pending.fail_all(&CallError::Closed);
        let _ = self.signals.send(Signal::Closed);
        info!(url = %self.url, "connection closed");
    }

    /// After a failed dial, wait out one liveness window before the next
    /// attempt, then declare the break. Commands arriving meanwhile are
    /// rejected rather than queued.
    async fn hold_before_retry(&mut self) -> ControlFlow<()> {
        let retry = tokio::time::sleep(self.config.liveness_timeout);
        tokio::pin!(retry);
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return ControlFlow::Break(()),
                () = &mut retry => {
                    self.declare_broken();
                    return ControlFlow::Continue(());
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.reject_command(cmd),
                    None => return ControlFlow::Break(()),
                },
            }
        }
    }

    async fn next_frame(
        source: &mut Option<WsSource>,
    ) -> Option<Result<Message, tokio_tungstenite::tungstenite::Error>> {
        match source.as_mut() {
            Some(source) => source.next().await,
            None => std::future::pending().await,
        }
    }

    async fn handle_command(&mut self, cmd: Command, sink: &mut Option<WsSink>) {
        match cmd {
            Command::Invoke { call, reply } => {
                let Some(ws) = sink.as_mut() else {
                    let _ = reply.send(Err(CallError::NotConnected));
                    return;
                };
                let id = call.id.clone();
                let json = match Envelope::Call(call).encode() {
                    Ok(json) => json,
                    Err(err) => {
                        // Dropping the waiter surfaces `Closed` rather than
                        // hanging the caller until its deadline.
                        error!(error = %err, "failed to encode call");
                        return;
                    }
                };
                match ws.send(Message::Text(json.into())).await {
                    Ok(()) => self.pending.insert(id, reply),
                    Err(error) => {
                        warn!(%error, %id, "call send failed");
                        let _ = reply.send(Err(CallError::NotConnected));
                    }
                }
            }
            Command::Cancel { id } => {
                let _ = self.pending.cancel(&id);
            }
            Command::Emit { event } => {
                let Some(ws) = sink.as_mut() else {
                    debug!(event = %event.event, "event dropped: not connected");
                    return;
                };
                let name = event.event.clone();
                match Envelope::Event(event).encode() {
                    Ok(json) => {
                        if let Err(error) = ws.send(Message::Text(json.into())).await {
                            debug!(%error, event = %name, "event send failed");
                        }
                    }
                    Err(error) => debug!(%error, event = %name, "failed to encode event"),
                }
            }
        }
    }

    fn reject_command(&mut self, cmd: Command) {
        match cmd {
            Command::Invoke { reply, .. } => {
                let _ = reply.send(Err(CallError::NotConnected));
            }
            Command::Cancel { id } => {
                let _ = self.pending.cancel(&id);
            }
            Command::Emit { event } => {
                debug!(event = %event.event, "event dropped: not connected");
            }
        }
    }

    fn handle_frame(
        &mut self,
        frame: Message,
        sink: &mut Option<WsSink>,
        source: &mut Option<WsSource>,
    ) {
        match frame {
            Message::Text(text) => self.handle_text(text.as_str()),
            Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                Ok(text) => self.handle_text(text),
                Err(_) => debug!(len = bytes.len(), "dropping non-UTF8 binary frame"),
            },
            Message::Close(_) => {
                debug!("peer sent close frame");
                self.transport_lost(sink, source);
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }

    fn handle_text(&mut self, text: &str) {
        match Envelope::decode(text) {
            Ok(Envelope::Response(response)) => {
                let id = response.id.clone();
                if !self.pending.resolve(response) {
                    debug!(%id, "response with no matching call");
                }
            }
            Ok(Envelope::Event(event)) => {
                if is_reserved_event(&event.event) {
                    warn!(event = %event.event, "peer used a reserved event name; dropping");
                } else {
                    let _ = self.signals.send(Signal::Event {
                        event: event.event,
                        data: event.data,
                    });
                }
            }
            Ok(Envelope::Ping(_)) => {}
            Ok(Envelope::Call(call)) => {
                debug!(method = %call.method, "ignoring inbound call: client serves no methods");
            }
            Err(error) => warn!(%error, "dropping malformed frame"),
        }
    }

    /// The peer's side of the transport went away without a deliberate local
    /// close. Pending calls stay registered; the still-armed liveness
    /// deadline declares the break and drives recovery.
    fn transport_lost(&mut self, sink: &mut Option<WsSink>, source: &mut Option<WsSource>) {
        if sink.is_none() && source.is_none() {
            return;
        }
        *sink = None;
        *source = None;
        self.shared.set_readiness(ConnectionState::Closed);
        let _ = self.signals.send(Signal::Closed);
        info!(url = %self.url, "transport closed by peer");
    }

    fn declare_broken(&self) {
        warn!(url = %self.url, "no traffic within liveness deadline; connection broken");
        self.shared.broken.store(true, Ordering::Release);
        let _ = self.signals.send(Signal::Broken);
    }
}
