//! Listener, accept loop, and graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as HandshakeRequest, Response as HandshakeResponse,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::handler::ApiProvider;
use crate::registry::SessionRegistry;
use crate::session::{SESSION_QUEUE, Session, SessionHandle, SessionInfo};

/// Accepts inbound WebSocket connections and wraps each in a [`Session`]
/// bound to the configured API.
pub struct Server {
    local_addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    cancel: CancellationToken,
    accept_task: JoinHandle<()>,
}

impl Server {
    /// Bind the listener and start accepting connections.
    pub async fn bind(
        config: ServerConfig,
        api: impl Into<ApiProvider>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let local_addr = listener.local_addr()?;
        let registry = Arc::new(SessionRegistry::new());
        let cancel = CancellationToken::new();

        let accept = AcceptLoop {
            listener,
            api: Arc::new(api.into()),
            registry: registry.clone(),
            heartbeat_interval: config.heartbeat_interval,
            cancel: cancel.clone(),
        };
        let accept_task = tokio::spawn(accept.run());
        info!(%local_addr, "listening");

        Ok(Self {
            local_addr,
            registry,
            cancel,
            accept_task,
        })
    }

    /// The bound address (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A `ws://` URL for the bound address.
    pub fn url(&self) -> String {
        format!("ws://{}/", self.local_addr)
    }

    /// The live session set.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.registry.count()
    }

    /// Push a named event to every live session. Returns how many sessions
    /// accepted it.
    pub fn broadcast(&self, event: impl Into<String>, data: Value) -> usize {
        self.registry.broadcast(event, data)
    }

    /// Stop accepting, close every session, and wait for the drain.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.accept_task.await;
    }
}

struct AcceptLoop {
    listener: TcpListener,
    api: Arc<ApiProvider>,
    registry: Arc<SessionRegistry>,
    heartbeat_interval: Duration,
    cancel: CancellationToken,
}

impl AcceptLoop {
    async fn run(self) {
        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let api = self.api.clone();
                        let registry = self.registry.clone();
                        let heartbeat_interval = self.heartbeat_interval;
                        let cancel = self.cancel.child_token();
                        let _ = sessions.spawn(handle_connection(
                            stream,
                            peer,
                            api,
                            registry,
                            heartbeat_interval,
                            cancel,
                        ));
                    }
                    Err(error) => error!(%error, "accept failed"),
                },
                finished = sessions.join_next(), if !sessions.is_empty() => {
                    if let Some(Err(error)) = finished {
                        warn!(%error, "session task failed");
                    }
                }
            }
        }

        // Child tokens are already cancelled; wait for sessions to drain.
        while let Some(finished) = sessions.join_next().await {
            if let Err(error) = finished {
                warn!(%error, "session task failed during shutdown");
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    api: Arc<ApiProvider>,
    registry: Arc<SessionRegistry>,
    heartbeat_interval: Duration,
    cancel: CancellationToken,
) {
    let mut raw_headers: Vec<(String, String)> = Vec::new();
    let callback = |request: &HandshakeRequest,
                    response: HandshakeResponse|
     -> Result<HandshakeResponse, ErrorResponse> {
        for (name, value) in request.headers() {
            raw_headers.push((
                name.as_str().to_owned(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            ));
        }
        Ok(response)
    };

    let ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(error) => {
            warn!(%peer, %error, "handshake failed");
            return;
        }
    };

    let info = Arc::new(SessionInfo::from_raw_headers(raw_headers));
    let api = api.resolve(&info);
    let (cmd_tx, cmd_rx) = mpsc::channel(SESSION_QUEUE);
    registry.add(SessionHandle::new(info.clone(), cmd_tx.clone()));
    debug!(session = %info.id, %peer, "connection accepted");

    let session = Session {
        info,
        api,
        heartbeat_interval,
        cmd_tx,
        cmd_rx,
        registry,
        cancel,
    };
    session.run(ws).await;
}
