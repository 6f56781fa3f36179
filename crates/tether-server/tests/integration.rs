//! End-to-end tests: a real server driven by a real client.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use tether_client::{Client, ClientConfig, ConnectionState, Signal};
use tether_proto::CallError;
use tether_server::{
    Api, ApiProvider, EventSource, HandlerError, MethodHandler, MethodTable, Server, ServerConfig,
    SessionInfo,
};

const TIMEOUT: Duration = Duration::from_secs(5);

// ── Test API ────────────────────────────────────────────────────────

struct EchoHandler;

#[async_trait]
impl MethodHandler for EchoHandler {
    async fn handle(&self, params: Vec<Value>) -> Result<Value, HandlerError> {
        let msg = params.first().and_then(Value::as_str).unwrap_or_default();
        Ok(json!(format!("msg: {msg}")))
    }
}

struct HelloHandler {
    count: AtomicU64,
}

#[async_trait]
impl MethodHandler for HelloHandler {
    async fn handle(&self, _params: Vec<Value>) -> Result<Value, HandlerError> {
        let n = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(json!(format!("Hello! {n}")))
    }
}

struct BoomHandler;

#[async_trait]
impl MethodHandler for BoomHandler {
    async fn handle(&self, _params: Vec<Value>) -> Result<Value, HandlerError> {
        Err(HandlerError::failed("bad input"))
    }
}

struct SleepHandler;

#[async_trait]
impl MethodHandler for SleepHandler {
    async fn handle(&self, params: Vec<Value>) -> Result<Value, HandlerError> {
        let ms = params.first().and_then(Value::as_u64).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(json!("slept"))
    }
}

struct AltEchoHandler;

#[async_trait]
impl MethodHandler for AltEchoHandler {
    async fn handle(&self, params: Vec<Value>) -> Result<Value, HandlerError> {
        let msg = params.first().and_then(Value::as_str).unwrap_or_default();
        Ok(json!(format!("alt: {msg}")))
    }
}

fn test_table() -> MethodTable {
    let mut table = MethodTable::new();
    table.register("echo", EchoHandler);
    table.register(
        "hello",
        HelloHandler {
            count: AtomicU64::new(0),
        },
    );
    table.register("boom", BoomHandler);
    table.register("sleep", SleepHandler);
    table
}

// ── Helpers ─────────────────────────────────────────────────────────

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn boot(api: impl Into<ApiProvider>, heartbeat_interval: Duration) -> Server {
    init_tracing();
    let config = ServerConfig {
        heartbeat_interval,
        ..ServerConfig::default()
    };
    Server::bind(config, api).await.unwrap()
}

async fn ready_client(server: &Server, config: ClientConfig) -> Client {
    let client = Client::with_config(server.url(), config);
    client.open();
    timeout(TIMEOUT, client.wait_ready())
        .await
        .expect("wait_ready timed out")
        .expect("wait_ready failed");
    client
}

async fn collect_signals(rx: &mut broadcast::Receiver<Signal>, window: Duration) -> Vec<Signal> {
    let deadline = tokio::time::Instant::now() + window;
    let mut out = Vec::new();
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Ok(signal)) => out.push(signal),
            Ok(Err(_)) | Err(_) => break,
        }
    }
    out
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ── Round trips ─────────────────────────────────────────────────────

#[tokio::test]
async fn echo_round_trip() {
    let server = boot(Api::table(test_table()), Duration::from_millis(100)).await;
    let client = ready_client(&server, ClientConfig::default()).await;

    let result = client.invoke("echo", vec![json!("x")]).await.unwrap();
    assert_eq!(result, json!("msg: x"));

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn stateful_handler_counts_calls() {
    let server = boot(Api::table(test_table()), Duration::from_millis(100)).await;
    let client = ready_client(&server, ClientConfig::default()).await;

    for n in 1..=3u32 {
        let hello = client.invoke("hello", vec![]).await.unwrap();
        assert_eq!(hello, json!(format!("Hello! {n}")));
    }

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn concurrent_invokes_each_get_their_own_answer() {
    let server = boot(Api::table(test_table()), Duration::from_millis(100)).await;
    let client = ready_client(&server, ClientConfig::default()).await;

    let sent: Vec<String> = (0..10).map(|n| format!("payload-{n}")).collect();
    let calls = sent
        .iter()
        .map(|msg| client.invoke("echo", vec![json!(msg)]));
    let results = join_all(calls).await;

    for (msg, result) in sent.iter().zip(results) {
        assert_eq!(result.unwrap(), json!(format!("msg: {msg}")));
    }

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn responses_correlate_out_of_order() {
    let server = boot(Api::table(test_table()), Duration::from_millis(100)).await;
    let client = ready_client(&server, ClientConfig::default()).await;

    // The slow call is issued first but answered last.
    let (slow, fast) = tokio::join!(
        client.invoke("sleep", vec![json!(200)]),
        client.invoke("echo", vec![json!("quick")]),
    );
    assert_eq!(slow.unwrap(), json!("slept"));
    assert_eq!(fast.unwrap(), json!("msg: quick"));

    client.close().await;
    server.shutdown().await;
}

// ── Failure paths ───────────────────────────────────────────────────

#[tokio::test]
async fn remote_failure_carries_message_verbatim() {
    let server = boot(Api::table(test_table()), Duration::from_millis(100)).await;
    let client = ready_client(&server, ClientConfig::default()).await;

    let err = client.invoke("boom", vec![]).await.unwrap_err();
    assert_eq!(err, CallError::Remote("bad input".into()));

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn unknown_method_fails_call_but_not_connection() {
    let server = boot(Api::table(test_table()), Duration::from_millis(100)).await;
    let client = ready_client(&server, ClientConfig::default()).await;

    let err = client.invoke("nope", vec![]).await.unwrap_err();
    let CallError::Remote(message) = err else {
        panic!("expected remote error, got {err:?}");
    };
    assert_eq!(message, "Unknown method nope");

    // The connection is still usable afterwards.
    assert_eq!(client.state(), ConnectionState::Open);
    let result = client.invoke("echo", vec![json!("still here")]).await.unwrap();
    assert_eq!(result, json!("msg: still here"));

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn call_deadline_fires_and_late_response_is_ignored() {
    let server = boot(Api::table(test_table()), Duration::from_millis(100)).await;
    let config = ClientConfig::new().with_call_timeout(Duration::from_millis(150));
    let client = ready_client(&server, config).await;

    let err = client.invoke("sleep", vec![json!(600)]).await.unwrap_err();
    let CallError::Timeout { timeout: deadline, .. } = err else {
        panic!("expected timeout, got {err:?}");
    };
    assert_eq!(deadline, Duration::from_millis(150));

    // Only that one call failed; the connection keeps working, and the
    // response that eventually arrives for the abandoned id is dropped.
    let result = client.invoke("echo", vec![json!("after")]).await.unwrap();
    assert_eq!(result, json!("msg: after"));
    tokio::time::sleep(Duration::from_millis(600)).await;
    let result = client.invoke("echo", vec![json!("later")]).await.unwrap();
    assert_eq!(result, json!("msg: later"));

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn close_fails_in_flight_calls_fast() {
    let server = boot(Api::table(test_table()), Duration::from_millis(100)).await;
    let client = Arc::new(ready_client(&server, ClientConfig::default()).await);

    let caller = client.clone();
    let in_flight =
        tokio::spawn(async move { caller.invoke("sleep", vec![json!(2000)]).await });

    tokio::time::sleep(Duration::from_millis(150)).await;
    let start = Instant::now();
    client.close().await;
    let err = in_flight.await.unwrap().unwrap_err();

    assert_eq!(err, CallError::Closed);
    assert!(start.elapsed() < Duration::from_secs(1));

    server.shutdown().await;
}

// ── Events ──────────────────────────────────────────────────────────

#[tokio::test]
async fn handler_event_reaches_subscriber_exactly_once() {
    let source = EventSource::new();
    let api = Api::table(test_table()).with_events(source.clone());
    let server = boot(api, Duration::from_millis(100)).await;
    let client = ready_client(&server, ClientConfig::default()).await;
    let mut signals = client.subscribe();

    // The session subscribes when the client connects; give it a beat.
    wait_until(|| server.session_count() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    source.emit("tick", json!(42));

    let seen = collect_signals(&mut signals, Duration::from_millis(400)).await;
    let events: Vec<_> = seen
        .iter()
        .filter_map(|s| match s {
            Signal::Event { event, data } => Some((event.clone(), data.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(events, vec![("tick".to_string(), json!(42))]);

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn reserved_event_names_never_reach_subscribers() {
    let source = EventSource::new();
    let api = Api::table(test_table()).with_events(source.clone());
    let server = boot(api, Duration::from_millis(100)).await;
    let client = ready_client(&server, ClientConfig::default()).await;
    let mut signals = client.subscribe();

    wait_until(|| server.session_count() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    source.emit("wsopen", json!("forged"));
    source.emit("wsclose", json!("forged"));
    source.emit("wsbroken", json!("forged"));
    source.emit("tick", json!(1));

    let seen = collect_signals(&mut signals, Duration::from_millis(400)).await;
    let events: Vec<_> = seen
        .iter()
        .filter_map(|s| match s {
            Signal::Event { event, .. } => Some(event.clone()),
            _ => None,
        })
        .collect();
    // Only the legitimate event survives; forged lifecycle names are
    // discarded on receipt. Real lifecycle signals are typed, so nothing
    // else shows up as an application event either.
    assert_eq!(events, vec!["tick".to_string()]);

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn server_broadcast_reaches_every_client() {
    let server = boot(Api::table(test_table()), Duration::from_millis(100)).await;
    let first = ready_client(&server, ClientConfig::default()).await;
    let second = ready_client(&server, ClientConfig::default()).await;
    let mut signals_a = first.subscribe();
    let mut signals_b = second.subscribe();

    wait_until(|| server.session_count() == 2).await;
    assert_eq!(server.broadcast("tick", json!(7)), 2);

    for signals in [&mut signals_a, &mut signals_b] {
        let seen = collect_signals(signals, Duration::from_millis(400)).await;
        assert!(seen.contains(&Signal::Event {
            event: "tick".into(),
            data: json!(7),
        }));
    }

    first.close().await;
    second.close().await;
    server.shutdown().await;
}

// ── Liveness ────────────────────────────────────────────────────────

#[tokio::test]
async fn heartbeats_keep_an_idle_connection_alive() {
    let server = boot(Api::table(test_table()), Duration::from_millis(100)).await;
    let config = ClientConfig::new().with_liveness_timeout(Duration::from_millis(300));
    let client = ready_client(&server, config).await;
    let mut signals = client.subscribe();

    // Idle for several liveness windows; server pings reset the monitor.
    let seen = collect_signals(&mut signals, Duration::from_millis(1000)).await;
    assert!(!seen.contains(&Signal::Broken), "unexpected break: {seen:?}");
    assert_eq!(client.state(), ConnectionState::Open);

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn silent_server_breaks_connection_and_client_recovers() {
    // Heartbeats effectively disabled: the link goes silent after the
    // handshake.
    let server = boot(Api::table(test_table()), Duration::from_secs(60)).await;
    let config = ClientConfig::new().with_liveness_timeout(Duration::from_millis(200));
    let client = Client::with_config(server.url(), config);
    let mut signals = client.subscribe();
    client.open();

    let mut seen = Vec::new();
    timeout(Duration::from_secs(10), async {
        loop {
            let signal = signals.recv().await.unwrap();
            seen.push(signal);
            let opens = seen.iter().filter(|s| **s == Signal::Open).count();
            if opens >= 2 {
                break;
            }
        }
    })
    .await
    .expect("client did not recover in time");

    // One break, declared exactly once, between the two opens.
    assert_eq!(seen, vec![Signal::Open, Signal::Broken, Signal::Open]);

    client.close().await;
    server.shutdown().await;
}

// ── Sessions ────────────────────────────────────────────────────────

#[tokio::test]
async fn registry_tracks_connect_and_disconnect() {
    let server = boot(Api::table(test_table()), Duration::from_millis(100)).await;

    let first = ready_client(&server, ClientConfig::default()).await;
    let second = ready_client(&server, ClientConfig::default()).await;
    wait_until(|| server.session_count() == 2).await;

    first.close().await;
    wait_until(|| server.session_count() == 1).await;

    second.close().await;
    wait_until(|| server.session_count() == 0).await;

    server.shutdown().await;
}

#[tokio::test]
async fn factory_binding_sees_session_metadata() {
    let captured: Arc<Mutex<Option<SessionInfo>>> = Arc::new(Mutex::new(None));
    let captured_in_factory = captured.clone();
    let provider = ApiProvider::factory(move |info| {
        *captured_in_factory.lock() = Some(info.clone());
        Api::table(test_table())
    });

    let server = boot(provider, Duration::from_millis(100)).await;
    let client = ready_client(&server, ClientConfig::default()).await;

    wait_until(|| captured.lock().is_some()).await;
    let info = captured.lock().clone().unwrap();
    assert!(info.header("host").is_some());
    assert_eq!(info.header("upgrade"), Some("websocket"));
    assert!(!info.raw_headers.is_empty());
    assert!(!info.authorized);

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn rebind_swaps_handler_and_tears_down_old_events() {
    let old_source = EventSource::new();
    let api = Api::table(test_table()).with_events(old_source.clone());
    let server = boot(api, Duration::from_millis(100)).await;
    let client = ready_client(&server, ClientConfig::default()).await;
    let mut signals = client.subscribe();

    wait_until(|| server.session_count() == 1).await;
    let handle = server.registry().handles().into_iter().next().unwrap();

    let new_source = EventSource::new();
    let mut table = MethodTable::new();
    table.register("echo", AltEchoHandler);
    assert!(handle.rebind(Api::table(table).with_events(new_source.clone())));
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Calls now hit the new binding.
    let result = client.invoke("echo", vec![json!("x")]).await.unwrap();
    assert_eq!(result, json!("alt: x"));

    // The old event source is detached; only the new one delivers.
    old_source.emit("stale", json!(0));
    new_source.emit("fresh", json!(1));
    let seen = collect_signals(&mut signals, Duration::from_millis(400)).await;
    let events: Vec<_> = seen
        .iter()
        .filter_map(|s| match s {
            Signal::Event { event, .. } => Some(event.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(events, vec!["fresh".to_string()]);

    client.close().await;
    server.shutdown().await;
}

// ── Raw-socket behavior ─────────────────────────────────────────────

#[tokio::test]
async fn malformed_frames_do_not_kill_the_session() {
    let server = boot(Api::table(test_table()), Duration::from_millis(100)).await;

    let (mut ws, _) = connect_async(server.url()).await.unwrap();
    ws.send(Message::Text("not json at all".into())).await.unwrap();
    ws.send(Message::Text(r#"{"foo":"bar"}"#.into())).await.unwrap();
    ws.send(Message::Text(r#"{"id":"r1","method":"echo","params":["x"]}"#.into()))
        .await
        .unwrap();

    let response = timeout(TIMEOUT, async {
        loop {
            let frame = ws.next().await.unwrap().unwrap();
            let Message::Text(text) = frame else { continue };
            let value: Value = serde_json::from_str(text.as_str()).unwrap();
            if value.get("id").is_some() {
                break value;
            }
        }
    })
    .await
    .expect("no response to valid call");

    assert_eq!(response["id"], "r1");
    assert_eq!(response["result"], "msg: x");

    server.shutdown().await;
}

#[tokio::test]
async fn server_sends_periodic_ping_frames() {
    let server = boot(Api::table(test_table()), Duration::from_millis(50)).await;

    let (mut ws, _) = connect_async(server.url()).await.unwrap();
    let ping = timeout(Duration::from_secs(2), async {
        loop {
            let frame = ws.next().await.unwrap().unwrap();
            let Message::Text(text) = frame else { continue };
            let value: Value = serde_json::from_str(text.as_str()).unwrap();
            if value.get("ping").is_some() {
                break value;
            }
        }
    })
    .await
    .expect("no heartbeat ping received");

    assert!(ping["ping"].as_u64().unwrap() > 0);

    server.shutdown().await;
}
