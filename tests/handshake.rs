//! End-to-end tests: the transport actor against a mock vehicle endpoint.
//!
//! The mock speaks the server side of the protocol over a real WebSocket:
//! random salt in `hello`, token check on `validate`, a `connection` frame
//! after acceptance, one `return` per `get`, and hang-up on `close`. Every
//! frame it receives is recorded for assertions.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use dronelink::{AuthState, Observers, SessionConfig, TransportError, TransportState};
use rand::Rng;
use rand::distr::Alphanumeric;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// MOCK VEHICLE
// =============================================================================

struct MockVehicle {
    password: String,
    received: mpsc::UnboundedSender<Value>,
}

fn hex_sha256(input: &str) -> String {
    Sha256::digest(input.as_bytes()).iter().map(|b| format!("{b:02x}")).collect()
}

async fn spawn_vehicle(password: &str) -> (String, mpsc::UnboundedReceiver<Value>) {
    let (received, rx) = mpsc::unbounded_channel();
    let vehicle = Arc::new(MockVehicle { password: password.to_owned(), received });
    let app = Router::new()
        .route("/websocket", get(upgrade))
        .route("/closing", get(upgrade_closing))
        .with_state(vehicle);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("mock vehicle server");
    });
    (format!("ws://{addr}/websocket"), rx)
}

async fn upgrade(ws: WebSocketUpgrade, State(vehicle): State<Arc<MockVehicle>>) -> Response {
    ws.on_upgrade(move |socket| serve_vehicle(socket, vehicle))
}

async fn upgrade_closing(ws: WebSocketUpgrade, State(vehicle): State<Arc<MockVehicle>>) -> Response {
    ws.on_upgrade(move |socket| close_immediately(socket, vehicle))
}

/// Starts the close handshake and records whether the client answered it.
async fn close_immediately(mut socket: WebSocket, vehicle: Arc<MockVehicle>) {
    if socket.send(Message::Close(None)).await.is_err() {
        return;
    }
    while let Some(Ok(msg)) = socket.recv().await {
        if let Message::Close(_) = msg {
            vehicle.received.send(json!({"type": "close_reply"})).expect("test receiver alive");
            break;
        }
    }
}

async fn send_json(socket: &mut WebSocket, value: &Value) -> bool {
    socket.send(Message::Text(value.to_string().into())).await.is_ok()
}

async fn serve_vehicle(mut socket: WebSocket, vehicle: Arc<MockVehicle>) {
    let salt: String = rand::rng().sample_iter(Alphanumeric).take(16).map(char::from).collect();
    let expected = hex_sha256(&format!("{}{salt}", hex_sha256(&vehicle.password)));

    if !send_json(&mut socket, &json!({"type": "hello", "salt": salt})).await {
        return;
    }

    while let Some(Ok(msg)) = socket.recv().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let frame: Value = serde_json::from_str(text.as_str()).expect("client sent JSON");
        vehicle.received.send(frame.clone()).expect("test receiver alive");

        let replies = match frame["type"].as_str() {
            Some("validate") => {
                let accepted = frame["token"].as_str() == Some(expected.as_str());
                let mut replies = vec![json!({"type": "validate", "status": accepted})];
                if accepted {
                    replies.push(json!({"type": "connection", "data": {"connected": true}}));
                }
                replies
            }
            Some("get") => {
                let from_listener = frame.get("listener").is_some_and(Value::is_number);
                if frame.get("listener").is_some_and(Value::is_null) {
                    Vec::new()
                } else {
                    vec![json!({
                        "type": "return",
                        "attributes": {"mode": "STABILIZE", "armed": false, "battery": {"level": 93}},
                        "fromListener": from_listener,
                    })]
                }
            }
            Some("close") => break,
            _ => Vec::new(),
        };
        for reply in &replies {
            if !send_json(&mut socket, reply).await {
                return;
            }
        }
    }
}

// =============================================================================
// HELPERS
// =============================================================================

#[derive(Clone, Default)]
struct Signals {
    ready: Arc<AtomicUsize>,
    failed: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    messages: Arc<AtomicUsize>,
}

impl Signals {
    fn observers(&self) -> Observers {
        let (ready, failed, closed, messages) = (
            Arc::clone(&self.ready),
            Arc::clone(&self.failed),
            Arc::clone(&self.closed),
            Arc::clone(&self.messages),
        );
        Observers::new(move |_| {
            messages.fetch_add(1, Ordering::SeqCst);
        })
        .on_ready(move || {
            ready.fetch_add(1, Ordering::SeqCst);
        })
        .on_auth_failed(move || {
            failed.fetch_add(1, Ordering::SeqCst);
        })
        .on_close(move || {
            closed.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

async fn next_frame(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
    timeout(WAIT, rx.recv()).await.expect("frame in time").expect("mock alive")
}

// =============================================================================
// TESTS
// =============================================================================

#[tokio::test]
async fn handshake_subscribes_and_mirrors_telemetry() {
    let (url, mut frames_rx) = spawn_vehicle("pw").await;
    let signals = Signals::default();

    let (handle, _task) = dronelink::connect(SessionConfig::new(url, 250, "pw"), signals.observers())
        .await
        .expect("connect");

    let auth = timeout(WAIT, handle.wait_for_auth()).await.expect("auth in time").expect("auth");
    assert_eq!(auth, AuthState::Validated);

    let validate = next_frame(&mut frames_rx).await;
    assert_eq!(validate["type"], "validate");
    assert_eq!(validate["token"].as_str().map(str::len), Some(64));
    assert_eq!(next_frame(&mut frames_rx).await, json!({"type": "get", "listener": 0.25}));

    let mut state = handle.subscribe();
    let snapshot = timeout(WAIT, state.wait_for(|s| s.telemetry.is_some()))
        .await
        .expect("telemetry in time")
        .expect("session alive")
        .clone();
    let telemetry = snapshot.telemetry.expect("telemetry");
    assert_eq!(telemetry.mode(), Some("STABILIZE"));
    assert_eq!(telemetry.battery_level(), Some(93.0));
    assert!(snapshot.connected_to_vehicle);

    assert_eq!(Signals::count(&signals.ready), 1);
    assert_eq!(Signals::count(&signals.failed), 0);
    assert!(Signals::count(&signals.messages) >= 3);
}

#[tokio::test]
async fn wrong_password_is_rejected() {
    let (url, mut frames_rx) = spawn_vehicle("correct horse").await;
    let signals = Signals::default();

    let (handle, _task) = dronelink::connect(SessionConfig::new(url, 1000, "battery staple"), signals.observers())
        .await
        .expect("connect");

    let auth = timeout(WAIT, handle.wait_for_auth()).await.expect("auth in time").expect("auth");
    assert_eq!(auth, AuthState::Rejected);
    assert_eq!(Signals::count(&signals.failed), 1);
    assert_eq!(Signals::count(&signals.ready), 0);

    assert_eq!(next_frame(&mut frames_rx).await["type"], "validate");
    let extra = timeout(Duration::from_millis(200), frames_rx.recv()).await;
    assert!(extra.is_err(), "no subscription after rejection, got {extra:?}");
    assert!(handle.snapshot().telemetry.is_none());
}

#[tokio::test]
async fn commands_reach_vehicle_in_order() {
    let (url, mut frames_rx) = spawn_vehicle("pw").await;
    let (handle, _task) = dronelink::connect(SessionConfig::new(url, 1000, "pw"), Observers::default())
        .await
        .expect("connect");
    timeout(WAIT, handle.wait_for_auth()).await.expect("auth in time").expect("auth");

    assert!(handle.set_mode("guided"));
    assert!(handle.set_armed(true));
    assert!(!handle.set_armed_value(&json!(1)));
    assert!(handle.set_armed_value(&json!(false)));
    assert!(!handle.set_groundspeed(f64::NAN));
    assert!(handle.clear_channel_overrides());

    let mut sets = Vec::new();
    while sets.len() < 4 {
        let frame = next_frame(&mut frames_rx).await;
        if frame["type"] == "set" {
            sets.push(frame["attributes"].clone());
        }
    }
    assert_eq!(
        sets,
        vec![
            json!({"mode": "GUIDED"}),
            json!({"armed": true}),
            json!({"armed": false}),
            json!({"channels": {"overrides": {}}}),
        ]
    );
}

#[tokio::test]
async fn one_shot_request_returns_telemetry() {
    let (url, mut frames_rx) = spawn_vehicle("pw").await;
    let (handle, _task) = dronelink::connect(SessionConfig::new(url, 1000, "pw"), Observers::default())
        .await
        .expect("connect");
    timeout(WAIT, handle.wait_for_auth()).await.expect("auth in time").expect("auth");

    assert!(handle.cancel_listener());
    assert!(handle.request_attributes());

    let mut gets = Vec::new();
    while gets.len() < 3 {
        let frame = next_frame(&mut frames_rx).await;
        if frame["type"] == "get" {
            gets.push(frame);
        }
    }
    assert_eq!(gets[1], json!({"type": "get", "listener": null}));
    assert_eq!(gets[2], json!({"type": "get"}));
}

#[tokio::test]
async fn local_close_runs_observer_once() {
    let (url, _frames_rx) = spawn_vehicle("pw").await;
    let signals = Signals::default();
    let (handle, task) = dronelink::connect(SessionConfig::new(url, 1000, "pw"), signals.observers())
        .await
        .expect("connect");
    timeout(WAIT, handle.wait_for_auth()).await.expect("auth in time").expect("auth");

    assert!(handle.close());
    timeout(WAIT, task).await.expect("task ends").expect("task joined");

    let snapshot = handle.snapshot();
    assert_eq!(snapshot.transport, TransportState::Closed);
    assert!(!snapshot.connected_to_vehicle);
    assert_eq!(Signals::count(&signals.closed), 1);
    assert!(!handle.set_mode("loiter"), "task is gone");
}

#[tokio::test]
async fn server_hang_up_closes_session() {
    let (url, _frames_rx) = spawn_vehicle("pw").await;
    let signals = Signals::default();
    let (handle, _task) = dronelink::connect(SessionConfig::new(url, 1000, "pw"), signals.observers())
        .await
        .expect("connect");
    timeout(WAIT, handle.wait_for_auth()).await.expect("auth in time").expect("auth");

    assert!(handle.request_close());
    timeout(WAIT, handle.closed()).await.expect("closed in time");
    assert_eq!(handle.snapshot().transport, TransportState::Closed);
    assert_eq!(Signals::count(&signals.closed), 1);
}

#[tokio::test]
async fn server_close_frame_is_answered() {
    let (url, mut frames_rx) = spawn_vehicle("pw").await;
    let url = url.replace("/websocket", "/closing");
    let signals = Signals::default();
    let (handle, task) = dronelink::connect(SessionConfig::new(url, 1000, "pw"), signals.observers())
        .await
        .expect("connect");

    assert_eq!(next_frame(&mut frames_rx).await, json!({"type": "close_reply"}));
    timeout(WAIT, task).await.expect("task ends").expect("task joined");
    assert_eq!(handle.snapshot().transport, TransportState::Closed);
    assert_eq!(Signals::count(&signals.closed), 1);
}

#[tokio::test]
async fn refused_connection_reports_close() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);

    let signals = Signals::default();
    let result = dronelink::connect(
        SessionConfig::new(format!("ws://{addr}/websocket"), 1000, "pw"),
        signals.observers(),
    )
    .await;

    assert!(matches!(result, Err(TransportError::Connect(_))));
    assert_eq!(Signals::count(&signals.closed), 1);
    assert_eq!(Signals::count(&signals.ready), 0);
}

#[tokio::test]
async fn invalid_endpoint_is_rejected_before_dialing() {
    let signals = Signals::default();
    let result = dronelink::connect(SessionConfig::new("http://127.0.0.1:1/ws", 1000, "pw"), signals.observers()).await;

    assert!(matches!(result, Err(TransportError::InvalidEndpoint(ref url)) if url == "http://127.0.0.1:1/ws"));
    assert_eq!(Signals::count(&signals.closed), 1);
}
