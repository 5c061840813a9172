//! WebSocket transport actor.
//!
//! ARCHITECTURE
//! ============
//! `connect` opens the WebSocket, then moves the [`Session`] into a single
//! tokio task. That task is the only owner of session state; everything
//! else talks to it through a cloneable [`SessionHandle`]:
//!
//! - commands and close requests travel in over an unbounded control channel
//! - state travels out as [`SessionSnapshot`]s on a `watch` channel
//!
//! The loop `select!`s over three sources. Outbound frames queued by the
//! session are flushed first so a `validate` answer never trails a later
//! read. Each inbound text frame is handled to completion before the next
//! one is polled.
//!
//! LIFECYCLE
//! =========
//! 1. `connect` → WebSocket handshake → `handle_open` → spawn the loop
//! 2. Frames in → `handle_text` → snapshot published
//! 3. Socket ends, errors, or `close()` is requested → `handle_close`
//!
//! A connect that fails never spawns the loop, but still runs the close
//! path so observers see the failure. There is no reconnection.

use futures_util::{SinkExt, StreamExt};
use frames::{ChannelOverrides, HomeLocation, Outbound, Parameters};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::auth::AuthState;
use crate::config::{SessionConfig, validate_endpoint};
use crate::session::{Observers, Session, SessionSnapshot, TransportState};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("websocket connect failed: {0}")]
    Connect(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("invalid endpoint: {0:?} (expected ws:// or wss:// URL)")]
    InvalidEndpoint(String),
    #[error("session closed")]
    Closed,
}

/// Request sent from a [`SessionHandle`] to the session task.
#[derive(Debug)]
enum Control {
    Command(Outbound),
    Close,
}

// =============================================================================
// HANDLE
// =============================================================================

/// Cheap, cloneable access to a running session.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    control: mpsc::UnboundedSender<Control>,
    state: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    /// Latest published state.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    /// A receiver that is notified on every published state change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.clone()
    }

    /// Resolve once the server has accepted or refused the token, or the
    /// transport closed first.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] when the session task is gone
    /// without having published a settled state.
    pub async fn wait_for_auth(&self) -> Result<AuthState, TransportError> {
        let mut state = self.state.clone();
        let snapshot = state
            .wait_for(|s| s.auth.is_settled() || s.transport == TransportState::Closed)
            .await
            .map_err(|_| TransportError::Closed)?;
        Ok(snapshot.auth)
    }

    /// Resolve once the transport has closed.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        if state.wait_for(|s| s.transport == TransportState::Closed).await.is_err() {
            debug!("transport: session task exited");
        }
    }

    /// Queue a prepared frame for the session task. Returns `false` once the
    /// task has exited; the session itself still drops the frame if the
    /// transport is not open.
    pub fn send_command(&self, command: Outbound) -> bool {
        self.control.send(Control::Command(command)).is_ok()
    }

    pub fn set_mode(&self, name: &str) -> bool {
        self.send_command(Outbound::set_mode(name))
    }

    pub fn set_armed(&self, armed: bool) -> bool {
        self.send_command(Outbound::set_armed(armed))
    }

    /// Only JSON booleans produce a frame; anything else is dropped here.
    pub fn set_armed_value(&self, value: &serde_json::Value) -> bool {
        Outbound::armed_from_value(value).is_some_and(|command| self.send_command(command))
    }

    /// NaN or infinite values are dropped here, like the other numeric
    /// setters.
    pub fn set_home_location(&self, home: HomeLocation) -> bool {
        Outbound::set_home_location(home).is_some_and(|command| self.send_command(command))
    }

    pub fn set_channel_overrides(&self, overrides: ChannelOverrides) -> bool {
        self.send_command(Outbound::set_channel_overrides(overrides))
    }

    pub fn clear_channel_overrides(&self) -> bool {
        self.set_channel_overrides(ChannelOverrides::new())
    }

    pub fn set_groundspeed(&self, speed: f64) -> bool {
        Outbound::set_groundspeed(speed).is_some_and(|command| self.send_command(command))
    }

    pub fn set_airspeed(&self, speed: f64) -> bool {
        Outbound::set_airspeed(speed).is_some_and(|command| self.send_command(command))
    }

    pub fn set_parameters(&self, parameters: Parameters) -> bool {
        Outbound::set_parameters(parameters).is_some_and(|command| self.send_command(command))
    }

    pub fn request_attributes(&self) -> bool {
        self.send_command(Outbound::get_once())
    }

    pub fn cancel_listener(&self) -> bool {
        self.send_command(Outbound::cancel_listener())
    }

    /// Ask the server to close the connection from its side.
    pub fn request_close(&self) -> bool {
        self.send_command(Outbound::Close)
    }

    /// Close the WebSocket from this side. The normal close path runs.
    pub fn close(&self) -> bool {
        self.control.send(Control::Close).is_ok()
    }
}

// =============================================================================
// CONNECT
// =============================================================================

/// Open a session against `config.endpoint`.
///
/// # Errors
///
/// Returns [`TransportError::InvalidEndpoint`] for a non-WebSocket URL and
/// [`TransportError::Connect`] when the WebSocket handshake fails. In both
/// cases the close observer has already run.
pub async fn connect(
    config: SessionConfig,
    observers: Observers,
) -> Result<(SessionHandle, JoinHandle<()>), TransportError> {
    let endpoint = config.endpoint.clone();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let mut session = Session::new(config, outbound_tx, observers);

    if let Err(value) = validate_endpoint(&endpoint) {
        warn!(endpoint = %value, "transport: invalid endpoint");
        session.handle_close();
        return Err(TransportError::InvalidEndpoint(value));
    }

    let socket = match connect_async(endpoint.as_str()).await {
        Ok((socket, _response)) => socket,
        Err(error) => {
            warn!(%endpoint, %error, "transport: connect failed");
            session.handle_close();
            return Err(TransportError::Connect(Box::new(error)));
        }
    };

    info!(%endpoint, "transport: connected");
    session.handle_open();

    let (state_tx, state_rx) = watch::channel(session.snapshot());
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run(session, socket, outbound_rx, control_rx, state_tx));

    Ok((SessionHandle { control: control_tx, state: state_rx }, task))
}

// =============================================================================
// EVENT LOOP
// =============================================================================

async fn run(
    mut session: Session,
    mut socket: Socket,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
    state_tx: watch::Sender<SessionSnapshot>,
) {
    let mut handles_alive = true;
    loop {
        tokio::select! {
            biased;

            Some(text) = outbound_rx.recv() => {
                if let Err(error) = socket.send(Message::text(text)).await {
                    warn!(%error, "transport: send failed");
                    break;
                }
            }
            msg = socket.next() => {
                let Some(msg) = msg else { break };
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(error) => {
                        warn!(%error, "transport: read failed");
                        break;
                    }
                };
                match msg {
                    Message::Text(text) => {
                        session.handle_text(text.as_str());
                        publish(&state_tx, &session);
                    }
                    Message::Close(frame) => {
                        debug!(?frame, "transport: close frame received");
                        // Flush the automatic close reply before dropping the socket.
                        if let Err(error) = socket.close(None).await {
                            debug!(%error, "transport: close reply not sent");
                        }
                        break;
                    }
                    _ => {}
                }
            }
            control = control_rx.recv(), if handles_alive => {
                match control {
                    Some(Control::Command(command)) => {
                        session.send_command(&command);
                    }
                    Some(Control::Close) => {
                        if let Err(error) = socket.close(None).await {
                            debug!(%error, "transport: close handshake failed");
                        }
                        break;
                    }
                    // All handles dropped; keep serving the socket.
                    None => handles_alive = false,
                }
            }
        }
    }

    session.handle_close();
    publish(&state_tx, &session);
}

fn publish(state_tx: &watch::Sender<SessionSnapshot>, session: &Session) {
    state_tx.send_replace(session.snapshot());
}
