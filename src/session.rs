//! One vehicle connection: its handshake and its state mirror.
//!
//! ARCHITECTURE
//! ============
//! A `Session` is a synchronous state machine. The transport feeds it
//! lifecycle events (`handle_open`, `handle_text`, `handle_close`) one at a
//! time, in delivery order. It never performs I/O: outbound frames are
//! pushed into an unbounded channel that the transport drains, so no method
//! here blocks or waits for a reply.
//!
//! HANDSHAKE
//! =========
//! 1. Transport opens → nothing; the server speaks first.
//! 2. `hello{salt}` → answer `validate{token}`, spend the credential.
//! 3. `validate{true}` → subscribe to telemetry once, fire `on_ready`.
//!    `validate{false}` after step 2 → terminal rejection, fire
//!    `on_auth_failed`. A verdict arriving before step 2 is ignored.
//!
//! Commands are only gated on the transport being open. They do not wait
//! for validation; callers that care read [`Session::auth_state`].

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;

use std::time::Duration;

use frames::{ChannelOverrides, HomeLocation, Inbound, Outbound, Parameters, ServerError};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use crate::auth::{AuthState, CredentialHash, is_genuine_rejection};
use crate::config::SessionConfig;
use crate::mirror::{Telemetry, VehicleMirror};

// =============================================================================
// OBSERVERS
// =============================================================================

/// Callback receiving every accepted inbound frame, verbatim.
pub type MessageObserver = Box<dyn FnMut(&str) + Send>;

/// Callback for a lifecycle signal.
pub type SignalObserver = Box<dyn FnMut() + Send>;

/// Callbacks injected into a session. Anything not set is a no-op.
pub struct Observers {
    on_message: MessageObserver,
    on_auth_failed: SignalObserver,
    on_ready: SignalObserver,
    on_close: SignalObserver,
}

impl Observers {
    pub fn new(on_message: impl FnMut(&str) + Send + 'static) -> Self {
        Self { on_message: Box::new(on_message), ..Self::default() }
    }

    #[must_use]
    pub fn on_auth_failed(mut self, f: impl FnMut() + Send + 'static) -> Self {
        self.on_auth_failed = Box::new(f);
        self
    }

    /// Called once the server accepts the token and the telemetry listener
    /// has been requested.
    #[must_use]
    pub fn on_ready(mut self, f: impl FnMut() + Send + 'static) -> Self {
        self.on_ready = Box::new(f);
        self
    }

    #[must_use]
    pub fn on_close(mut self, f: impl FnMut() + Send + 'static) -> Self {
        self.on_close = Box::new(f);
        self
    }
}

impl Default for Observers {
    fn default() -> Self {
        Self {
            on_message: Box::new(|_| {}),
            on_auth_failed: Box::new(|| {}),
            on_ready: Box::new(|| {}),
            on_close: Box::new(|| {}),
        }
    }
}

// =============================================================================
// STATE
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    Connecting,
    Open,
    Closed,
}

/// What the dispatcher did with one inbound frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// `hello` answered with a token.
    Challenged,
    /// `hello` after the credential was spent; no answer sent.
    HelloIgnored,
    Validated,
    Rejected,
    /// `validate` outside of a pending challenge.
    ValidateIgnored,
    Telemetry,
    Connectivity(bool),
    ServerError,
    /// Unknown `type`; forwarded but otherwise ignored.
    Ignored,
    /// Unparseable or schema-invalid frame; not forwarded.
    Dropped,
}

/// Point-in-time copy of a session's public read state.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub transport: TransportState,
    pub auth: AuthState,
    pub connected_to_vehicle: bool,
    pub telemetry: Option<Telemetry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_server_error: Option<ServerError>,
}

// =============================================================================
// SESSION
// =============================================================================

pub struct Session {
    endpoint: String,
    listener_interval: Duration,
    debug: bool,
    transport: TransportState,
    auth: AuthState,
    /// Present only until the first `hello` is answered.
    credential: Option<CredentialHash>,
    mirror: VehicleMirror,
    outbound: mpsc::UnboundedSender<String>,
    observers: Observers,
}

impl Session {
    /// Build a session. The password is hashed here and the plaintext is
    /// zeroized before this returns.
    #[must_use]
    pub fn new(config: SessionConfig, outbound: mpsc::UnboundedSender<String>, observers: Observers) -> Self {
        let SessionConfig { endpoint, listener_interval, password, debug } = config;
        let credential = CredentialHash::from_password(&password);
        drop(password);
        Self {
            endpoint,
            listener_interval,
            debug,
            transport: TransportState::Connecting,
            auth: AuthState::Unauthenticated,
            credential: Some(credential),
            mirror: VehicleMirror::default(),
            outbound,
            observers,
        }
    }

    // -------------------------------------------------------------------------
    // Read state
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[must_use]
    pub fn listener_interval(&self) -> Duration {
        self.listener_interval
    }

    #[must_use]
    pub fn transport_state(&self) -> TransportState {
        self.transport
    }

    #[must_use]
    pub fn auth_state(&self) -> AuthState {
        self.auth
    }

    /// True until the credential has been spent on a `hello`.
    #[must_use]
    pub fn has_pending_credential(&self) -> bool {
        self.credential.is_some()
    }

    #[must_use]
    pub fn telemetry(&self) -> Option<&Telemetry> {
        self.mirror.telemetry()
    }

    #[must_use]
    pub fn connected_to_vehicle(&self) -> bool {
        self.mirror.connected()
    }

    #[must_use]
    pub fn last_server_error(&self) -> Option<&ServerError> {
        self.mirror.last_server_error()
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            transport: self.transport,
            auth: self.auth,
            connected_to_vehicle: self.mirror.connected(),
            telemetry: self.mirror.telemetry().cloned(),
            last_server_error: self.mirror.last_server_error().cloned(),
        }
    }

    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    pub fn set_close_observer(&mut self, f: impl FnMut() + Send + 'static) {
        self.observers.on_close = Box::new(f);
    }

    // -------------------------------------------------------------------------
    // Transport events
    // -------------------------------------------------------------------------

    /// The server initiates the handshake, so opening sends nothing.
    pub fn handle_open(&mut self) {
        self.transport = TransportState::Open;
        debug!(endpoint = %self.endpoint, "session: transport open");
    }

    pub fn handle_close(&mut self) {
        if self.transport == TransportState::Closed {
            return;
        }
        self.transport = TransportState::Closed;
        self.mirror.set_connected(false);
        info!(endpoint = %self.endpoint, auth = ?self.auth, "session: transport closed");
        (self.observers.on_close)();
    }

    /// Parse, apply and forward one inbound text frame.
    pub fn handle_text(&mut self, text: &str) -> Dispatch {
        if self.debug {
            info!(frame = %text, "session: rx");
        }

        let message = match frames::decode_inbound(text) {
            Ok(message) => message,
            Err(error) => {
                warn!(%error, "session: dropping invalid frame");
                return Dispatch::Dropped;
            }
        };

        let outcome = self.apply(message);
        (self.observers.on_message)(text);
        outcome
    }

    fn apply(&mut self, message: Inbound) -> Dispatch {
        match message {
            Inbound::Hello { salt } => self.handle_hello(salt),
            Inbound::Validate { status } => self.handle_validate(status),
            Inbound::Return { attributes, from_listener } => {
                self.mirror.replace_telemetry(attributes, from_listener);
                Dispatch::Telemetry
            }
            Inbound::Connection { data } => {
                if data.connected != self.mirror.connected() {
                    info!(connected = data.connected, "session: vehicle link changed");
                }
                self.mirror.set_connected(data.connected);
                Dispatch::Connectivity(data.connected)
            }
            Inbound::Error { error } => {
                warn!(kind = %error.kind, detail = %error.message, "session: server error");
                self.mirror.record_error(error);
                Dispatch::ServerError
            }
            Inbound::Unknown { kind } => {
                debug!(%kind, "session: ignoring unknown frame type");
                Dispatch::Ignored
            }
        }
    }

    fn handle_hello(&mut self, mut salt: String) -> Dispatch {
        let Some(credential) = self.credential.take() else {
            warn!(auth = ?self.auth, "session: repeated hello; credential already spent");
            salt.zeroize();
            return Dispatch::HelloIgnored;
        };

        let token = credential.token(&salt);
        drop(credential);
        salt.zeroize();

        self.send(&Outbound::validate(token));
        self.auth = AuthState::Challenged;
        debug!("session: challenge answered");
        Dispatch::Challenged
    }

    fn handle_validate(&mut self, status: bool) -> Dispatch {
        if self.auth != AuthState::Challenged {
            debug!(status, auth = ?self.auth, "session: validate outside of challenge");
            return Dispatch::ValidateIgnored;
        }

        if status {
            self.auth = AuthState::Validated;
            self.send(&Outbound::subscribe(self.listener_interval));
            info!(listener_secs = self.listener_interval.as_secs_f64(), "session: validated");
            (self.observers.on_ready)();
            return Dispatch::Validated;
        }

        if is_genuine_rejection(status, self.credential.is_none()) {
            self.auth = AuthState::Rejected;
            warn!(endpoint = %self.endpoint, "session: password rejected");
            (self.observers.on_auth_failed)();
            return Dispatch::Rejected;
        }

        Dispatch::ValidateIgnored
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    /// Queue a prepared frame. Returns `false` when the transport is not
    /// open or the outbound channel is gone.
    pub fn send_command(&self, command: &Outbound) -> bool {
        self.send(command)
    }

    pub fn set_mode(&self, name: &str) -> bool {
        self.send(&Outbound::set_mode(name))
    }

    pub fn set_armed(&self, armed: bool) -> bool {
        self.send(&Outbound::set_armed(armed))
    }

    /// Arm or disarm from untyped input. Only JSON `true`/`false` are sent;
    /// anything else is silently dropped.
    pub fn set_armed_value(&self, value: &Value) -> bool {
        self.send_valid(Outbound::armed_from_value(value), "armed")
    }

    /// Dropped when any coordinate is NaN or infinite.
    pub fn set_home_location(&self, home: HomeLocation) -> bool {
        self.send_valid(Outbound::set_home_location(home), "location.home")
    }

    /// Send raw channel overrides. An empty map clears them.
    pub fn set_channel_overrides(&self, overrides: ChannelOverrides) -> bool {
        self.send(&Outbound::set_channel_overrides(overrides))
    }

    pub fn clear_channel_overrides(&self) -> bool {
        self.set_channel_overrides(ChannelOverrides::new())
    }

    pub fn set_groundspeed(&self, speed: f64) -> bool {
        self.send_valid(Outbound::set_groundspeed(speed), "groundspeed")
    }

    pub fn set_airspeed(&self, speed: f64) -> bool {
        self.send_valid(Outbound::set_airspeed(speed), "airspeed")
    }

    pub fn set_parameters(&self, parameters: Parameters) -> bool {
        self.send_valid(Outbound::set_parameters(parameters), "parameters")
    }

    /// Ask for a single `return` frame outside the listener period.
    pub fn request_attributes(&self) -> bool {
        self.send(&Outbound::get_once())
    }

    pub fn cancel_listener(&self) -> bool {
        self.send(&Outbound::cancel_listener())
    }

    /// Ask the server to close the connection from its side.
    pub fn request_close(&self) -> bool {
        self.send(&Outbound::Close)
    }

    /// Invalid arguments produce no frame and are dropped here.
    fn send_valid(&self, command: Option<Outbound>, attribute: &'static str) -> bool {
        match command {
            Some(command) => self.send(&command),
            None => {
                debug!(attribute, "session: ignoring invalid command argument");
                false
            }
        }
    }

    fn send(&self, command: &Outbound) -> bool {
        if self.transport != TransportState::Open {
            debug!(kind = command.kind(), transport = ?self.transport, "session: transport not open; dropping command");
            return false;
        }

        let text = match frames::encode_outbound(command) {
            Ok(text) => text,
            Err(error) => {
                warn!(kind = command.kind(), %error, "session: failed to encode command");
                return false;
            }
        };

        if self.debug {
            info!(frame = %loggable_frame(command, &text), "session: tx");
        }
        self.outbound.send(text).is_ok()
    }
}

/// Outbound text as it may appear in logs. The `validate` token is derived
/// from the password hash and never logged.
fn loggable_frame<'a>(command: &Outbound, text: &'a str) -> &'a str {
    match command {
        Outbound::Validate { .. } => r#"{"type":"validate","token":"<redacted>"}"#,
        _ => text,
    }
}
