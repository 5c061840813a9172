//! Last-known vehicle state as reported by the server.
//!
//! The mirror never merges: each `return` frame replaces the telemetry map
//! wholesale, and the vehicle link flag always reflects the most recent
//! `connection` or `return` frame.

#[cfg(test)]
#[path = "mirror_test.rs"]
mod mirror_test;

use frames::ServerError;
use serde::Serialize;
use serde_json::{Map, Value};

/// Vehicle attributes from the latest `return` frame. The shape is whatever
/// the server sent; accessors cover the fields callers read most. Always a
/// JSON object.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Telemetry(Value);

impl Default for Telemetry {
    fn default() -> Self {
        Self::new(Map::new())
    }
}

impl Telemetry {
    #[must_use]
    pub fn new(attributes: Map<String, Value>) -> Self {
        Self(Value::Object(attributes))
    }

    /// The attribute object as a JSON value.
    #[must_use]
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// RFC 6901 lookup, e.g. `"/battery/level"`. `""` is the whole object.
    #[must_use]
    pub fn pointer(&self, pointer: &str) -> Option<&Value> {
        self.0.pointer(pointer)
    }

    #[must_use]
    pub fn mode(&self) -> Option<&str> {
        self.get("mode").and_then(Value::as_str)
    }

    #[must_use]
    pub fn armed(&self) -> Option<bool> {
        self.get("armed").and_then(Value::as_bool)
    }

    #[must_use]
    pub fn last_heartbeat(&self) -> Option<f64> {
        self.get("last_heartbeat").and_then(Value::as_f64)
    }

    #[must_use]
    pub fn battery_level(&self) -> Option<f64> {
        self.pointer("/battery/level").and_then(Value::as_f64)
    }
}

/// Server-reported state held by a session.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VehicleMirror {
    telemetry: Option<Telemetry>,
    connected: bool,
    from_listener: Option<bool>,
    last_server_error: Option<ServerError>,
}

impl VehicleMirror {
    #[must_use]
    pub fn telemetry(&self) -> Option<&Telemetry> {
        self.telemetry.as_ref()
    }

    #[must_use]
    pub fn connected(&self) -> bool {
        self.connected
    }

    /// Whether the latest `return` came from the listener rather than a
    /// one-shot request. `None` when the server did not say.
    #[must_use]
    pub fn from_listener(&self) -> Option<bool> {
        self.from_listener
    }

    #[must_use]
    pub fn last_server_error(&self) -> Option<&ServerError> {
        self.last_server_error.as_ref()
    }

    /// A `return` frame: replace telemetry; receiving data means the server
    /// still has the vehicle.
    pub fn replace_telemetry(&mut self, attributes: Map<String, Value>, from_listener: Option<bool>) {
        self.telemetry = Some(Telemetry::new(attributes));
        self.from_listener = from_listener;
        self.connected = true;
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    pub fn record_error(&mut self, error: ServerError) {
        self.last_server_error = Some(error);
    }
}
