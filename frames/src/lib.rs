//! Shared frame model and JSON codec for the vehicle WebSocket protocol.
//!
//! This crate owns the wire representation used by the session library and
//! the CLI. Every frame is a JSON text object tagged by `type`.
//!
//! DESIGN
//! ======
//! - Inbound frames are validated at the parse boundary: a known tag with a
//!   payload that does not match its schema is an error, never a partially
//!   typed value.
//! - Unknown tags decode to [`Inbound::Unknown`] so newer servers stay
//!   compatible.
//! - Outbound frames are built through the constructors on [`Outbound`]; the
//!   normalisation rules (mode names are uppercased, only real booleans arm
//!   the vehicle) live here so every sender applies them the same way.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Tags this crate knows how to decode into a typed variant.
const KNOWN_INBOUND: &[&str] = &["hello", "validate", "return", "connection", "error"];

/// Error returned by [`decode_inbound`] and [`encode_outbound`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The text frame is not valid JSON.
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    /// The frame parsed, but is not a JSON object.
    #[error("frame is not a JSON object")]
    NotAnObject,
    /// The frame has no string `type` field.
    #[error("frame has no `type` tag")]
    MissingType,
    /// A known `type` whose payload does not match the expected schema.
    #[error("invalid `{kind}` frame: {source}")]
    Schema {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    /// A numeric attribute is NaN or infinite; JSON would carry it as `null`.
    #[error("non-finite value for `{field}`")]
    NonFinite { field: &'static str },
    /// An outbound frame could not be serialized.
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
}

// =============================================================================
// INBOUND
// =============================================================================

/// A frame received from the vehicle endpoint.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Inbound {
    /// Handshake challenge carrying a one-time salt.
    Hello { salt: String },
    /// Result of a validation attempt (also sent for requests made before
    /// the client validated).
    Validate { status: bool },
    /// Vehicle attribute snapshot.
    Return {
        attributes: Map<String, Value>,
        #[serde(default, rename = "fromListener")]
        from_listener: Option<bool>,
    },
    /// Server-side link state to the vehicle.
    Connection { data: ConnectionData },
    /// Server rejected a command.
    Error { error: ServerError },
    /// Any tag this crate does not recognise.
    #[serde(skip)]
    Unknown { kind: String },
}

impl Inbound {
    /// The wire `type` tag for this frame.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Validate { .. } => "validate",
            Self::Return { .. } => "return",
            Self::Connection { .. } => "connection",
            Self::Error { .. } => "error",
            Self::Unknown { kind } => kind,
        }
    }
}

/// Payload of a `connection` frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionData {
    pub connected: bool,
}

/// Payload of an `error` frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    /// Error class reported by the server, e.g. `"TypeError"`.
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

/// Decode one inbound text frame.
///
/// # Errors
///
/// Returns [`CodecError::InvalidJson`] for unparseable text,
/// [`CodecError::NotAnObject`] / [`CodecError::MissingType`] for frames
/// without a tag, and [`CodecError::Schema`] when a known tag carries a
/// payload of the wrong shape.
pub fn decode_inbound(text: &str) -> Result<Inbound, CodecError> {
    let value = serde_json::from_str::<Value>(text).map_err(CodecError::InvalidJson)?;
    let Value::Object(map) = value else {
        return Err(CodecError::NotAnObject);
    };
    let kind = map
        .get("type")
        .and_then(Value::as_str)
        .ok_or(CodecError::MissingType)?
        .to_owned();

    if !KNOWN_INBOUND.contains(&kind.as_str()) {
        return Ok(Inbound::Unknown { kind });
    }

    serde_json::from_value::<Inbound>(Value::Object(map))
        .map_err(|source| CodecError::Schema { kind, source })
}

// =============================================================================
// OUTBOUND
// =============================================================================

/// Raw channel overrides keyed by channel number. An empty map clears all
/// overrides on the vehicle.
pub type ChannelOverrides = BTreeMap<u32, u16>;

/// Vehicle parameters keyed by parameter name.
pub type Parameters = BTreeMap<String, f64>;

/// A frame sent to the vehicle endpoint.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Outbound {
    /// Answer to a `hello` challenge.
    Validate { token: String },
    /// Attribute request. `None` asks for a single `return`; `Some(None)`
    /// cancels the listener; `Some(Some(secs))` subscribes at that period.
    Get {
        #[serde(skip_serializing_if = "Option::is_none")]
        listener: Option<Option<f64>>,
    },
    /// Attribute update.
    Set { attributes: SetAttributes },
    /// Ask the server to close the connection.
    Close,
}

/// Attributes carried by a `set` frame. Only populated fields are written.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SetAttributes {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub armed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<LocationUpdate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<ChannelsUpdate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub groundspeed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub airspeed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Parameters>,
}

/// `location` attribute. Only the home location is settable.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LocationUpdate {
    pub home: HomeLocation,
}

/// `channels` attribute. Only overrides are settable.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChannelsUpdate {
    pub overrides: ChannelOverrides,
}

/// Home location record. Only finiteness is checked; ranges are the
/// server's concern.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HomeLocation {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    /// Location frame label, e.g. `"LocationGlobal"`.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<String>,
}

impl HomeLocation {
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.lat.is_finite() && self.lon.is_finite() && self.alt.is_finite()
    }
}

impl SetAttributes {
    /// First numeric attribute that JSON cannot represent, if any.
    #[must_use]
    pub fn non_finite_field(&self) -> Option<&'static str> {
        let bad = |value: Option<f64>| value.is_some_and(|v| !v.is_finite());
        if self.location.as_ref().is_some_and(|l| !l.home.is_finite()) {
            return Some("location.home");
        }
        if bad(self.groundspeed) {
            return Some("groundspeed");
        }
        if bad(self.airspeed) {
            return Some("airspeed");
        }
        if self.parameters.as_ref().is_some_and(|p| p.values().any(|v| !v.is_finite())) {
            return Some("parameters");
        }
        None
    }
}

impl Outbound {
    #[must_use]
    pub fn validate(token: impl Into<String>) -> Self {
        Self::Validate { token: token.into() }
    }

    /// Subscribe to periodic `return` frames. The period goes on the wire in
    /// seconds.
    #[must_use]
    pub fn subscribe(interval: Duration) -> Self {
        Self::Get { listener: Some(Some(interval.as_secs_f64())) }
    }

    #[must_use]
    pub fn get_once() -> Self {
        Self::Get { listener: None }
    }

    #[must_use]
    pub fn cancel_listener() -> Self {
        Self::Get { listener: Some(None) }
    }

    /// Mode names are uppercased; legality is decided by the server.
    #[must_use]
    pub fn set_mode(name: &str) -> Self {
        Self::set(SetAttributes { mode: Some(name.to_uppercase()), ..SetAttributes::default() })
    }

    #[must_use]
    pub fn set_armed(armed: bool) -> Self {
        Self::set(SetAttributes { armed: Some(armed), ..SetAttributes::default() })
    }

    /// Build an arm/disarm frame from untyped input. Anything other than a
    /// JSON boolean yields `None`.
    #[must_use]
    pub fn armed_from_value(value: &Value) -> Option<Self> {
        value.as_bool().map(Self::set_armed)
    }

    /// `None` when any coordinate is NaN or infinite.
    #[must_use]
    pub fn set_home_location(home: HomeLocation) -> Option<Self> {
        home.is_finite().then(|| {
            Self::set(SetAttributes {
                location: Some(LocationUpdate { home }),
                ..SetAttributes::default()
            })
        })
    }

    #[must_use]
    pub fn set_channel_overrides(overrides: ChannelOverrides) -> Self {
        Self::set(SetAttributes {
            channels: Some(ChannelsUpdate { overrides }),
            ..SetAttributes::default()
        })
    }

    /// `None` for a NaN or infinite speed.
    #[must_use]
    pub fn set_groundspeed(speed: f64) -> Option<Self> {
        speed
            .is_finite()
            .then(|| Self::set(SetAttributes { groundspeed: Some(speed), ..SetAttributes::default() }))
    }

    /// `None` for a NaN or infinite speed.
    #[must_use]
    pub fn set_airspeed(speed: f64) -> Option<Self> {
        speed
            .is_finite()
            .then(|| Self::set(SetAttributes { airspeed: Some(speed), ..SetAttributes::default() }))
    }

    /// `None` when any value is NaN or infinite.
    #[must_use]
    pub fn set_parameters(parameters: Parameters) -> Option<Self> {
        parameters
            .values()
            .all(|value| value.is_finite())
            .then(|| Self::set(SetAttributes { parameters: Some(parameters), ..SetAttributes::default() }))
    }

    #[must_use]
    pub fn set(attributes: SetAttributes) -> Self {
        Self::Set { attributes }
    }

    /// The wire `type` tag for this frame.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validate { .. } => "validate",
            Self::Get { .. } => "get",
            Self::Set { .. } => "set",
            Self::Close => "close",
        }
    }
}

/// Encode an outbound frame as JSON text.
///
/// # Errors
///
/// Returns [`CodecError::NonFinite`] for a `set` carrying NaN or infinity
/// and [`CodecError::Encode`] if serialization fails.
pub fn encode_outbound(frame: &Outbound) -> Result<String, CodecError> {
    if let Outbound::Set { attributes } = frame {
        if let Some(field) = attributes.non_finite_field() {
            return Err(CodecError::NonFinite { field });
        }
    }
    serde_json::to_string(frame).map_err(CodecError::Encode)
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
