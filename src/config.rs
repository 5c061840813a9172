//! Session configuration parsed from environment variables.

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;

use std::fmt;
use std::time::Duration;

use zeroize::{Zeroize, ZeroizeOnDrop};

pub const DEFAULT_ENDPOINT: &str = "ws://127.0.0.1:8080/websocket";
pub const DEFAULT_LISTENER_MS: u64 = 1000;

pub const ENV_URL: &str = "DRONELINK_URL";
pub const ENV_PASSWORD: &str = "DRONELINK_PASSWORD";
pub const ENV_LISTENER_MS: &str = "DRONELINK_LISTENER_MS";
pub const ENV_DEBUG: &str = "DRONELINK_DEBUG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing password; set {var}")]
    MissingPassword { var: &'static str },
    #[error("invalid {var}: {value:?} (expected a positive integer of milliseconds)")]
    InvalidListener { var: &'static str, value: String },
    #[error("invalid {var}: {value:?} (expected ws:// or wss:// URL)")]
    InvalidEndpoint { var: &'static str, value: String },
}

/// Plaintext API password. Zeroized on drop and never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Password(String);

impl Password {
    pub fn new(password: impl Into<String>) -> Self {
        Self(password.into())
    }

    pub(crate) fn expose(&self) -> &str {
        &self.0
    }
}

impl From<String> for Password {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Password {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(<redacted>)")
    }
}

/// Everything needed to build a [`crate::Session`].
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// WebSocket URL of the vehicle endpoint.
    pub endpoint: String,
    /// Period of the telemetry listener requested after validation.
    pub listener_interval: Duration,
    pub password: Password,
    /// Log every inbound and outbound frame at `info`.
    pub debug: bool,
}

impl SessionConfig {
    #[must_use]
    pub fn new(endpoint: impl Into<String>, listener_interval_ms: u64, password: impl Into<Password>) -> Self {
        Self {
            endpoint: endpoint.into(),
            listener_interval: Duration::from_millis(listener_interval_ms),
            password: password.into(),
            debug: false,
        }
    }

    #[must_use]
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Build typed session config from environment variables. An empty
    /// variable counts as unset.
    ///
    /// Required:
    /// - `DRONELINK_PASSWORD`
    ///
    /// Optional:
    /// - `DRONELINK_URL`: default `ws://127.0.0.1:8080/websocket`
    /// - `DRONELINK_LISTENER_MS`: default 1000, must be positive
    /// - `DRONELINK_DEBUG`: `1` or `true` enables frame logging
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the password is missing or a value does
    /// not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Self::from_env`] over an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// See [`Self::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let endpoint = lookup(ENV_URL)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_owned());
        validate_endpoint(&endpoint).map_err(|value| ConfigError::InvalidEndpoint { var: ENV_URL, value })?;

        let password = lookup(ENV_PASSWORD)
            .filter(|s| !s.is_empty())
            .map(Password::from)
            .ok_or(ConfigError::MissingPassword { var: ENV_PASSWORD })?;

        let listener_ms = match lookup(ENV_LISTENER_MS).filter(|s| !s.trim().is_empty()) {
            None => DEFAULT_LISTENER_MS,
            Some(raw) => parse_listener_ms(&raw)
                .ok_or(ConfigError::InvalidListener { var: ENV_LISTENER_MS, value: raw })?,
        };

        let debug = lookup(ENV_DEBUG).is_some_and(|raw| parse_flag(&raw));

        Ok(Self::new(endpoint, listener_ms, password).with_debug(debug))
    }
}

/// Accepts only `ws://` and `wss://` URLs with a host part.
///
/// # Errors
///
/// Returns the offending endpoint.
pub fn validate_endpoint(endpoint: &str) -> Result<(), String> {
    let rest = endpoint
        .strip_prefix("ws://")
        .or_else(|| endpoint.strip_prefix("wss://"));
    match rest {
        Some(rest) if !rest.is_empty() && !rest.starts_with('/') => Ok(()),
        _ => Err(endpoint.to_owned()),
    }
}

fn parse_listener_ms(raw: &str) -> Option<u64> {
    raw.trim().parse::<u64>().ok().filter(|ms| *ms > 0)
}

fn parse_flag(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
