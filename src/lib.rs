//! dronelink: client sessions for a remote vehicle-control WebSocket API.
//!
//! DESIGN
//! ======
//! One [`Session`] wraps one connection. The server speaks first with a
//! salted challenge; the session answers with a hashed token, subscribes to
//! periodic telemetry once the server accepts it, and mirrors the latest
//! vehicle state. Commands are fire-and-forget JSON frames.
//!
//! - [`auth`]: credential hashing and handshake states
//! - [`config`]: typed configuration from environment variables
//! - [`mirror`]: last-known telemetry and vehicle link state
//! - [`session`]: the synchronous protocol state machine
//! - [`transport`]: the tokio actor that runs a session over a WebSocket
//!
//! Wire types live in the `frames` crate.

pub mod auth;
pub mod config;
pub mod mirror;
pub mod session;
pub mod transport;

pub use auth::AuthState;
pub use config::{ConfigError, Password, SessionConfig};
pub use mirror::{Telemetry, VehicleMirror};
pub use session::{Dispatch, Observers, Session, SessionSnapshot, TransportState};
pub use transport::{SessionHandle, TransportError, connect};
