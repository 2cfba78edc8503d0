//! Common error types used across the workspace.
//!
//! Each layer defines its own typed errors and converts into [`BridgeError`]
//! via `#[from]`. An unsupported device found during discovery is not an
//! error: it is reported as an empty discovery result.

use std::time::Duration;

/// Top-level error for every fallible bridge operation.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// A transport connection could not be acquired or maintained.
    #[error("connection error")]
    Connection(#[from] ConnectionError),

    /// A correlated reply did not arrive within its bound.
    #[error("timed out waiting for reply")]
    Timeout(#[from] TimeoutError),

    /// The device confirmed a different value than requested.
    #[error("value mismatch")]
    ValueMismatch(#[from] ValueMismatchError),

    /// Input violated a domain invariant.
    #[error("validation error")]
    Validation(#[from] ValidationError),

    /// A referenced device does not exist.
    #[error("not found")]
    NotFound(#[from] NotFoundError),

    /// The host runtime rejected an update.
    #[error("host runtime error")]
    Runtime(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Failure to acquire or use a transport connection.
///
/// `Clone` so that a single failed acquisition can be reported to every
/// caller that was waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// The broker refused or could not be reached.
    #[error("could not connect to broker at {host}:{port}: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    /// A command could not be handed to the transport.
    #[error("failed to publish {command} to {topic}: {reason}")]
    Publish {
        topic: String,
        command: String,
        reason: String,
    },

    /// The session has no live connection to send on.
    #[error("device is not connected")]
    NotConnected,

    /// The connection (or the per-device handle) was closed.
    #[error("connection closed")]
    Closed,
}

/// No correlated reply arrived within the allowed wait.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no reply for {correlation} within {after:?}")]
pub struct TimeoutError {
    /// The correlation key that was awaited (e.g. `result.poweronstate`).
    pub correlation: String,
    /// How long the caller waited.
    pub after: Duration,
}

/// The device confirmed a different value than the one requested.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{setting}: requested {requested:?} but device confirmed {confirmed:?}")]
pub struct ValueMismatchError {
    /// Setting name as sent on the wire.
    pub setting: String,
    /// The value that was requested.
    pub requested: String,
    /// The value the device reported back.
    pub confirmed: String,
}

/// Invariant violations detected while building or using domain values.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    /// Switch numbers are 1 to 4.
    #[error("switch index {0} is out of range 1..=4")]
    SwitchIndexOutOfRange(u8),

    /// Capability identifier not known to the bridge.
    #[error("unknown capability {0:?}")]
    UnknownCapability(String),

    /// A capability that the device class cannot carry.
    #[error("capability {capability} is not valid for a {class} device")]
    CapabilityNotAllowed {
        capability: String,
        class: &'static str,
    },

    /// A capability write for a capability the device does not have.
    #[error("device does not expose capability {0}")]
    MissingCapability(String),

    /// A device record without capabilities.
    #[error("device must expose at least one capability")]
    NoCapabilities,

    /// Hardware address that is not a 6-byte MAC.
    #[error("invalid hardware address {0:?}")]
    InvalidMac(String),

    /// Topic was empty.
    #[error("topic must not be empty")]
    EmptyTopic,

    /// Position that is not a number.
    #[error("position {0} is not a number")]
    InvalidPosition(f64),

    /// Broker host was empty.
    #[error("broker host must not be empty")]
    EmptyHost,
}

/// A referenced item does not exist.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{entity} {id} not found")]
pub struct NotFoundError {
    /// Kind of item (e.g. `"Device"`).
    pub entity: &'static str,
    /// Identifier that was looked up.
    pub id: String,
}
