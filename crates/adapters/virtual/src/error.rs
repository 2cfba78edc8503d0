//! Virtual adapter error types.

use tasmobridge_domain::credentials::BrokerCredentials;
use tasmobridge_domain::error::{BridgeError, ConnectionError, NotFoundError, ValidationError};

/// Errors specific to the virtual adapter.
#[derive(Debug, thiserror::Error)]
pub enum VirtualError {
    /// No simulated device uses this topic.
    #[error("no virtual device with topic {0:?}")]
    UnknownDevice(String),

    /// Two simulated devices share a topic.
    #[error("duplicate virtual device topic {0:?}")]
    DuplicateTopic(String),

    /// More relays than a device can expose.
    #[error("virtual device {topic:?} has {relays} relays, at most 4 are supported")]
    TooManyRelays { topic: String, relays: u8 },

    /// The device has no relay with this number.
    #[error("virtual device {topic:?} has no relay {index}")]
    NoSuchRelay { topic: String, index: u8 },

    /// The device configuration violates a domain rule.
    #[error("invalid virtual device")]
    Invalid(#[source] ValidationError),

    /// The login does not match the configured password.
    #[error("not authorized")]
    NotAuthorized,
}

impl VirtualError {
    /// Convert into a [`BridgeError`] for propagation across port boundaries.
    pub fn into_domain(self) -> BridgeError {
        match self {
            Self::UnknownDevice(topic) => NotFoundError {
                entity: "VirtualDevice",
                id: topic,
            }
            .into(),
            Self::Invalid(err) => err.into(),
            other => BridgeError::Runtime(Box::new(other)),
        }
    }

    /// Convert a refused connection for propagation across the broker port.
    #[must_use]
    pub fn into_connect_error(self, credentials: &BrokerCredentials) -> ConnectionError {
        ConnectionError::Connect {
            host: credentials.host.clone(),
            port: credentials.port,
            reason: self.to_string(),
        }
    }
}

impl From<VirtualError> for BridgeError {
    fn from(err: VirtualError) -> Self {
        err.into_domain()
    }
}
