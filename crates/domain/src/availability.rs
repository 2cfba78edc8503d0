//! Reasons a device is reported unavailable to the host.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Why a device is currently unavailable.
///
/// The string form is a message key; translating it is the host's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnavailableReason {
    /// Waiting for a broker connection.
    WaitingForBroker,
    /// The broker connection could not be acquired.
    ConnectionError,
    /// Connected, waiting for the device's first status report.
    WaitingForDevice,
    /// The device (or its connection) went away.
    ConnectionLost,
    /// The session was shut down.
    Deleted,
}

impl UnavailableReason {
    /// Message key for the host.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WaitingForBroker => "mqtt.waiting",
            Self::ConnectionError => "mqtt.connection_error",
            Self::WaitingForDevice => "device.waiting",
            Self::ConnectionLost => "device.connection_lost",
            Self::Deleted => "device.deleted",
        }
    }
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
