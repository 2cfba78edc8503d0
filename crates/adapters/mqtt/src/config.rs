//! MQTT adapter configuration.

use std::time::Duration;

use serde::Deserialize;

/// Client-side settings shared by every broker connection.
///
/// Broker address and login are per device; they live in the device
/// settings, not here.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Prefix of the generated client identifier; a random suffix keeps
    /// concurrent connections to one broker apart.
    pub client_id_prefix: String,
    /// Keep-alive interval in seconds.
    pub keep_alive_secs: u16,
    /// How long to wait for the broker to acknowledge a connection, in seconds.
    pub connect_timeout_secs: u16,
    /// Pause between connection attempts, in seconds.
    pub reconnect_delay_secs: u16,
    /// Capacity of the client's outgoing request queue.
    pub request_capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            client_id_prefix: "tasmobridge".to_string(),
            keep_alive_secs: 30,
            connect_timeout_secs: 10,
            reconnect_delay_secs: 5,
            request_capacity: 64,
        }
    }
}

impl MqttConfig {
    #[must_use]
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(u64::from(self.keep_alive_secs))
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.connect_timeout_secs))
    }

    #[must_use]
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(u64::from(self.reconnect_delay_secs))
    }

    /// A fresh client identifier.
    #[must_use]
    pub fn client_id(&self) -> String {
        format!("{}-{}", self.client_id_prefix, uuid::Uuid::new_v4().simple())
    }
}
