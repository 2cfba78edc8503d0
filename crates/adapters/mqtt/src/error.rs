//! MQTT adapter error types.

use std::error::Error as _;
use std::time::Duration;

use tasmobridge_domain::credentials::BrokerCredentials;
use tasmobridge_domain::error::ConnectionError;

/// Errors specific to the MQTT adapter.
#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    /// The rumqttc client rejected a request.
    #[error("MQTT client error")]
    Client(#[source] rumqttc::ClientError),

    /// The event loop failed to reach or keep the broker.
    #[error("MQTT connection error")]
    Connection(#[source] rumqttc::ConnectionError),

    /// The broker answered the connection with a non-success code.
    #[error("broker refused the connection: {0:?}")]
    Refused(rumqttc::ConnectReturnCode),

    /// No acknowledgement arrived in time.
    #[error("broker did not acknowledge the connection within {0:?}")]
    ConnAckTimeout(Duration),
}

impl MqttError {
    /// Whether retrying with the same credentials cannot succeed.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Refused(code)
            | Self::Connection(rumqttc::ConnectionError::ConnectionRefused(code)) => matches!(
                code,
                rumqttc::ConnectReturnCode::BadUserNamePassword
                    | rumqttc::ConnectReturnCode::NotAuthorized
                    | rumqttc::ConnectReturnCode::BadClientId
                    | rumqttc::ConnectReturnCode::RefusedProtocolVersion
            ),
            _ => false,
        }
    }

    /// Convert a failed connection attempt for propagation across the broker port.
    #[must_use]
    pub fn into_connect_error(self, credentials: &BrokerCredentials) -> ConnectionError {
        ConnectionError::Connect {
            host: credentials.host.clone(),
            port: credentials.port,
            reason: self.reason(),
        }
    }

    /// Convert a failed publish for propagation across the broker port.
    #[must_use]
    pub fn into_publish_error(self, topic: &str, command: &str) -> ConnectionError {
        ConnectionError::Publish {
            topic: topic.to_string(),
            command: command.to_string(),
            reason: self.reason(),
        }
    }

    fn reason(&self) -> String {
        match self.source() {
            Some(source) => format!("{self}: {source}"),
            None => self.to_string(),
        }
    }
}
