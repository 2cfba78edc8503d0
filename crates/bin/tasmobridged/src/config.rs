//! Configuration loading: TOML file with environment variable overrides.
//!
//! Looks for `tasmobridge.toml` in the working directory, or the file named
//! by `TASMOBRIDGE_CONFIG`. Every field has a sensible default so the file is
//! optional. Environment variables take precedence over file values.

use std::time::Duration;

use serde::Deserialize;

use tasmobridge_adapter_mqtt::MqttConfig;
use tasmobridge_adapter_virtual::VirtualDeviceConfig;
use tasmobridge_app::services::discovery::DiscoveryConfig;
use tasmobridge_app::services::session::SessionConfig;
use tasmobridge_domain::credentials::BrokerCredentials;
use tasmobridge_domain::device::DeviceRecord;
use tasmobridge_domain::error::ValidationError;
use tasmobridge_domain::id::DeviceId;

const DEFAULT_PATH: &str = "tasmobridge.toml";

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which broker to use and the credentials for pairing.
    pub broker: BrokerConfig,
    /// Device session timing.
    pub session: SessionSection,
    /// Pairing timing.
    pub discovery: DiscoverySection,
    /// Logging settings.
    pub logging: LoggingConfig,
    /// MQTT client settings.
    pub mqtt: MqttConfig,
    /// Paired devices.
    pub devices: Vec<DeviceRecord>,
    /// Simulated controllers served by the virtual broker.
    pub virtual_devices: Vec<VirtualDeviceConfig>,
}

/// Broker implementation backing every connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    #[default]
    Mqtt,
    Virtual,
}

impl BrokerKind {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mqtt" => Some(Self::Mqtt),
            "virtual" => Some(Self::Virtual),
            _ => None,
        }
    }
}

/// `[broker]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub kind: BrokerKind,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

/// `[session]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// Seconds between watchdog passes on switch banks.
    pub watchdog_interval_secs: u64,
    /// Seconds to wait for a settings confirmation.
    pub reply_timeout_secs: u64,
}

/// `[discovery]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DiscoverySection {
    pub announce_timeout_secs: u64,
    pub reply_timeout_secs: u64,
    pub probe_timeout_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive (`RUST_LOG` syntax).
    pub filter: String,
}

impl Config {
    /// Load configuration from `tasmobridge.toml` (if present) then apply
    /// environment-variable overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML file exists but is malformed, or the
    /// resulting configuration is invalid.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("TASMOBRIDGE_CONFIG").unwrap_or_else(|_| DEFAULT_PATH.to_string());
        let mut config = Self::from_file(&path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(ConfigError::Parse),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(ConfigError::Io(err)),
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("TASMOBRIDGE_BROKER_KIND") {
            if let Some(kind) = BrokerKind::parse(&val) {
                self.broker.kind = kind;
            }
        }
        if let Ok(val) = std::env::var("TASMOBRIDGE_BROKER_HOST") {
            self.broker.host = val;
        }
        if let Ok(val) = std::env::var("TASMOBRIDGE_BROKER_PORT") {
            if let Ok(port) = val.parse() {
                self.broker.port = port;
            }
        }
        if let Ok(val) = std::env::var("TASMOBRIDGE_BROKER_USER") {
            self.broker.username = val;
        }
        if let Ok(val) = std::env::var("TASMOBRIDGE_BROKER_PASSWORD") {
            self.broker.password = val;
        }
        if let Ok(val) = std::env::var("TASMOBRIDGE_LOG") {
            self.logging.filter = val;
        }
        if let Ok(val) = std::env::var("RUST_LOG") {
            self.logging.filter = val;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.port == 0 {
            return Err(ConfigError::Validation("broker port must be non-zero".to_string()));
        }
        let timeouts = [
            ("session.watchdog_interval_secs", self.session.watchdog_interval_secs),
            ("session.reply_timeout_secs", self.session.reply_timeout_secs),
            ("discovery.announce_timeout_secs", self.discovery.announce_timeout_secs),
            ("discovery.reply_timeout_secs", self.discovery.reply_timeout_secs),
            ("discovery.probe_timeout_secs", self.discovery.probe_timeout_secs),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, secs)| *secs == 0) {
            return Err(ConfigError::Validation(format!("{name} must be non-zero")));
        }
        for record in &self.devices {
            record.validate().map_err(|source| ConfigError::Device {
                id: record.id.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Credentials used to pair new devices.
    #[must_use]
    pub fn pairing_credentials(&self) -> BrokerCredentials {
        BrokerCredentials::new(
            self.broker.host.clone(),
            self.broker.port,
            self.broker.username.clone(),
            self.broker.password.clone(),
        )
    }

    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            watchdog_interval: Duration::from_secs(self.session.watchdog_interval_secs),
            reply_timeout: Duration::from_secs(self.session.reply_timeout_secs),
        }
    }

    #[must_use]
    pub fn discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            announce_timeout: Duration::from_secs(self.discovery.announce_timeout_secs),
            reply_timeout: Duration::from_secs(self.discovery.reply_timeout_secs),
            probe_timeout: Duration::from_secs(self.discovery.probe_timeout_secs),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        let credentials = BrokerCredentials::default();
        Self {
            kind: BrokerKind::default(),
            host: credentials.host,
            port: credentials.port,
            username: credentials.username,
            password: credentials.password,
        }
    }
}

impl Default for SessionSection {
    fn default() -> Self {
        let defaults = SessionConfig::default();
        Self {
            watchdog_interval_secs: defaults.watchdog_interval.as_secs(),
            reply_timeout_secs: defaults.reply_timeout.as_secs(),
        }
    }
}

impl Default for DiscoverySection {
    fn default() -> Self {
        let defaults = DiscoveryConfig::default();
        Self {
            announce_timeout_secs: defaults.announce_timeout.as_secs(),
            reply_timeout_secs: defaults.reply_timeout.as_secs(),
            probe_timeout_secs: defaults.probe_timeout.as_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "tasmobridged=info,tasmobridge_app=info,tasmobridge_adapter_mqtt=info,tasmobridge_adapter_virtual=info"
                .to_string(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parse failure.
    #[error("failed to parse config file")]
    Parse(#[from] toml::de::Error),
    /// File I/O failure.
    #[error("failed to read config file")]
    Io(#[from] std::io::Error),
    /// Semantic validation failure.
    #[error("invalid configuration: {0}")]
    Validation(String),
    /// A configured device record is unusable.
    #[error("invalid device {id}")]
    Device {
        id: DeviceId,
        #[source]
        source: ValidationError,
    },
}
