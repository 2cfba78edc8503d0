//! Discovery: pair a device that announces itself on the broker.
//!
//! A [`PairingSession`] opens its own connection with the credentials the
//! user entered (no retries, so bad credentials fail the pairing), waits for
//! the next device announcement, identifies the device by its hardware
//! address and probes which capabilities it actually has.

use std::time::Duration;

use tasmobridge_domain::capability::{Capability, SwitchIndex};
use tasmobridge_domain::credentials::BrokerCredentials;
use tasmobridge_domain::device::{DeviceClass, DeviceRecord, DeviceStore};
use tasmobridge_domain::error::{BridgeError, TimeoutError, ValidationError};
use tasmobridge_domain::id::DeviceId;
use tasmobridge_domain::settings::DeviceSettings;

use crate::ports::{Broker, BrokerConnection, DriverRuntime, ProbeChannel, RetryPolicy};
use crate::tasmota::{Announcement, hardware_address};

/// Bounds on each discovery step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// How long to wait for a device to announce itself.
    pub announce_timeout: Duration,
    /// Bound on the network status query.
    pub reply_timeout: Duration,
    /// Bound on one capability probe; silence means "not present".
    pub probe_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            announce_timeout: Duration::from_secs(120),
            reply_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(3),
        }
    }
}

/// What pairing found.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryOutcome {
    /// A new device, ready to be persisted by the host.
    Discovered(DeviceRecord),
    /// The announcing device is already paired.
    AlreadyPaired(DeviceId),
    /// The device exposes neither a shutter nor any relay.
    Unsupported(DeviceId),
}

impl DiscoveryOutcome {
    /// The records to offer the user; empty unless a new device was found.
    #[must_use]
    pub fn into_records(self) -> Vec<DeviceRecord> {
        match self {
            Self::Discovered(record) => vec![record],
            Self::AlreadyPaired(_) | Self::Unsupported(_) => Vec::new(),
        }
    }
}

/// Pick the device class from the probed capabilities.
///
/// A shutter wins over its relays; otherwise any relay makes a switch bank.
#[must_use]
pub fn classify(supported: &[Capability]) -> Option<(DeviceClass, Vec<Capability>)> {
    if supported.contains(&Capability::Position) {
        return Some((DeviceClass::Shutter, vec![Capability::Position]));
    }
    let switches: Vec<Capability> = supported
        .iter()
        .copied()
        .filter(|capability| capability.switch_index().is_some())
        .collect();
    (!switches.is_empty()).then_some((DeviceClass::SwitchBank, switches))
}

/// One pairing attempt over a dedicated connection.
pub struct PairingSession<B: Broker, D> {
    connection: B::Connection,
    credentials: BrokerCredentials,
    driver: D,
    config: DiscoveryConfig,
}

impl<B: Broker, D: DriverRuntime> PairingSession<B, D> {
    /// Connect with the credentials entered for pairing.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::Validation`] if the credentials have no host.
    /// - [`BridgeError::Connection`] on the first connection failure.
    #[tracing::instrument(
        skip(broker, driver, config),
        fields(host = %credentials.host, port = credentials.port)
    )]
    pub async fn connect(
        broker: &B,
        credentials: BrokerCredentials,
        driver: D,
        config: DiscoveryConfig,
    ) -> Result<Self, BridgeError> {
        credentials.validate()?;
        let connection = broker.connect(&credentials, RetryPolicy::FailFast).await?;
        tracing::info!("pairing connection established");
        Ok(Self {
            connection,
            credentials,
            driver,
            config,
        })
    }

    /// Wait for the next device to announce itself and describe it.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::Timeout`] if no device announces itself, or it does
    ///   not answer the network status query in time.
    /// - [`BridgeError::Validation`] if the device reports no usable hardware address.
    /// - [`BridgeError::Connection`] if the connection drops.
    #[tracing::instrument(skip(self))]
    pub async fn next_device(&self) -> Result<DiscoveryOutcome, BridgeError> {
        let probe = self.connection.register_any_device()?;
        let outcome = self.identify(&probe).await;
        probe.unregister();
        outcome
    }

    /// Close the pairing connection.
    pub async fn close(self) {
        self.connection.close().await;
        tracing::debug!("pairing connection closed");
    }

    async fn identify(
        &self,
        probe: &<B::Connection as BrokerConnection>::Probe,
    ) -> Result<DiscoveryOutcome, BridgeError> {
        let announcement =
            tokio::time::timeout(self.config.announce_timeout, probe.await_announcement())
                .await
                .map_err(|_| TimeoutError {
                    correlation: "info1".to_string(),
                    after: self.config.announce_timeout,
                })??;
        tracing::info!(
            topic = %announcement.topic,
            module = %announcement.module,
            "device announced itself"
        );

        let network = tokio::time::timeout(self.config.reply_timeout, probe.query_network_status())
            .await
            .map_err(|_| TimeoutError {
                correlation: "status5".to_string(),
                after: self.config.reply_timeout,
            })??;
        let mac = hardware_address(&network)
            .ok_or_else(|| ValidationError::InvalidMac(String::new()))?;
        let id = DeviceId::from_mac(mac)?;

        if self.driver.is_paired(&id) {
            tracing::info!(device_id = %id, "device already paired");
            return Ok(DiscoveryOutcome::AlreadyPaired(id));
        }

        let mut supported = Vec::new();
        let candidates = SwitchIndex::all()
            .map(Capability::OnOff)
            .chain(std::iter::once(Capability::Position));
        for capability in candidates {
            if self.probe_capability(probe, capability).await? {
                supported.push(capability);
            }
        }

        let Some((class, capabilities)) = classify(&supported) else {
            tracing::warn!(device_id = %id, "device has no supported capability");
            return Ok(DiscoveryOutcome::Unsupported(id));
        };
        let record = self.record(id, class, capabilities, announcement)?;
        tracing::info!(
            device_id = %record.id,
            class = %record.class,
            capabilities = record.capabilities.len(),
            "device discovered"
        );
        Ok(DiscoveryOutcome::Discovered(record))
    }

    /// A probe that stays unanswered means the capability is absent.
    async fn probe_capability(
        &self,
        probe: &<B::Connection as BrokerConnection>::Probe,
        capability: Capability,
    ) -> Result<bool, BridgeError> {
        match tokio::time::timeout(self.config.probe_timeout, probe.probe(capability)).await {
            Ok(supported) => {
                let supported = supported?;
                tracing::debug!(%capability, supported, "capability probed");
                Ok(supported)
            }
            Err(_) => {
                tracing::debug!(%capability, "capability probe unanswered");
                Ok(false)
            }
        }
    }

    fn record(
        &self,
        id: DeviceId,
        class: DeviceClass,
        capabilities: Vec<Capability>,
        announcement: Announcement,
    ) -> Result<DeviceRecord, ValidationError> {
        DeviceRecord::builder(id, class)
            .name(announcement.topic.clone())
            .capabilities(capabilities)
            .store(DeviceStore {
                module: announcement.module,
                firmware_version: announcement.version,
            })
            .settings(DeviceSettings {
                topic: announcement.topic,
                fallback_topic: announcement.fallback_topic,
                group_topic: announcement.group_topic,
                broker: self.credentials.clone(),
                ..DeviceSettings::default()
            })
            .build()
    }
}
