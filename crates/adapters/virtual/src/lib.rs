//! # tasmobridge-adapter-virtual
//!
//! Virtual broker that hosts simulated Tasmota controllers in-process, for
//! demos and end-to-end tests without a real MQTT broker.
//!
//! ## Provided devices
//!
//! | Config | Behaviour |
//! |--------|-----------|
//! | `relays = 1..4` | Switch bank answering `POWER<n>`, `STATUS`, settings |
//! | `shutter = true` | Shutter answering `ShutterOpen`/`Close`/`Position`/`Stop` |
//!
//! Every connection opened on the broker sees the same devices. Registering
//! a discovery probe makes the next device (round robin) announce itself.
//!
//! ## Dependency rule
//!
//! Depends on `tasmobridge-app` (ports, hub) and `tasmobridge-domain` only.

pub mod config;
mod devices;
pub mod error;

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use tasmobridge_app::hub::{CommandSink, MessageHub, ProbeHandle, TopicChannel};
use tasmobridge_app::ports::{Broker, BrokerConnection, Payload, RetryPolicy};
use tasmobridge_domain::credentials::BrokerCredentials;
use tasmobridge_domain::error::ConnectionError;

pub use config::VirtualDeviceConfig;
pub use error::VirtualError;

use devices::{Reply, VirtualDevice};

type Devices = Arc<Mutex<Vec<VirtualDevice>>>;
type Outbox = mpsc::UnboundedSender<(String, Vec<Reply>)>;

/// In-process broker with simulated devices.
#[derive(Clone)]
pub struct VirtualBroker {
    devices: Devices,
    password: Option<String>,
    hubs: Arc<Mutex<Vec<MessageHub<VirtualSink>>>>,
    next_announcement: Arc<AtomicUsize>,
}

impl VirtualBroker {
    /// Build the broker from device configurations.
    ///
    /// # Errors
    ///
    /// Returns a [`VirtualError`] if a configuration is invalid or two
    /// devices share a topic.
    pub fn new(configs: &[VirtualDeviceConfig]) -> Result<Self, VirtualError> {
        let mut devices: Vec<VirtualDevice> = Vec::with_capacity(configs.len());
        for config in configs {
            let device = VirtualDevice::from_config(config)?;
            if devices.iter().any(|known| known.topic() == device.topic()) {
                return Err(VirtualError::DuplicateTopic(config.topic.clone()));
            }
            devices.push(device);
        }
        tracing::debug!(count = devices.len(), "virtual devices ready");
        Ok(Self {
            devices: Arc::new(Mutex::new(devices)),
            password: None,
            hubs: Arc::default(),
            next_announcement: Arc::default(),
        })
    }

    /// Only accept logins with this password.
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Topics of every simulated device, in configuration order.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        lock(&self.devices)
            .iter()
            .map(|device| device.topic().to_string())
            .collect()
    }

    /// Current state of one relay.
    #[must_use]
    pub fn relay(&self, topic: &str, index: u8) -> Option<bool> {
        lock(&self.devices)
            .iter()
            .find(|device| device.topic() == topic)
            .and_then(|device| device.relay(index))
    }

    /// Current shutter position in percent.
    #[must_use]
    pub fn position(&self, topic: &str) -> Option<u8> {
        lock(&self.devices)
            .iter()
            .find(|device| device.topic() == topic)
            .and_then(VirtualDevice::position)
    }

    /// Simulate a button press on the device, toggling one relay.
    ///
    /// # Errors
    ///
    /// Returns a [`VirtualError`] for an unknown device or relay.
    pub fn press(&self, topic: &str, index: u8) -> Result<(), VirtualError> {
        let replies = self.with_device(topic, |device| device.press(index))??;
        tracing::debug!(%topic, index, "virtual button pressed");
        self.broadcast(topic, &replies);
        Ok(())
    }

    /// Simulate the device dropping off or coming back (last will).
    ///
    /// # Errors
    ///
    /// Returns [`VirtualError::UnknownDevice`] for an unknown device.
    pub fn set_online(&self, topic: &str, online: bool) -> Result<(), VirtualError> {
        self.with_device(topic, |_| ())?;
        let status = if online { "Online" } else { "Offline" };
        for hub in lock(&self.hubs).iter() {
            hub.deliver(topic, "LWT", Payload::String(status.to_string()));
        }
        Ok(())
    }

    fn with_device<T>(
        &self,
        topic: &str,
        f: impl FnOnce(&mut VirtualDevice) -> T,
    ) -> Result<T, VirtualError> {
        let mut devices = lock(&self.devices);
        let device = devices
            .iter_mut()
            .find(|device| device.topic() == topic)
            .ok_or_else(|| VirtualError::UnknownDevice(topic.to_string()))?;
        Ok(f(device))
    }

    fn broadcast(&self, topic: &str, replies: &[Reply]) {
        for hub in lock(&self.hubs).iter() {
            for (tag, payload) in replies {
                hub.deliver(topic, tag, payload.clone());
            }
        }
    }

    fn open(&self) -> VirtualConnection {
        let (outbox, mut inbox) = mpsc::unbounded_channel::<(String, Vec<Reply>)>();
        let hub = MessageHub::new(VirtualSink {
            devices: Arc::clone(&self.devices),
            outbox,
        });

        let pump = hub.clone();
        tokio::spawn(async move {
            while let Some((topic, replies)) = inbox.recv().await {
                for (tag, payload) in replies {
                    pump.deliver(&topic, tag, payload);
                }
            }
        });

        let mut hubs = lock(&self.hubs);
        hubs.retain(|hub| !hub.is_closed());
        hubs.push(hub.clone());
        VirtualConnection {
            hub,
            broker: self.clone(),
        }
    }

    /// Make the next device announce itself on `hub`.
    fn announce_next(&self, hub: &MessageHub<VirtualSink>) {
        let devices = lock(&self.devices);
        if devices.is_empty() {
            return;
        }
        let index = self.next_announcement.fetch_add(1, Ordering::Relaxed) % devices.len();
        let device = &devices[index];
        let (topic, announcement) = (device.topic().to_string(), device.announcement());
        drop(devices);
        tracing::debug!(%topic, "virtual device announcing itself");
        hub.deliver(&topic, "INFO1", announcement);
    }
}

impl Broker for VirtualBroker {
    type Connection = VirtualConnection;

    fn connect(
        &self,
        credentials: &BrokerCredentials,
        _retry: RetryPolicy,
    ) -> impl Future<Output = Result<VirtualConnection, ConnectionError>> + Send {
        let refused = self
            .password
            .as_ref()
            .is_some_and(|password| *password != credentials.password);
        let result = if refused {
            tracing::warn!(host = %credentials.host, "virtual broker rejected login");
            Err(VirtualError::NotAuthorized.into_connect_error(credentials))
        } else {
            Ok(self.open())
        };
        async move { result }
    }
}

/// A connection on the virtual broker.
#[derive(Clone)]
pub struct VirtualConnection {
    hub: MessageHub<VirtualSink>,
    broker: VirtualBroker,
}

impl BrokerConnection for VirtualConnection {
    type Channel = TopicChannel<VirtualSink>;
    type Probe = ProbeHandle<VirtualSink>;

    fn register_topic(&self, topic: &str) -> Result<Self::Channel, ConnectionError> {
        self.hub.register_topic(topic)
    }

    fn register_any_device(&self) -> Result<Self::Probe, ConnectionError> {
        let probe = self.hub.register_any_device()?;
        self.broker.announce_next(&self.hub);
        Ok(probe)
    }

    fn same_connection(&self, other: &Self) -> bool {
        self.hub.ptr_eq(&other.hub)
    }

    fn close(&self) -> impl Future<Output = ()> + Send {
        self.hub.shutdown();
        async {}
    }
}

/// Hands commands to the simulated devices; their replies come back through the hub.
pub struct VirtualSink {
    devices: Devices,
    outbox: Outbox,
}

impl CommandSink for VirtualSink {
    fn publish(
        &self,
        topic: &str,
        command: &str,
        payload: &str,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send {
        let replies = lock(&self.devices)
            .iter_mut()
            .find(|device| device.topic() == topic)
            .map(|device| device.handle(command, payload));
        let result = match replies {
            Some(replies) => self
                .outbox
                .send((topic.to_string(), replies))
                .map_err(|_| ConnectionError::Closed),
            None => {
                tracing::trace!(%topic, %command, "no virtual device listening");
                Ok(())
            }
        };
        async move { result }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tasmobridge_app::ports::{DeviceChannel, ProbeChannel};
    use tasmobridge_domain::capability::{Capability, SwitchIndex};

    fn broker() -> VirtualBroker {
        VirtualBroker::new(&[
            VirtualDeviceConfig {
                topic: "dual".to_string(),
                mac: "02:00:00:00:00:01".to_string(),
                relays: 2,
                ..VirtualDeviceConfig::default()
            },
            VirtualDeviceConfig {
                topic: "blind".to_string(),
                mac: "02:00:00:00:00:02".to_string(),
                relays: 2,
                shutter: true,
                ..VirtualDeviceConfig::default()
            },
        ])
        .unwrap()
    }

    async fn connect(broker: &VirtualBroker) -> VirtualConnection {
        broker
            .connect(&BrokerCredentials::default(), RetryPolicy::FailFast)
            .await
            .unwrap()
    }

    #[test]
    fn should_reject_duplicate_topics() {
        let config = VirtualDeviceConfig::default();
        let result = VirtualBroker::new(&[config.clone(), config]);
        assert!(matches!(result, Err(VirtualError::DuplicateTopic(_))));
    }

    #[tokio::test]
    async fn should_refuse_wrong_password() {
        let broker = broker().with_password("secret");
        let result = broker
            .connect(&BrokerCredentials::default(), RetryPolicy::Retry)
            .await;
        assert!(matches!(result, Err(ConnectionError::Connect { .. })));
    }

    #[tokio::test]
    async fn should_answer_status_request() {
        let broker = broker();
        let connection = connect(&broker).await;
        let channel = connection.register_topic("dual").unwrap();

        let snapshot = channel.await_initial_status().await.unwrap();

        assert_eq!(snapshot.topic.as_deref(), Some("dual"));
        assert_eq!(snapshot.switch(SwitchIndex::new(1).unwrap()), Some(false));
    }

    #[tokio::test]
    async fn should_switch_relay_and_report_result() {
        let broker = broker();
        let connection = connect(&broker).await;
        let channel = connection.register_topic("dual").unwrap();

        channel.send_command("power2", Some("on")).await.unwrap();

        let message = channel.next_message().await.unwrap();
        assert_eq!(message.command, "result");
        assert_eq!(message.payload, serde_json::json!({"POWER2": "ON"}));
        assert_eq!(broker.relay("dual", 2), Some(true));
    }

    #[tokio::test]
    async fn should_broadcast_button_press_to_every_connection() {
        let broker = broker();
        let first = connect(&broker).await.register_topic("dual").unwrap();
        let second = connect(&broker).await.register_topic("dual").unwrap();

        broker.press("dual", 1).unwrap();

        assert_eq!(first.next_message().await.unwrap().command, "result");
        assert_eq!(second.next_message().await.unwrap().command, "result");
        assert!(broker.press("nope", 1).is_err());
    }

    #[tokio::test]
    async fn should_announce_devices_round_robin_to_probes() {
        let broker = broker();
        let connection = connect(&broker).await;

        let first = connection.register_any_device().unwrap();
        assert_eq!(first.await_announcement().await.unwrap().topic, "dual");
        first.unregister();

        let second = connection.register_any_device().unwrap();
        let announcement = second.await_announcement().await.unwrap();
        assert_eq!(announcement.topic, "blind");
        assert!(second.probe(Capability::Position).await.unwrap());
    }

    #[tokio::test]
    async fn should_signal_offline_device() {
        let broker = broker();
        let connection = connect(&broker).await;
        let channel = connection.register_topic("blind").unwrap();
        let mut link = channel.link_status();

        broker.set_online("blind", false).unwrap();

        link.changed().await.unwrap();
        assert_eq!(*link.borrow(), tasmobridge_app::ports::LinkStatus::Offline);
    }
}
