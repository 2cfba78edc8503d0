//! In-memory host: the daemon's side of the runtime ports.
//!
//! Every call a session makes on its device is turned into a domain
//! [`Event`] on the in-process bus, where the daemon logs it.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use tasmobridge_app::event_bus::InProcessEventBus;
use tasmobridge_app::ports::{DeviceRuntime, DriverRuntime, EventPublisher};
use tasmobridge_domain::availability::UnavailableReason;
use tasmobridge_domain::capability::{Capability, CapabilityValue};
use tasmobridge_domain::device::DeviceRecord;
use tasmobridge_domain::error::BridgeError;
use tasmobridge_domain::event::{Event, EventKind};
use tasmobridge_domain::id::DeviceId;
use tasmobridge_domain::settings::DeviceSettings;
use tasmobridge_domain::trigger::Trigger;

/// Host runtime for one device.
pub struct HostDevice {
    id: DeviceId,
    bus: Arc<InProcessEventBus>,
}

impl HostDevice {
    pub fn new(id: DeviceId, bus: Arc<InProcessEventBus>) -> Self {
        Self { id, bus }
    }

    fn publish(&self, kind: EventKind) -> impl Future<Output = Result<(), BridgeError>> + Send {
        self.bus.publish(Event::new(self.id.clone(), kind))
    }
}

impl DeviceRuntime for HostDevice {
    fn set_capability_value(
        &self,
        capability: Capability,
        value: CapabilityValue,
    ) -> impl Future<Output = Result<(), BridgeError>> + Send {
        self.publish(EventKind::CapabilityChanged { capability, value })
    }

    fn trigger(&self, trigger: Trigger) -> impl Future<Output = Result<(), BridgeError>> + Send {
        self.publish(EventKind::Triggered { trigger })
    }

    fn set_available(&self) -> impl Future<Output = Result<(), BridgeError>> + Send {
        self.publish(EventKind::Available)
    }

    fn set_unavailable(
        &self,
        reason: UnavailableReason,
    ) -> impl Future<Output = Result<(), BridgeError>> + Send {
        self.publish(EventKind::Unavailable { reason })
    }

    fn sync_settings(
        &self,
        settings: DeviceSettings,
    ) -> impl Future<Output = Result<(), BridgeError>> + Send {
        self.publish(EventKind::SettingsSynced { settings })
    }
}

/// Devices listed in the configuration, consulted when pairing.
pub struct ConfiguredDevices(HashSet<DeviceId>);

impl ConfiguredDevices {
    pub fn new(records: &[DeviceRecord]) -> Self {
        Self(records.iter().map(|record| record.id.clone()).collect())
    }
}

impl DriverRuntime for ConfiguredDevices {
    fn is_paired(&self, id: &DeviceId) -> bool {
        self.0.contains(id)
    }
}

/// Log every event published on `bus` until the bus goes away.
pub fn spawn_event_log(bus: &InProcessEventBus) -> tokio::task::JoinHandle<()> {
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event log fell behind");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(event: &Event) {
    let device_id = &event.device_id;
    match &event.kind {
        EventKind::CapabilityChanged { capability, value } => {
            tracing::info!(%device_id, %capability, ?value, "capability changed");
        }
        EventKind::Triggered { trigger } => {
            tracing::info!(%device_id, ?trigger, "trigger fired");
        }
        EventKind::Available => tracing::info!(%device_id, "device available"),
        EventKind::Unavailable { reason } => {
            tracing::warn!(%device_id, %reason, "device unavailable");
        }
        EventKind::SettingsSynced { settings } => {
            tracing::info!(
                %device_id,
                topic = %settings.topic,
                power_on_state = %settings.power_on_state,
                led_state = %settings.led_state,
                "settings reported by device"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tasmobridge_domain::capability::SwitchIndex;
    use tasmobridge_domain::device::DeviceClass;

    fn device_id() -> DeviceId {
        DeviceId::from_mac("A4:CF:12:0B:3E:7D").unwrap()
    }

    #[tokio::test]
    async fn should_publish_runtime_calls_as_events() {
        let bus = Arc::new(InProcessEventBus::new(16));
        let mut events = bus.subscribe();
        let host = HostDevice::new(device_id(), Arc::clone(&bus));
        let switch = SwitchIndex::new(2).unwrap();

        host.set_capability_value(Capability::OnOff(switch), CapabilityValue::Bool(true))
            .await
            .unwrap();
        host.trigger(Trigger::switch(switch, true)).await.unwrap();
        host.set_unavailable(UnavailableReason::ConnectionLost)
            .await
            .unwrap();

        let first = events.recv().await.unwrap();
        assert_eq!(first.device_id, device_id());
        assert_eq!(
            first.kind,
            EventKind::CapabilityChanged {
                capability: Capability::OnOff(switch),
                value: CapabilityValue::Bool(true),
            }
        );
        assert_eq!(
            events.recv().await.unwrap().kind,
            EventKind::Triggered {
                trigger: Trigger::switch(switch, true)
            }
        );
        assert_eq!(
            events.recv().await.unwrap().kind,
            EventKind::Unavailable {
                reason: UnavailableReason::ConnectionLost
            }
        );
    }

    #[test]
    fn should_know_configured_devices() {
        let mut settings = DeviceSettings::default();
        settings.topic = "kitchen".to_string();
        let record = DeviceRecord::builder(device_id(), DeviceClass::Shutter)
            .capability(Capability::Position)
            .settings(settings)
            .build()
            .unwrap();

        let configured = ConfiguredDevices::new(&[record]);

        assert!(configured.is_paired(&device_id()));
        assert!(!configured.is_paired(&DeviceId::from_mac("02:00:00:00:00:01").unwrap()));
    }
}
