//! Runtime ports: what the host exposes to the engine.
//!
//! The host owns device identity, persisted settings, capability values and
//! availability. Sessions and discovery only see these traits, injected at
//! construction.

use std::future::Future;
use std::sync::Arc;

use tasmobridge_domain::availability::UnavailableReason;
use tasmobridge_domain::capability::{Capability, CapabilityValue};
use tasmobridge_domain::error::BridgeError;
use tasmobridge_domain::id::DeviceId;
use tasmobridge_domain::settings::DeviceSettings;
use tasmobridge_domain::trigger::Trigger;

/// The host's view of one device.
pub trait DeviceRuntime: Send + Sync + 'static {
    /// Store a new capability value.
    fn set_capability_value(
        &self,
        capability: Capability,
        value: CapabilityValue,
    ) -> impl Future<Output = Result<(), BridgeError>> + Send;

    /// Fire an edge-triggered notification.
    fn trigger(&self, trigger: Trigger) -> impl Future<Output = Result<(), BridgeError>> + Send;

    /// Mark the device available.
    fn set_available(&self) -> impl Future<Output = Result<(), BridgeError>> + Send;

    /// Mark the device unavailable.
    fn set_unavailable(
        &self,
        reason: UnavailableReason,
    ) -> impl Future<Output = Result<(), BridgeError>> + Send;

    /// Replace the stored settings with values reported by the device.
    fn sync_settings(
        &self,
        settings: DeviceSettings,
    ) -> impl Future<Output = Result<(), BridgeError>> + Send;
}

impl<T: DeviceRuntime> DeviceRuntime for Arc<T> {
    fn set_capability_value(
        &self,
        capability: Capability,
        value: CapabilityValue,
    ) -> impl Future<Output = Result<(), BridgeError>> + Send {
        (**self).set_capability_value(capability, value)
    }

    fn trigger(&self, trigger: Trigger) -> impl Future<Output = Result<(), BridgeError>> + Send {
        (**self).trigger(trigger)
    }

    fn set_available(&self) -> impl Future<Output = Result<(), BridgeError>> + Send {
        (**self).set_available()
    }

    fn set_unavailable(
        &self,
        reason: UnavailableReason,
    ) -> impl Future<Output = Result<(), BridgeError>> + Send {
        (**self).set_unavailable(reason)
    }

    fn sync_settings(
        &self,
        settings: DeviceSettings,
    ) -> impl Future<Output = Result<(), BridgeError>> + Send {
        (**self).sync_settings(settings)
    }
}

/// The host's view of all paired devices, used during discovery.
pub trait DriverRuntime: Send + Sync {
    /// Whether a device with this id is already paired.
    fn is_paired(&self, id: &DeviceId) -> bool;
}
