//! Process-wide registry of live device sessions.
//!
//! Sessions insert themselves when started and remove themselves when
//! deleted. Message handling never touches the registry; it exists so that
//! external tooling can list what is running and discovery can tell whether
//! a device is already paired.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::watch;

use tasmobridge_domain::device::DeviceClass;
use tasmobridge_domain::id::DeviceId;

use crate::ports::DriverRuntime;
use crate::services::session::SessionState;

/// A registry entry, kept by [`DeviceRegistry`] for one live session.
#[derive(Debug, Clone)]
pub struct RegisteredDevice {
    pub id: DeviceId,
    pub name: String,
    pub class: DeviceClass,
    pub topic: String,
    pub state: watch::Receiver<SessionState>,
}

/// Point-in-time view of a registered device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceEntry {
    pub id: DeviceId,
    pub name: String,
    pub class: DeviceClass,
    pub topic: String,
    pub state: SessionState,
}

/// Shared, cloneable registry of live sessions.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: Arc<RwLock<HashMap<DeviceId, RegisteredDevice>>>,
}

impl DeviceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the entry for `device.id`.
    pub fn insert(&self, device: RegisteredDevice) {
        tracing::debug!(device_id = %device.id, topic = %device.topic, "registering device");
        self.devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device.id.clone(), device);
    }

    /// Remove the entry for `id`. Returns whether one was present.
    pub fn remove(&self, id: &DeviceId) -> bool {
        tracing::debug!(device_id = %id, "unregistering device");
        self.devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some()
    }

    #[must_use]
    pub fn contains(&self, id: &DeviceId) -> bool {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every registered device, ordered by id.
    #[must_use]
    pub fn list(&self) -> Vec<DeviceEntry> {
        let devices = self.devices.read().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<DeviceEntry> = devices
            .values()
            .map(|device| DeviceEntry {
                id: device.id.clone(),
                name: device.name.clone(),
                class: device.class,
                topic: device.topic.clone(),
                state: *device.state.borrow(),
            })
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }
}

impl DriverRuntime for DeviceRegistry {
    fn is_paired(&self, id: &DeviceId) -> bool {
        self.contains(id)
    }
}
