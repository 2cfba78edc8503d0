//! Event: an immutable record of something the host was told about a device.

use serde::{Deserialize, Serialize};

use crate::availability::UnavailableReason;
use crate::capability::{Capability, CapabilityValue};
use crate::id::{DeviceId, EventId};
use crate::settings::DeviceSettings;
use crate::time::{Timestamp, now};
use crate::trigger::Trigger;

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    CapabilityChanged {
        capability: Capability,
        value: CapabilityValue,
    },
    Triggered {
        trigger: Trigger,
    },
    Available,
    Unavailable {
        reason: UnavailableReason,
    },
    SettingsSynced {
        settings: DeviceSettings,
    },
}

/// A timestamped event for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub device_id: DeviceId,
    pub timestamp: Timestamp,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    /// Create an event stamped with the current time.
    #[must_use]
    pub fn new(device_id: DeviceId, kind: EventKind) -> Self {
        Self {
            id: EventId::new(),
            device_id,
            timestamp: now(),
            kind,
        }
    }
}
