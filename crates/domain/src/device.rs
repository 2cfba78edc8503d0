//! Device: a paired relay or shutter controller and the record the host keeps for it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::capability::Capability;
use crate::error::ValidationError;
use crate::id::DeviceId;
use crate::settings::DeviceSettings;

/// How a device is handled, derived from its capabilities at pairing time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceClass {
    /// One to four independent relays (`onoff.1`..`onoff.4`).
    SwitchBank,
    /// A single blind (`position`).
    Shutter,
}

impl DeviceClass {
    /// Wire name of the class.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SwitchBank => "switch-bank",
            Self::Shutter => "shutter",
        }
    }

    /// Whether a device of this class may carry `capability`.
    #[must_use]
    pub fn allows(self, capability: Capability) -> bool {
        match self {
            Self::SwitchBank => matches!(capability, Capability::OnOff(_)),
            Self::Shutter => matches!(capability, Capability::Position),
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields recorded at pairing time and never edited afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DeviceStore {
    pub module: String,
    pub firmware_version: String,
}

/// The record the host persists for a paired device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DeviceRecord {
    pub id: DeviceId,
    pub name: String,
    pub class: DeviceClass,
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub store: DeviceStore,
    #[serde(default)]
    pub settings: DeviceSettings,
}

impl DeviceRecord {
    /// Start building a record for the device with the given id.
    #[must_use]
    pub fn builder(id: DeviceId, class: DeviceClass) -> DeviceRecordBuilder {
        DeviceRecordBuilder {
            id,
            class,
            name: None,
            capabilities: Vec::new(),
            store: DeviceStore::default(),
            settings: DeviceSettings::default(),
        }
    }

    /// The topic the device is addressed by.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.settings.topic
    }

    /// Whether the record lists `capability`.
    #[must_use]
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Check the record's invariants.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] when the capability set is empty or does
    /// not fit the class, or when the topic or broker host is empty.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.capabilities.is_empty() {
            return Err(ValidationError::NoCapabilities);
        }
        if let Some(capability) = self
            .capabilities
            .iter()
            .find(|capability| !self.class.allows(**capability))
        {
            return Err(ValidationError::CapabilityNotAllowed {
                capability: capability.to_string(),
                class: self.class.as_str(),
            });
        }
        if self.settings.topic.trim().is_empty() {
            return Err(ValidationError::EmptyTopic);
        }
        self.settings.broker.validate()
    }
}

/// Builder for [`DeviceRecord`]; `build` validates.
#[derive(Debug)]
pub struct DeviceRecordBuilder {
    id: DeviceId,
    class: DeviceClass,
    name: Option<String>,
    capabilities: Vec<Capability>,
    store: DeviceStore,
    settings: DeviceSettings,
}

impl DeviceRecordBuilder {
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn capability(mut self, capability: Capability) -> Self {
        if !self.capabilities.contains(&capability) {
            self.capabilities.push(capability);
        }
        self
    }

    #[must_use]
    pub fn capabilities(self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        capabilities.into_iter().fold(self, Self::capability)
    }

    #[must_use]
    pub fn store(mut self, store: DeviceStore) -> Self {
        self.store = store;
        self
    }

    #[must_use]
    pub fn settings(mut self, settings: DeviceSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Finish the record. The name defaults to the topic.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] if the record violates an invariant.
    pub fn build(self) -> Result<DeviceRecord, ValidationError> {
        let record = DeviceRecord {
            name: self.name.unwrap_or_else(|| self.settings.topic.clone()),
            id: self.id,
            class: self.class,
            capabilities: self.capabilities,
            store: self.store,
            settings: self.settings,
        };
        record.validate()?;
        Ok(record)
    }
}
