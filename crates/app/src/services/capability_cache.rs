//! Last known value per capability, and the edge detection built on it.

use std::collections::HashMap;

use tasmobridge_domain::capability::{Capability, CapabilityValue, SwitchIndex};
use tasmobridge_domain::trigger::Trigger;

use super::router::Observation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Opened,
    Closed,
}

/// Outcome of applying one observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Applied {
    pub capability: Capability,
    /// The new value, when it differs from the cached one.
    pub changed: Option<CapabilityValue>,
    pub trigger: Option<Trigger>,
}

/// Per-session capability cache.
#[derive(Debug, Default)]
pub struct CapabilityCache {
    values: HashMap<Capability, CapabilityValue>,
    endpoint: Option<Endpoint>,
}

impl CapabilityCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, capability: Capability) -> Option<CapabilityValue> {
        self.values.get(&capability).copied()
    }

    #[must_use]
    pub fn switch(&self, index: SwitchIndex) -> Option<bool> {
        self.get(Capability::OnOff(index))
            .and_then(CapabilityValue::as_bool)
    }

    /// Seed a value without treating it as a change.
    pub fn seed(&mut self, capability: Capability, value: CapabilityValue) {
        self.store(capability, value);
        if let Some(position) = value.as_position() {
            self.endpoint = endpoint_of(position);
        }
    }

    /// Record a value the host wrote. Emits nothing.
    pub fn store(&mut self, capability: Capability, value: CapabilityValue) {
        self.values.insert(capability, value);
    }

    /// Apply a reported value and work out what the host must be told.
    ///
    /// A switch triggers on every flip, including its first report. A shutter
    /// triggers when it settles at 1 or 0 and was not already settled there.
    pub fn apply(&mut self, observation: Observation) -> Applied {
        let capability = observation.capability();
        let (value, trigger) = match observation {
            Observation::Switch { index, on } => {
                let value = CapabilityValue::Bool(on);
                let trigger =
                    (self.get(capability) != Some(value)).then(|| Trigger::switch(index, on));
                (value, trigger)
            }
            Observation::Position { position, settled } => {
                (CapabilityValue::Position(position), self.shutter_edge(position, settled))
            }
        };
        let changed = (self.values.insert(capability, value) != Some(value)).then_some(value);
        Applied {
            capability,
            changed,
            trigger,
        }
    }

    fn shutter_edge(&mut self, position: f64, settled: bool) -> Option<Trigger> {
        let Some(endpoint) = endpoint_of(position) else {
            self.endpoint = None;
            return None;
        };
        if !settled || self.endpoint == Some(endpoint) {
            return None;
        }
        self.endpoint = Some(endpoint);
        Some(match endpoint {
            Endpoint::Opened => Trigger::ShutterOpened,
            Endpoint::Closed => Trigger::ShutterClosed,
        })
    }
}

#[allow(clippy::float_cmp)]
fn endpoint_of(position: f64) -> Option<Endpoint> {
    if position == 1.0 {
        Some(Endpoint::Opened)
    } else if position == 0.0 {
        Some(Endpoint::Closed)
    } else {
        None
    }
}
