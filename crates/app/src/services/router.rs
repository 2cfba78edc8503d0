//! Message router: inbound device messages to capability observations.

use tasmobridge_domain::capability::{Capability, SwitchIndex};
use tasmobridge_domain::device::DeviceClass;

use crate::ports::InboundMessage;
use crate::tasmota::{field, parse_percentage, parse_switch_state};

/// A value reported by the device for one capability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observation {
    Switch { index: SwitchIndex, on: bool },
    /// `settled` is set when the reported position equals the reported target.
    Position { position: f64, settled: bool },
}

impl Observation {
    #[must_use]
    pub fn capability(self) -> Capability {
        match self {
            Self::Switch { index, .. } => Capability::OnOff(index),
            Self::Position { .. } => Capability::Position,
        }
    }
}

/// Extract every observation a message carries for a device.
///
/// Unknown tags and capabilities the device does not expose yield nothing.
#[must_use]
pub fn route(
    class: DeviceClass,
    capabilities: &[Capability],
    message: &InboundMessage,
) -> Vec<Observation> {
    let observations = match class {
        DeviceClass::SwitchBank => route_switch_bank(message),
        DeviceClass::Shutter => route_shutter(message),
    };
    observations
        .into_iter()
        .filter(|observation| capabilities.contains(&observation.capability()))
        .collect()
}

fn route_switch_bank(message: &InboundMessage) -> Vec<Observation> {
    match message.command.as_str() {
        "state" | "result" => SwitchIndex::all()
            .filter_map(|index| {
                let value = field(&message.payload, &format!("POWER{index}")).or_else(|| {
                    (index.get() == 1)
                        .then(|| field(&message.payload, "POWER"))
                        .flatten()
                })?;
                let on = parse_switch_state(value)?;
                Some(Observation::Switch { index, on })
            })
            .collect(),
        tag => switch_tag(tag)
            .and_then(|index| {
                let on = parse_switch_state(&message.payload)?;
                Some(Observation::Switch { index, on })
            })
            .into_iter()
            .collect(),
    }
}

/// `power` and `power1`..`power4`.
fn switch_tag(tag: &str) -> Option<SwitchIndex> {
    let number = tag.strip_prefix("power")?;
    if number.is_empty() {
        return SwitchIndex::new(1).ok();
    }
    SwitchIndex::new(number.parse().ok()?).ok()
}

fn route_shutter(message: &InboundMessage) -> Vec<Observation> {
    let observation = match message.command.as_str() {
        "shutter1" => parse_percentage(&message.payload).map(|position| Observation::Position {
            position,
            settled: true,
        }),
        "sensor" | "result" => field(&message.payload, "Shutter1").and_then(|shutter| {
            let position = parse_percentage(field(shutter, "Position")?)?;
            let target = field(shutter, "Target").and_then(parse_percentage);
            Some(Observation::Position {
                position,
                settled: target == Some(position),
            })
        }),
        _ => None,
    };
    observation.into_iter().collect()
}
