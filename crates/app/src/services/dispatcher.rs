//! Command dispatcher: capability writes to device commands.
//!
//! Every write translates into exactly one outbound command on the device's
//! topic. Translation is pure; sending is the session's job.

use std::fmt;

use tasmobridge_domain::capability::{Capability, CapabilityValue, SwitchIndex};
use tasmobridge_domain::error::ValidationError;

/// One command to publish on a device topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundCommand {
    pub command: String,
    /// `None` sends an empty payload.
    pub payload: Option<String>,
}

impl OutboundCommand {
    fn new(command: impl Into<String>, payload: Option<String>) -> Self {
        Self {
            command: command.into(),
            payload,
        }
    }
}

impl fmt::Display for OutboundCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            Some(payload) => write!(f, "{} {payload}", self.command),
            None => f.write_str(&self.command),
        }
    }
}

/// A write request against one capability, or a shutter stop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CapabilityWrite {
    Switch { index: SwitchIndex, on: bool },
    /// Target position in `[0, 1]`; values outside are clamped by the command split.
    Position(f64),
    Stop,
}

impl CapabilityWrite {
    /// Build a write from a capability and the value the host wants.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::UnknownCapability`] when the value type does
    /// not fit the capability.
    pub fn from_value(
        capability: Capability,
        value: CapabilityValue,
    ) -> Result<Self, ValidationError> {
        match (capability, value) {
            (Capability::OnOff(index), CapabilityValue::Bool(on)) => Ok(Self::Switch { index, on }),
            (Capability::Position, CapabilityValue::Position(position)) => {
                Ok(Self::Position(position))
            }
            _ => Err(ValidationError::UnknownCapability(format!(
                "{capability}={value}"
            ))),
        }
    }

    /// The capability the write targets. A stop acts on `position`.
    #[must_use]
    pub fn capability(self) -> Capability {
        match self {
            Self::Switch { index, .. } => Capability::OnOff(index),
            Self::Position(_) | Self::Stop => Capability::Position,
        }
    }

    /// The value the host holds once the write is accepted, if any.
    #[must_use]
    pub fn resulting_value(self) -> Option<CapabilityValue> {
        match self {
            Self::Switch { on, .. } => Some(CapabilityValue::Bool(on)),
            Self::Position(position) => Some(CapabilityValue::Position(position.clamp(0.0, 1.0))),
            Self::Stop => None,
        }
    }
}

/// Translate a write into the controller's command.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidPosition`] for a NaN position.
pub fn translate(write: CapabilityWrite) -> Result<OutboundCommand, ValidationError> {
    let command = match write {
        CapabilityWrite::Switch { index, on } => OutboundCommand::new(
            format!("power{index}"),
            Some(if on { "on" } else { "off" }.to_string()),
        ),
        CapabilityWrite::Position(position) if position.is_nan() => {
            return Err(ValidationError::InvalidPosition(position));
        }
        CapabilityWrite::Position(position) if position <= 0.0 => {
            OutboundCommand::new("shutterclose", None)
        }
        CapabilityWrite::Position(position) if position >= 1.0 => {
            OutboundCommand::new("shutteropen", None)
        }
        CapabilityWrite::Position(position) => {
            // strictly between 0 and 1, so the percentage fits in 0..=100
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let percent = (position * 100.0).round() as u8;
            OutboundCommand::new("shutterposition", Some(percent.to_string()))
        }
        CapabilityWrite::Stop => OutboundCommand::new("shutterstop", None),
    };
    Ok(command)
}

/// Per-switch and shutter actions a host can run from automations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowAction {
    SwitchOn(SwitchIndex),
    SwitchOff(SwitchIndex),
    SwitchToggle(SwitchIndex),
    ShutterOpen,
    ShutterStop,
    ShutterClose,
}

impl FlowAction {
    /// Resolve the action into a write. A toggle flips the current value;
    /// an unknown current value counts as off.
    pub fn resolve(self, current: impl FnOnce(SwitchIndex) -> Option<bool>) -> CapabilityWrite {
        match self {
            Self::SwitchOn(index) => CapabilityWrite::Switch { index, on: true },
            Self::SwitchOff(index) => CapabilityWrite::Switch { index, on: false },
            Self::SwitchToggle(index) => CapabilityWrite::Switch {
                index,
                on: !current(index).unwrap_or(false),
            },
            Self::ShutterOpen => CapabilityWrite::Position(1.0),
            Self::ShutterClose => CapabilityWrite::Position(0.0),
            Self::ShutterStop => CapabilityWrite::Stop,
        }
    }
}

impl fmt::Display for FlowAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SwitchOn(index) => write!(f, "switch-{index}-on"),
            Self::SwitchOff(index) => write!(f, "switch-{index}-off"),
            Self::SwitchToggle(index) => write!(f, "switch-{index}-toggle"),
            Self::ShutterOpen => f.write_str("shutter-open"),
            Self::ShutterStop => f.write_str("shutter-stop"),
            Self::ShutterClose => f.write_str("shutter-close"),
        }
    }
}

impl std::str::FromStr for FlowAction {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unknown = || ValidationError::UnknownCapability(s.to_string());
        match s {
            "shutter-open" => return Ok(Self::ShutterOpen),
            "shutter-stop" => return Ok(Self::ShutterStop),
            "shutter-close" => return Ok(Self::ShutterClose),
            _ => {}
        }
        let rest = s.strip_prefix("switch-").ok_or_else(unknown)?;
        let (number, verb) = rest.split_once('-').ok_or_else(unknown)?;
        let index = SwitchIndex::new(number.parse().map_err(|_| unknown())?)?;
        match verb {
            "on" => Ok(Self::SwitchOn(index)),
            "off" => Ok(Self::SwitchOff(index)),
            "toggle" => Ok(Self::SwitchToggle(index)),
            _ => Err(unknown()),
        }
    }
}
