//! Capabilities: the controllable/observable attributes of a device.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Switch number on a switch bank, 1 to 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct SwitchIndex(u8);

impl SwitchIndex {
    /// Highest switch number a controller can expose.
    pub const MAX: u8 = 4;

    /// Validate a switch number.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::SwitchIndexOutOfRange`] outside `1..=4`.
    pub fn new(number: u8) -> Result<Self, ValidationError> {
        if (1..=Self::MAX).contains(&number) {
            Ok(Self(number))
        } else {
            Err(ValidationError::SwitchIndexOutOfRange(number))
        }
    }

    /// All switch numbers in probe order.
    pub fn all() -> impl Iterator<Item = Self> {
        (1..=Self::MAX).map(Self)
    }

    /// The switch number.
    #[must_use]
    pub fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for SwitchIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl TryFrom<u8> for SwitchIndex {
    type Error = ValidationError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SwitchIndex> for u8 {
    fn from(index: SwitchIndex) -> Self {
        index.0
    }
}

/// A capability identifier: `onoff.<n>` or `position`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Capability {
    /// On/off state of one switch.
    OnOff(SwitchIndex),
    /// Blind position in `[0, 1]`, 1 being fully open.
    Position,
}

impl Capability {
    /// The switch index for an on/off capability.
    #[must_use]
    pub fn switch_index(self) -> Option<SwitchIndex> {
        match self {
            Self::OnOff(index) => Some(index),
            Self::Position => None,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OnOff(index) => write!(f, "onoff.{index}"),
            Self::Position => f.write_str("position"),
        }
    }
}

impl FromStr for Capability {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "position" {
            return Ok(Self::Position);
        }
        let number = s
            .strip_prefix("onoff.")
            .and_then(|n| n.parse::<u8>().ok())
            .ok_or_else(|| ValidationError::UnknownCapability(s.to_string()))?;
        SwitchIndex::new(number).map(Self::OnOff)
    }
}

impl TryFrom<String> for Capability {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Capability> for String {
    fn from(capability: Capability) -> Self {
        capability.to_string()
    }
}

/// Last known value of a capability.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CapabilityValue {
    Bool(bool),
    Position(f64),
}

impl CapabilityValue {
    /// The boolean value, if this is an on/off value.
    #[must_use]
    pub fn as_bool(self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(value),
            Self::Position(_) => None,
        }
    }

    /// The position, if this is a position value.
    #[must_use]
    pub fn as_position(self) -> Option<f64> {
        match self {
            Self::Position(value) => Some(value),
            Self::Bool(_) => None,
        }
    }
}

impl fmt::Display for CapabilityValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(value) => value.fmt(f),
            Self::Position(value) => value.fmt(f),
        }
    }
}
