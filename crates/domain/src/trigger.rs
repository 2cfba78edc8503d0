//! Edge-triggered notifications raised towards the host.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::capability::SwitchIndex;

/// A discrete notification emitted when a capability value changes edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Trigger {
    SwitchOn { switch: SwitchIndex },
    SwitchOff { switch: SwitchIndex },
    ShutterOpened,
    ShutterClosed,
}

impl Trigger {
    /// The switch trigger for a new boolean value.
    #[must_use]
    pub fn switch(switch: SwitchIndex, on: bool) -> Self {
        if on {
            Self::SwitchOn { switch }
        } else {
            Self::SwitchOff { switch }
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SwitchOn { switch } => write!(f, "switch-{switch}-on"),
            Self::SwitchOff { switch } => write!(f, "switch-{switch}-off"),
            Self::ShutterOpened => f.write_str("shutter-opened"),
            Self::ShutterClosed => f.write_str("shutter-closed"),
        }
    }
}
