//! Virtual device configuration.

use serde::Deserialize;

/// One simulated controller.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct VirtualDeviceConfig {
    /// Device topic the controller listens and reports on.
    pub topic: String,
    /// Hardware address reported in the network status.
    pub mac: String,
    /// Module name announced at startup.
    pub module: String,
    /// Firmware version announced at startup.
    pub version: String,
    /// Number of relays, 0 to 4.
    pub relays: u8,
    /// Whether the relays drive a shutter.
    pub shutter: bool,
    /// Initial `PowerOnState`.
    pub power_on_state: String,
    /// Initial `LedState`.
    pub led_state: String,
}

impl Default for VirtualDeviceConfig {
    fn default() -> Self {
        Self {
            topic: "tasmota_virtual".to_string(),
            mac: "02:00:00:00:00:01".to_string(),
            module: "Generic".to_string(),
            version: "14.0.0(virtual)".to_string(),
            relays: 1,
            shutter: false,
            power_on_state: "3".to_string(),
            led_state: "1".to_string(),
        }
    }
}
