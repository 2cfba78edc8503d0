//! User-editable device settings.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::credentials::BrokerCredentials;

/// `PowerOnState 3`: restore the last saved relay state after power loss.
pub const POWER_ON_STATE_SAVED: &str = "3";

/// `LedState 0`: status LED disabled.
pub const LED_STATE_OFF: &str = "0";

/// Settings attached to a device record.
///
/// `power-on-state` and `led-state` are only accepted once the device has
/// confirmed them. Values are kept as the strings the device echoes back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DeviceSettings {
    pub topic: String,
    pub fallback_topic: String,
    pub group_topic: String,
    pub power_on_state: String,
    pub led_state: String,
    pub broker: BrokerCredentials,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            topic: String::new(),
            fallback_topic: String::new(),
            group_topic: String::new(),
            power_on_state: POWER_ON_STATE_SAVED.to_string(),
            led_state: LED_STATE_OFF.to_string(),
            broker: BrokerCredentials::default(),
        }
    }
}

impl DeviceSettings {
    /// Keys whose values differ between `self` and `other`.
    #[must_use]
    pub fn changed_keys(&self, other: &Self) -> Vec<SettingKey> {
        let mut changed = Vec::new();
        if self.broker.host != other.broker.host {
            changed.push(SettingKey::BrokerHost);
        }
        if self.broker.port != other.broker.port {
            changed.push(SettingKey::BrokerPort);
        }
        if self.broker.username != other.broker.username {
            changed.push(SettingKey::BrokerUsername);
        }
        if self.broker.password != other.broker.password {
            changed.push(SettingKey::BrokerPassword);
        }
        if self.topic != other.topic {
            changed.push(SettingKey::Topic);
        }
        if self.fallback_topic != other.fallback_topic {
            changed.push(SettingKey::FallbackTopic);
        }
        if self.group_topic != other.group_topic {
            changed.push(SettingKey::GroupTopic);
        }
        if self.power_on_state != other.power_on_state {
            changed.push(SettingKey::PowerOnState);
        }
        if self.led_state != other.led_state {
            changed.push(SettingKey::LedState);
        }
        changed
    }
}

/// Name of a single setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingKey {
    BrokerHost,
    BrokerPort,
    BrokerUsername,
    BrokerPassword,
    Topic,
    FallbackTopic,
    GroupTopic,
    PowerOnState,
    LedState,
}

impl SettingKey {
    /// Whether the key is part of the broker credentials.
    #[must_use]
    pub fn is_broker(self) -> bool {
        matches!(
            self,
            Self::BrokerHost | Self::BrokerPort | Self::BrokerUsername | Self::BrokerPassword
        )
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BrokerHost => "broker.host",
            Self::BrokerPort => "broker.port",
            Self::BrokerUsername => "broker.username",
            Self::BrokerPassword => "broker.password",
            Self::Topic => "topic",
            Self::FallbackTopic => "fallback-topic",
            Self::GroupTopic => "group-topic",
            Self::PowerOnState => "power-on-state",
            Self::LedState => "led-state",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_default_to_saved_power_state_and_led_off() {
        let settings = DeviceSettings::default();
        assert_eq!(settings.power_on_state, "3");
        assert_eq!(settings.led_state, "0");
    }

    #[test]
    fn should_report_no_changes_for_identical_settings() {
        let settings = DeviceSettings::default();
        assert!(settings.changed_keys(&settings.clone()).is_empty());
    }

    #[test]
    fn should_report_changed_keys_in_stable_order() {
        let old = DeviceSettings::default();
        let mut new = old.clone();
        new.led_state = "1".to_string();
        new.broker.password = "secret".to_string();
        assert_eq!(
            old.changed_keys(&new),
            vec![SettingKey::BrokerPassword, SettingKey::LedState]
        );
    }

    #[test]
    fn should_classify_broker_keys() {
        assert!(SettingKey::BrokerHost.is_broker());
        assert!(SettingKey::BrokerPassword.is_broker());
        assert!(!SettingKey::Topic.is_broker());
        assert!(!SettingKey::PowerOnState.is_broker());
    }

    #[test]
    fn should_deserialize_kebab_case_keys() {
        let json = r#"{"topic":"sonoff","power-on-state":"1","led-state":"2"}"#;
        let settings: DeviceSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.topic, "sonoff");
        assert_eq!(settings.power_on_state, "1");
        assert_eq!(settings.led_state, "2");
        assert_eq!(settings.broker.port, 1883);
    }
}
