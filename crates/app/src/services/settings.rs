//! Settings validation: write a setting, then wait for the device to confirm it.

use std::time::Duration;

use tasmobridge_domain::error::{BridgeError, TimeoutError, ValueMismatchError};
use tasmobridge_domain::settings::{DeviceSettings, SettingKey};

use crate::ports::{DeviceChannel, ReplyKey};
use crate::tasmota::setting_value;

/// What accepting a settings change requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsPlan {
    pub changed: Vec<SettingKey>,
    /// Broker credentials changed: validate a new connection first.
    pub reconnect: bool,
    /// The topic changed: register the device under the new topic.
    pub retopic: bool,
    /// `(command, requested value)` pairs the device must confirm, in order.
    pub confirmations: Vec<(&'static str, String)>,
}

impl SettingsPlan {
    #[must_use]
    pub fn new(current: &DeviceSettings, requested: &DeviceSettings) -> Self {
        let changed = current.changed_keys(requested);
        let confirmations = changed
            .iter()
            .filter_map(|key| match key {
                SettingKey::PowerOnState => {
                    Some(("poweronstate", requested.power_on_state.clone()))
                }
                SettingKey::LedState => Some(("ledstate", requested.led_state.clone())),
                _ => None,
            })
            .collect();
        Self {
            reconnect: changed.iter().any(|key| key.is_broker()),
            retopic: changed.contains(&SettingKey::Topic),
            confirmations,
            changed,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
    }
}

/// Send `command` with `requested` and wait for the device's `result.<command>` reply.
///
/// # Errors
///
/// - [`BridgeError::Connection`] if the command cannot be sent.
/// - [`BridgeError::Timeout`] if no confirmation arrives within `timeout`.
/// - [`BridgeError::ValueMismatch`] if the device confirms another value.
#[tracing::instrument(skip(channel), fields(topic = %channel.topic()))]
pub async fn confirm_setting<C: DeviceChannel>(
    channel: &C,
    command: &str,
    requested: &str,
    timeout: Duration,
) -> Result<(), BridgeError> {
    let key = ReplyKey::result_of(command);
    let reply = channel.await_reply(key.clone());
    channel.send_command(command, Some(requested)).await?;

    let confirmed = tokio::time::timeout(timeout, reply)
        .await
        .map_err(|_| TimeoutError {
            correlation: key.to_string(),
            after: timeout,
        })??;
    let confirmed = setting_value(&confirmed);

    if confirmed != requested {
        tracing::warn!(%confirmed, "device confirmed a different value");
        return Err(ValueMismatchError {
            setting: command.to_string(),
            requested: requested.to_string(),
            confirmed,
        }
        .into());
    }
    tracing::debug!("setting confirmed");
    Ok(())
}
