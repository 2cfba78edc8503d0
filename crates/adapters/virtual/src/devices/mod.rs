//! Simulated controllers: a relay bank, optionally driving a shutter.
//!
//! Devices answer commands the way the firmware does: with `RESULT`
//! reports, `STATUS`/`STATUS5` for status queries and `{"Command":"Unknown"}`
//! for anything they cannot handle.

mod relays;
mod shutter;

use serde_json::json;

use tasmobridge_app::ports::Payload;
use tasmobridge_domain::error::ValidationError;
use tasmobridge_domain::id::DeviceId;

use crate::config::VirtualDeviceConfig;
use crate::error::VirtualError;

use relays::RelayBank;
use shutter::Shutter;

/// One report a device publishes: `(tag, payload)`.
pub(crate) type Reply = (&'static str, Payload);

pub(crate) struct VirtualDevice {
    id: DeviceId,
    topic: String,
    module: String,
    version: String,
    power_on_state: String,
    led_state: String,
    relays: RelayBank,
    shutter: Option<Shutter>,
}

impl VirtualDevice {
    pub fn from_config(config: &VirtualDeviceConfig) -> Result<Self, VirtualError> {
        if config.topic.trim().is_empty() {
            return Err(VirtualError::Invalid(ValidationError::EmptyTopic));
        }
        if config.relays > 4 {
            return Err(VirtualError::TooManyRelays {
                topic: config.topic.clone(),
                relays: config.relays,
            });
        }
        let id = DeviceId::from_mac(&config.mac).map_err(VirtualError::Invalid)?;
        Ok(Self {
            id,
            topic: config.topic.clone(),
            module: config.module.clone(),
            version: config.version.clone(),
            power_on_state: config.power_on_state.clone(),
            led_state: config.led_state.clone(),
            relays: RelayBank::new(config.relays),
            shutter: config.shutter.then(Shutter::default),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn relay(&self, index: u8) -> Option<bool> {
        self.relays.get(index)
    }

    pub fn position(&self) -> Option<u8> {
        self.shutter.as_ref().map(Shutter::position)
    }

    /// The `INFO1` announcement sent after (re)connecting.
    pub fn announcement(&self) -> Payload {
        let suffix: String = self.id.as_str().replace(':', "")[6..].to_string();
        json!({"Info1": {
            "Module": self.module,
            "Version": self.version,
            "FallbackTopic": format!("cmnd/DVES_{suffix}_fb/"),
            "GroupTopic": "cmnd/tasmotas/",
        }})
    }

    /// Apply one command and return the reports it produces.
    pub fn handle(&mut self, command: &str, payload: &str) -> Vec<Reply> {
        let command = command.to_ascii_lowercase();
        match command.as_str() {
            "status" if payload == "5" => vec![(
                "STATUS5",
                json!({"StatusNET": {"Hostname": self.topic, "Mac": self.id.as_str()}}),
            )],
            "status" => vec![("STATUS", self.status())],
            "poweronstate" => {
                let value = update_setting(&mut self.power_on_state, payload, 5);
                vec![("RESULT", json!({"PowerOnState": value}))]
            }
            "ledstate" => {
                let value = update_setting(&mut self.led_state, payload, 8);
                vec![("RESULT", json!({"LedState": value}))]
            }
            "shutterposition" | "shutterposition1" | "shutteropen" | "shutterclose"
            | "shutterstop" => match self.shutter.as_mut() {
                Some(shutter) => shutter.handle(&command, payload),
                None => vec![unknown_command()],
            },
            other => match other.strip_prefix("power") {
                Some(number) => match self.relays.handle(number, payload) {
                    Some(report) => vec![("RESULT", report)],
                    None => vec![unknown_command()],
                },
                None => vec![unknown_command()],
            },
        }
    }

    /// A physical button press toggling one relay.
    pub fn press(&mut self, index: u8) -> Result<Vec<Reply>, VirtualError> {
        let report = self
            .relays
            .handle(&index.to_string(), "toggle")
            .ok_or_else(|| VirtualError::NoSuchRelay {
                topic: self.topic.clone(),
                index,
            })?;
        Ok(vec![("RESULT", report)])
    }

    fn status(&self) -> Payload {
        json!({"Status": {
            "Module": 0,
            "FriendlyName": [self.topic],
            "Topic": self.topic,
            "Power": self.relays.mask(),
            "PowerOnState": numeric(&self.power_on_state),
            "LedState": numeric(&self.led_state),
        }})
    }
}

/// Set `current` when `requested` is a number up to `max`; report the value in effect.
fn update_setting(current: &mut String, requested: &str, max: u8) -> Payload {
    if let Ok(value) = requested.trim().parse::<u8>() {
        if value <= max {
            *current = value.to_string();
        }
    }
    numeric(current)
}

fn numeric(value: &str) -> Payload {
    value
        .parse::<u8>()
        .map_or_else(|_| json!(value), |number| json!(number))
}

fn unknown_command() -> Reply {
    ("RESULT", json!({"Command": "Unknown"}))
}
