//! Tasmota payload conventions.
//!
//! Controllers report JSON objects (`{"POWER1":"ON"}`, `{"Shutter1":{...}}`)
//! or bare scalars (`ON`, `42`). Everything here is lenient: unknown shapes
//! yield `None` and are ignored by callers.

use tasmobridge_domain::capability::SwitchIndex;

use crate::ports::Payload;

/// Look up a top-level field, ignoring ASCII case.
#[must_use]
pub fn field<'a>(payload: &'a Payload, name: &str) -> Option<&'a Payload> {
    payload
        .as_object()?
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value)
}

/// Parse a boolean-like value: `ON`/`OFF`, `1`/`0`, `true`/`false`.
#[must_use]
pub fn parse_switch_state(value: &Payload) -> Option<bool> {
    match value {
        Payload::Bool(on) => Some(*on),
        Payload::Number(n) => match n.as_u64()? {
            0 => Some(false),
            1 => Some(true),
            _ => None,
        },
        Payload::String(s) => {
            let s = s.trim();
            if s.eq_ignore_ascii_case("on") || s == "1" || s.eq_ignore_ascii_case("true") {
                Some(true)
            } else if s.eq_ignore_ascii_case("off") || s == "0" || s.eq_ignore_ascii_case("false")
            {
                Some(false)
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Parse a percentage (`0..=100`, number or numeric string) into `[0, 1]`.
#[must_use]
pub fn parse_percentage(value: &Payload) -> Option<f64> {
    let percent = match value {
        Payload::Number(n) => n.as_f64()?,
        Payload::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if percent.is_nan() {
        return None;
    }
    Some(percent.clamp(0.0, 100.0) / 100.0)
}

/// Render a confirmed setting the way it is compared against the request.
#[must_use]
pub fn setting_value(value: &Payload) -> String {
    match value {
        Payload::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Extract `StatusNET.Mac` from a `Status 5` reply.
#[must_use]
pub fn hardware_address(payload: &Payload) -> Option<&str> {
    field(field(payload, "StatusNET")?, "Mac")?.as_str()
}

/// The device's status as reported in reply to `Status`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusSnapshot {
    pub topic: Option<String>,
    pub power_on_state: Option<String>,
    pub led_state: Option<String>,
    power: [Option<bool>; 4],
}

impl StatusSnapshot {
    /// Parse a `{"Status":{...}}` reply, or an already unwrapped status object.
    ///
    /// `Power` is either an integer bitmask (bit 0 is switch 1) or a binary
    /// string whose first character is switch 1. Explicit `Power1`..`Power4`
    /// fields take precedence.
    #[must_use]
    pub fn from_payload(payload: &Payload) -> Option<Self> {
        let status = field(payload, "Status").filter(|s| s.is_object()).unwrap_or(payload);
        if !status.is_object() {
            return None;
        }

        let mut snapshot = Self {
            topic: field(status, "Topic").and_then(Payload::as_str).map(str::to_string),
            power_on_state: field(status, "PowerOnState").map(setting_value),
            led_state: field(status, "LedState").map(setting_value),
            power: [None; 4],
        };

        if let Some(power) = field(status, "Power") {
            snapshot.power = decode_power(power);
        }
        for index in SwitchIndex::all() {
            if let Some(on) = field(status, &format!("Power{index}")).and_then(parse_switch_state)
            {
                snapshot.set_switch(index, on);
            }
        }
        Some(snapshot)
    }

    /// Reported state of one switch.
    #[must_use]
    pub fn switch(&self, index: SwitchIndex) -> Option<bool> {
        self.power[usize::from(index.get() - 1)]
    }

    /// Record the state of one switch.
    pub fn set_switch(&mut self, index: SwitchIndex, on: bool) {
        self.power[usize::from(index.get() - 1)] = Some(on);
    }
}

fn decode_power(power: &Payload) -> [Option<bool>; 4] {
    let mut decoded = [None; 4];
    match power {
        Payload::Number(n) => {
            if let Some(mask) = n.as_u64() {
                for (bit, slot) in decoded.iter_mut().enumerate() {
                    *slot = Some(mask & (1 << bit) != 0);
                }
            }
        }
        Payload::String(s) if s.len() > 1 && s.chars().all(|c| c == '0' || c == '1') => {
            for (slot, c) in decoded.iter_mut().zip(s.chars()) {
                *slot = Some(c == '1');
            }
        }
        other => decoded[0] = parse_switch_state(other),
    }
    decoded
}

/// A device's self-announcement (`INFO1`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Announcement {
    pub topic: String,
    pub module: String,
    pub version: String,
    pub fallback_topic: String,
    pub group_topic: String,
}

impl Announcement {
    /// Parse an `INFO1` payload received on `topic`; fields may be nested under `Info1`.
    #[must_use]
    pub fn from_payload(topic: &str, payload: &Payload) -> Self {
        let info = field(payload, "Info1").filter(|i| i.is_object()).unwrap_or(payload);
        let text = |name: &str| field(info, name).map(setting_value).unwrap_or_default();
        Self {
            topic: topic.to_string(),
            module: text("Module"),
            version: text("Version"),
            fallback_topic: text("FallbackTopic"),
            group_topic: text("GroupTopic"),
        }
    }
}
