//! Tasmota topic layout: `<prefix>/<device topic>/<TAG>`.
//!
//! Devices report on `stat/` and `tele/` and listen on `cmnd/`.

use tasmobridge_app::ports::Payload;

/// Filters covering every device report.
pub(crate) const SUBSCRIPTIONS: [&str; 2] = ["stat/+/+", "tele/+/+"];

/// Where an inbound publish belongs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Route<'a> {
    pub device: &'a str,
    pub tag: &'a str,
}

pub(crate) fn parse(topic: &str) -> Option<Route<'_>> {
    let mut parts = topic.splitn(3, '/');
    let prefix = parts.next()?;
    if !matches!(prefix, "stat" | "tele") {
        return None;
    }
    let device = parts.next().filter(|device| !device.is_empty())?;
    let tag = parts
        .next()
        .filter(|tag| !tag.is_empty() && !tag.contains('/'))?;
    Some(Route { device, tag })
}

pub(crate) fn command_topic(device: &str, command: &str) -> String {
    format!("cmnd/{device}/{}", command.to_ascii_uppercase())
}

/// JSON when it parses, the trimmed text otherwise (`ON`, `Online`, ...).
pub(crate) fn decode_payload(bytes: &[u8]) -> Payload {
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Payload::String(String::from_utf8_lossy(bytes).trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn should_split_report_topics() {
        assert_eq!(
            parse("stat/kitchen/POWER1"),
            Some(Route { device: "kitchen", tag: "POWER1" })
        );
        assert_eq!(
            parse("tele/blind/SENSOR"),
            Some(Route { device: "blind", tag: "SENSOR" })
        );
    }

    #[test]
    fn should_reject_foreign_topics() {
        assert_eq!(parse("cmnd/kitchen/POWER1"), None);
        assert_eq!(parse("stat/kitchen"), None);
        assert_eq!(parse("stat//POWER"), None);
        assert_eq!(parse("tele/kitchen/a/b"), None);
        assert_eq!(parse("homeassistant/switch/config"), None);
    }

    #[test]
    fn should_build_uppercase_command_topic() {
        assert_eq!(command_topic("kitchen", "power2"), "cmnd/kitchen/POWER2");
        assert_eq!(
            command_topic("blind", "shutterposition"),
            "cmnd/blind/SHUTTERPOSITION"
        );
    }

    #[test]
    fn should_decode_json_and_plain_payloads() {
        assert_eq!(decode_payload(br#"{"POWER1":"ON"}"#), json!({"POWER1": "ON"}));
        assert_eq!(decode_payload(b"42"), json!(42));
        assert_eq!(decode_payload(b"ON"), json!("ON"));
        assert_eq!(decode_payload(b"Online\n"), json!("Online"));
        assert_eq!(decode_payload(b""), json!(""));
    }
}
