//! Relay bank of up to four switches.

use serde_json::json;

use tasmobridge_app::ports::Payload;

#[derive(Debug, Default)]
pub(crate) struct RelayBank {
    count: u8,
    power: [bool; 4],
}

impl RelayBank {
    pub fn new(count: u8) -> Self {
        Self {
            count: count.min(4),
            power: [false; 4],
        }
    }

    pub fn get(&self, index: u8) -> Option<bool> {
        self.slot(index).map(|slot| self.power[slot])
    }

    /// `Power` bitmask as reported in `STATUS`; bit 0 is relay 1.
    pub fn mask(&self) -> u8 {
        self.power
            .iter()
            .take(usize::from(self.count))
            .enumerate()
            .filter(|(_, on)| **on)
            .fold(0, |mask, (bit, _)| mask | (1 << bit))
    }

    /// Handle `POWER<number>`; an empty payload only queries.
    ///
    /// Returns `None` for a relay the bank does not have.
    pub fn handle(&mut self, number: &str, payload: &str) -> Option<Payload> {
        let index = if number.is_empty() {
            1
        } else {
            number.parse().ok()?
        };
        let slot = self.slot(index)?;
        match payload.trim().to_ascii_lowercase().as_str() {
            "on" | "1" => self.power[slot] = true,
            "off" | "0" => self.power[slot] = false,
            "toggle" | "2" => self.power[slot] = !self.power[slot],
            _ => {}
        }

        let key = if self.count == 1 {
            "POWER".to_string()
        } else {
            format!("POWER{index}")
        };
        let state = if self.power[slot] { "ON" } else { "OFF" };
        let mut report = serde_json::Map::new();
        report.insert(key, json!(state));
        Some(Payload::Object(report))
    }

    fn slot(&self, index: u8) -> Option<usize> {
        (1..=self.count)
            .contains(&index)
            .then(|| usize::from(index - 1))
    }
}
