//! Shutter driven by the relay bank.
//!
//! Moves are instantaneous but still reported in two steps, the way a real
//! controller reports a move: once while travelling towards the target, once
//! settled on it.

use serde_json::json;

use tasmobridge_app::ports::Payload;

use super::Reply;

#[derive(Debug, Default)]
pub(crate) struct Shutter {
    position: u8,
}

impl Shutter {
    pub fn position(&self) -> u8 {
        self.position
    }

    pub fn handle(&mut self, command: &str, payload: &str) -> Vec<Reply> {
        let requested = payload.trim().parse::<u8>().ok().map(|p| p.min(100));
        match (command, requested) {
            ("shutteropen", _) => self.move_to(100),
            ("shutterclose", _) => self.move_to(0),
            ("shutterposition" | "shutterposition1", Some(target)) => self.move_to(target),
            _ => vec![("RESULT", self.report(0, self.position))],
        }
    }

    fn move_to(&mut self, target: u8) -> Vec<Reply> {
        let start = self.position;
        self.position = target;
        if start == target {
            return vec![("RESULT", self.report(0, target))];
        }
        let direction = if target > start { 1 } else { -1 };
        vec![
            ("RESULT", report(start, direction, target)),
            ("RESULT", self.report(0, target)),
        ]
    }

    fn report(&self, direction: i8, target: u8) -> Payload {
        report(self.position, direction, target)
    }
}

fn report(position: u8, direction: i8, target: u8) -> Payload {
    json!({"Shutter1": {"Position": position, "Direction": direction, "Target": target}})
}
