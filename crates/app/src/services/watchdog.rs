//! Watchdog: periodic re-assertion of cached switch states.
//!
//! The timer is owned by the session's message loop and polled from the same
//! `select!` as the message stream, so arming, disarming and firing never
//! race each other.

use std::pin::Pin;
use std::time::Duration;

use tokio::time::{Instant, Sleep};

use tasmobridge_domain::capability::Capability;

use super::capability_cache::CapabilityCache;
use super::dispatcher::{self, CapabilityWrite, OutboundCommand};

/// Single re-armable timer.
#[derive(Debug)]
pub struct Watchdog {
    interval: Duration,
    deadline: Option<Pin<Box<Sleep>>>,
}

impl Watchdog {
    /// A disarmed watchdog.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            deadline: None,
        }
    }

    /// (Re)start the timer. A pending deadline is replaced, never duplicated.
    pub fn arm(&mut self) {
        let at = Instant::now() + self.interval;
        match self.deadline.as_mut() {
            Some(deadline) => deadline.as_mut().reset(at),
            None => self.deadline = Some(Box::pin(tokio::time::sleep_until(at))),
        }
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Resolve when the armed deadline passes; pending forever while disarmed.
    ///
    /// Cancel safe. Firing disarms the watchdog.
    pub async fn fired(&mut self) {
        match self.deadline.as_mut() {
            Some(deadline) => {
                deadline.as_mut().await;
                self.deadline = None;
            }
            None => std::future::pending().await,
        }
    }
}

/// Commands that re-assert every cached switch state of the device.
///
/// Switches without a cached value are skipped.
#[must_use]
pub fn reassert_commands(
    cache: &CapabilityCache,
    capabilities: &[Capability],
) -> Vec<OutboundCommand> {
    capabilities
        .iter()
        .filter_map(|capability| {
            let index = capability.switch_index()?;
            let on = cache.switch(index)?;
            dispatcher::translate(CapabilityWrite::Switch { index, on }).ok()
        })
        .collect()
}
