//! Broker port: shared transport connections and per-device handles.
//!
//! A [`Broker`] opens connections; a [`BrokerConnection`] is shared by every
//! device that uses the same credentials and hands out one [`DeviceChannel`]
//! per device topic, or a [`ProbeChannel`] for a device that is not yet known.
//!
//! The only wire-level data model is a lowercase `command` tag plus a
//! [`Payload`]; message framing belongs to the adapter.

use std::fmt;
use std::future::Future;

use tokio::sync::watch;

use tasmobridge_domain::capability::Capability;
use tasmobridge_domain::credentials::BrokerCredentials;
use tasmobridge_domain::error::ConnectionError;

use crate::tasmota::{Announcement, StatusSnapshot};

/// Structured or scalar message body.
pub type Payload = serde_json::Value;

/// One message received for a device.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Lowercase tag, e.g. `state`, `result`, `power1`, `shutter1`.
    pub command: String,
    pub payload: Payload,
}

impl InboundMessage {
    /// Build a message, normalising the tag to lowercase.
    pub fn new(command: impl AsRef<str>, payload: Payload) -> Self {
        Self {
            command: command.as_ref().to_ascii_lowercase(),
            payload,
        }
    }
}

/// Whether an acquisition may retry until the broker answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Keep retrying in the background until connected.
    Retry,
    /// Report the first failure. Used when validating credentials.
    FailFast,
}

/// Reachability of a device as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Online,
    Offline,
}

/// Correlation key for a reply: `<tag>` or `<tag>.<field>`, lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplyKey(String);

impl ReplyKey {
    /// Match any message with the given tag.
    pub fn tag(tag: impl AsRef<str>) -> Self {
        Self(tag.as_ref().to_ascii_lowercase())
    }

    /// Match one top-level field of a message with the given tag.
    pub fn field(tag: impl AsRef<str>, field: impl AsRef<str>) -> Self {
        Self(format!(
            "{}.{}",
            tag.as_ref().to_ascii_lowercase(),
            field.as_ref().to_ascii_lowercase()
        ))
    }

    /// The `result.<setting>` reply to a settings command.
    pub fn result_of(setting: impl AsRef<str>) -> Self {
        Self::field("result", setting)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReplyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opens transport connections.
pub trait Broker: Send + Sync + 'static {
    type Connection: BrokerConnection;

    /// Connect with the given credentials.
    ///
    /// With [`RetryPolicy::FailFast`] the first failure is returned; with
    /// [`RetryPolicy::Retry`] the adapter keeps trying.
    fn connect(
        &self,
        credentials: &BrokerCredentials,
        retry: RetryPolicy,
    ) -> impl Future<Output = Result<Self::Connection, ConnectionError>> + Send;
}

/// A live connection shared by all devices using the same credentials.
pub trait BrokerConnection: Clone + Send + Sync + 'static {
    type Channel: DeviceChannel;
    type Probe: ProbeChannel;

    /// Register interest in one device topic.
    ///
    /// Registering a topic again replaces the previous handle, whose message
    /// stream then ends.
    fn register_topic(&self, topic: &str) -> Result<Self::Channel, ConnectionError>;

    /// Register a probe that latches onto the next device that announces itself.
    fn register_any_device(&self) -> Result<Self::Probe, ConnectionError>;

    /// Whether both handles refer to the same underlying connection.
    fn same_connection(&self, other: &Self) -> bool;

    /// Tear the connection down; every handle on it is closed.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Per-device handle on a shared connection.
pub trait DeviceChannel: Send + Sync + 'static {
    /// The topic this handle is registered for.
    fn topic(&self) -> &str;

    /// Wait until the device reports its status.
    ///
    /// Returns `None` when the connection signals that no status will ever
    /// arrive (for example the handle was closed).
    fn await_initial_status(&self) -> impl Future<Output = Option<StatusSnapshot>> + Send;

    /// Wait for the next message, in arrival order.
    ///
    /// Returns `None` once the handle is closed. Cancel safe: dropping the
    /// future before it completes loses no message.
    fn next_message(&self) -> impl Future<Output = Option<InboundMessage>> + Send;

    /// Send one command to the device. An absent payload queries the value.
    fn send_command(
        &self,
        command: &str,
        payload: Option<&str>,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    /// Wait for the reply correlated to `key`.
    ///
    /// The waiter is registered when this method is called, before the
    /// returned future is first polled, so a reply to a command sent after
    /// the call cannot be missed. The wait itself is unbounded; callers
    /// apply their own timeout.
    fn await_reply(
        &self,
        key: ReplyKey,
    ) -> impl Future<Output = Result<Payload, ConnectionError>> + Send;

    /// Online/offline signal for the device.
    fn link_status(&self) -> watch::Receiver<LinkStatus>;

    /// Unregister the handle; `next_message` then returns `None`.
    fn close(&self);
}

/// Discovery-time handle on a device that has not been paired yet.
pub trait ProbeChannel: Send + Sync + 'static {
    /// Wait for the next device to announce itself; the probe latches onto it.
    fn await_announcement(
        &self,
    ) -> impl Future<Output = Result<Announcement, ConnectionError>> + Send;

    /// Ask the latched device for its network status report.
    fn query_network_status(
        &self,
    ) -> impl Future<Output = Result<Payload, ConnectionError>> + Send;

    /// Ask the latched device whether it supports `capability`.
    ///
    /// Resolves once the device answers; callers bound the wait.
    fn probe(
        &self,
        capability: Capability,
    ) -> impl Future<Output = Result<bool, ConnectionError>> + Send;

    /// Drop the probe registration.
    fn unregister(&self);
}
