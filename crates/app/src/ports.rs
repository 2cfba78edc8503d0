//! Port definitions: traits that adapters and the host implement.
//!
//! Ports are the boundaries between the synchronisation engine and the outside
//! world. They are defined here (in `app`) so that both the service layer and
//! the adapter layer can depend on them without creating circular dependencies.

pub mod broker;
pub mod event_bus;
pub mod runtime;

pub use broker::{
    Broker, BrokerConnection, DeviceChannel, InboundMessage, LinkStatus, Payload, ProbeChannel,
    ReplyKey, RetryPolicy,
};
pub use event_bus::EventPublisher;
pub use runtime::{DeviceRuntime, DriverRuntime};
