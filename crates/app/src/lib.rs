//! # tasmobridge-app
//!
//! Application layer: the synchronisation engine and its **port definitions**.
//!
//! ## Responsibilities
//! - Define **port traits** that adapters and the host implement:
//!   - `Broker` / `BrokerConnection`: shared transport connections
//!   - `DeviceChannel` / `ProbeChannel`: per-device and discovery handles
//!   - `DeviceRuntime`: the host's view of one device (values, triggers, availability)
//!   - `DriverRuntime`: the host's view of paired devices
//!   - `EventPublisher`: publish domain events
//! - Provide **services**:
//!   - `ConnectionPool`: one connection per credential tuple, shared in-flight
//!   - `DeviceSession`: state machine, message router/reconciler, watchdog,
//!     capability writes and settings validation for one device
//!   - `PairingSession`: discovery and capability probing of new devices
//! - Provide **in-process infrastructure** that doesn't need IO:
//!   the message hub shared by broker adapters, the device registry and the event bus
//!
//! ## Dependency rule
//! Depends on `tasmobridge-domain` only (plus `tokio` for tasks, channels and timers).
//! Never imports adapter crates. Adapters depend on *this* crate, not the reverse.

pub mod event_bus;
pub mod hub;
pub mod ports;
pub mod registry;
pub mod services;
pub mod tasmota;

#[cfg(test)]
pub(crate) mod testing;
