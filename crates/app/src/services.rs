//! Application services: the synchronisation engine.
//!
//! Each service accepts port implementations via generic parameters
//! (constructor injection), keeping this layer decoupled from concrete brokers
//! and from the host.

pub mod capability_cache;
pub mod connection_pool;
pub mod discovery;
pub mod dispatcher;
pub mod router;
pub mod session;
pub mod settings;
pub mod watchdog;
