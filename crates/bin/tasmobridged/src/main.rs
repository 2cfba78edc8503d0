//! # tasmobridged: tasmobridge daemon
//!
//! Composition root that wires a broker adapter to the synchronisation engine.
//!
//! ## Responsibilities
//! - Parse configuration (config file, env vars) and install logging
//! - Construct the broker adapter (`mqtt` or `virtual`) and the shared connection pool
//! - Start one device session per configured device, reporting to an in-memory host
//! - `tasmobridged discover`: pair the next announcing device and print its record
//! - Handle graceful shutdown (Ctrl-C)
//!
//! ## Dependency rule
//! This is the **only** crate that depends on all other crates.
//! It is the wiring layer; no domain logic belongs here.

mod config;
mod host;

use std::sync::Arc;

use serde::Serialize;
use tracing_subscriber::EnvFilter;

use tasmobridge_adapter_mqtt::MqttBroker;
use tasmobridge_adapter_virtual::VirtualBroker;
use tasmobridge_app::event_bus::InProcessEventBus;
use tasmobridge_app::ports::Broker;
use tasmobridge_app::registry::DeviceRegistry;
use tasmobridge_app::services::connection_pool::ConnectionPool;
use tasmobridge_app::services::discovery::{DiscoveryOutcome, PairingSession};
use tasmobridge_app::services::session::DeviceSession;
use tasmobridge_domain::device::DeviceRecord;

use crate::config::{BrokerKind, Config};
use crate::host::{ConfiguredDevices, HostDevice};

/// What the daemon was asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run sessions for the configured devices until interrupted.
    Serve,
    /// Pair the next device that announces itself.
    Discover,
}

impl Command {
    fn from_args(mut args: impl Iterator<Item = String>) -> Result<Self, String> {
        match args.next().as_deref() {
            None | Some("serve") => Ok(Self::Serve),
            Some("discover") => Ok(Self::Discover),
            Some(other) => Err(format!(
                "unknown command {other:?}, expected `serve` or `discover`"
            )),
        }
    }
}

/// The shape `[[devices]]` takes in the config file.
#[derive(Serialize)]
struct DevicesSection<'a> {
    devices: &'a [DeviceRecord],
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&config.logging.filter))
        .init();

    let command = Command::from_args(std::env::args().skip(1))?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        ?command,
        broker = ?config.broker.kind,
        "starting tasmobridged"
    );

    match config.broker.kind {
        BrokerKind::Mqtt => run(MqttBroker::new(config.mqtt.clone()), &config, command).await,
        BrokerKind::Virtual => {
            let mut broker = VirtualBroker::new(&config.virtual_devices)?;
            if !config.broker.password.is_empty() {
                broker = broker.with_password(config.broker.password.clone());
            }
            run(broker, &config, command).await
        }
    }
}

async fn run<B: Broker>(
    broker: B,
    config: &Config,
    command: Command,
) -> Result<(), Box<dyn std::error::Error>> {
    let pool = Arc::new(ConnectionPool::new(broker));
    match command {
        Command::Serve => serve(pool, config).await,
        Command::Discover => discover(&pool, config).await,
    }
}

async fn serve<B: Broker>(
    pool: Arc<ConnectionPool<B>>,
    config: &Config,
) -> Result<(), Box<dyn std::error::Error>> {
    let bus = Arc::new(InProcessEventBus::new(256));
    let event_log = host::spawn_event_log(&bus);
    let registry = DeviceRegistry::new();

    let mut sessions = Vec::with_capacity(config.devices.len());
    for record in &config.devices {
        let runtime = HostDevice::new(record.id.clone(), Arc::clone(&bus));
        let session = DeviceSession::start(
            record.clone(),
            runtime,
            Arc::clone(&pool),
            registry.clone(),
            config.session_config(),
        )?;
        sessions.push(session);
    }
    if sessions.is_empty() {
        tracing::warn!("no devices configured, run `tasmobridged discover` to pair one");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!(sessions = sessions.len(), "shutting down");

    for entry in registry.list() {
        tracing::debug!(
            device_id = %entry.id,
            topic = %entry.topic,
            state = %entry.state,
            "stopping session"
        );
    }
    for session in &sessions {
        session.delete();
    }
    pool.close_all().await;
    event_log.abort();
    Ok(())
}

async fn discover<B: Broker>(
    pool: &ConnectionPool<B>,
    config: &Config,
) -> Result<(), Box<dyn std::error::Error>> {
    let pairing = PairingSession::connect(
        pool.broker(),
        config.pairing_credentials(),
        ConfiguredDevices::new(&config.devices),
        config.discovery_config(),
    )
    .await?;
    tracing::info!("waiting for a device to announce itself");
    let outcome = pairing.next_device().await;
    pairing.close().await;

    match outcome? {
        DiscoveryOutcome::Discovered(record) => {
            let section = DevicesSection {
                devices: std::slice::from_ref(&record),
            };
            println!("{}", toml::to_string(&section)?);
        }
        DiscoveryOutcome::AlreadyPaired(id) => {
            tracing::info!(device_id = %id, "device is already configured");
        }
        DiscoveryOutcome::Unsupported(id) => {
            tracing::warn!(device_id = %id, "device has neither relays nor a shutter");
        }
    }
    Ok(())
}
