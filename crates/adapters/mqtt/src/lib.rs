//! # tasmobridge-adapter-mqtt
//!
//! MQTT adapter: implements the broker port over a real MQTT broker.
//!
//! ## Responsibilities
//! - Open one rumqttc client per credential tuple and wait for the broker's acknowledgement
//! - Subscribe to every device report (`stat/+/+`, `tele/+/+`) and feed them into a
//!   [`MessageHub`]
//! - Publish device commands on `cmnd/<topic>/<COMMAND>`
//! - Keep reconnecting in the background; broker outages surface as offline links.
//!   A broker that rejects the login ends the attempt even when retrying.
//!
//! ## Dependency rule
//! Depends on `tasmobridge-app` (ports, hub) and `tasmobridge-domain`.

pub mod config;
pub mod error;
mod topic;

use std::future::Future;
use std::time::Duration;

use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};

use tasmobridge_app::hub::{CommandSink, MessageHub, ProbeHandle, TopicChannel};
use tasmobridge_app::ports::{Broker, BrokerConnection, LinkStatus, RetryPolicy};
use tasmobridge_domain::credentials::BrokerCredentials;
use tasmobridge_domain::error::ConnectionError;

pub use config::MqttConfig;
pub use error::MqttError;

/// Opens MQTT connections.
#[derive(Debug, Clone, Default)]
pub struct MqttBroker {
    config: MqttConfig,
}

impl MqttBroker {
    #[must_use]
    pub fn new(config: MqttConfig) -> Self {
        Self { config }
    }
}

impl Broker for MqttBroker {
    type Connection = MqttConnection;

    fn connect(
        &self,
        credentials: &BrokerCredentials,
        retry: RetryPolicy,
    ) -> impl Future<Output = Result<MqttConnection, ConnectionError>> + Send {
        let config = self.config.clone();
        let credentials = credentials.clone();
        async move {
            let mut attempt: u32 = 1;
            loop {
                match open(&config, &credentials).await {
                    Ok(connection) => return Ok(connection),
                    Err(err) if retry == RetryPolicy::FailFast || err.is_permanent() => {
                        return Err(err.into_connect_error(&credentials));
                    }
                    Err(err) => {
                        tracing::warn!(
                            host = %credentials.host,
                            port = credentials.port,
                            attempt,
                            error = %err,
                            "broker connection failed, retrying"
                        );
                        attempt = attempt.saturating_add(1);
                        tokio::time::sleep(config.reconnect_delay()).await;
                    }
                }
            }
        }
    }
}

/// One live MQTT client, shared by every device using its credentials.
#[derive(Clone)]
pub struct MqttConnection {
    hub: MessageHub<MqttSink>,
    client: AsyncClient,
}

impl BrokerConnection for MqttConnection {
    type Channel = TopicChannel<MqttSink>;
    type Probe = ProbeHandle<MqttSink>;

    fn register_topic(&self, topic: &str) -> Result<Self::Channel, ConnectionError> {
        self.hub.register_topic(topic)
    }

    fn register_any_device(&self) -> Result<Self::Probe, ConnectionError> {
        self.hub.register_any_device()
    }

    fn same_connection(&self, other: &Self) -> bool {
        self.hub.ptr_eq(&other.hub)
    }

    fn close(&self) -> impl Future<Output = ()> + Send {
        self.hub.shutdown();
        let client = self.client.clone();
        async move {
            if let Err(err) = client.disconnect().await {
                tracing::debug!(error = %err, "disconnect request failed");
            }
        }
    }
}

/// Publishes device commands through the rumqttc client.
#[derive(Clone)]
pub struct MqttSink {
    client: AsyncClient,
}

impl CommandSink for MqttSink {
    fn publish(
        &self,
        topic: &str,
        command: &str,
        payload: &str,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send {
        let client = self.client.clone();
        let full_topic = topic::command_topic(topic, command);
        let payload = payload.as_bytes().to_vec();
        let topic = topic.to_string();
        let command = command.to_string();
        async move {
            tracing::trace!(topic = %full_topic, "publishing command");
            client
                .publish(full_topic, QoS::AtMostOnce, false, payload)
                .await
                .map_err(|err| MqttError::Client(err).into_publish_error(&topic, &command))
        }
    }
}

#[tracing::instrument(skip_all, fields(host = %credentials.host, port = credentials.port))]
async fn open(
    config: &MqttConfig,
    credentials: &BrokerCredentials,
) -> Result<MqttConnection, MqttError> {
    let client_id = config.client_id();
    let mut options = MqttOptions::new(
        client_id.clone(),
        credentials.host.clone(),
        credentials.port,
    );
    options.set_keep_alive(config.keep_alive());
    options.set_clean_session(true);
    if !credentials.username.is_empty() {
        options.set_credentials(credentials.username.clone(), credentials.password.clone());
    }

    let (client, mut event_loop) = AsyncClient::new(options, config.request_capacity);
    let timeout = config.connect_timeout();
    tokio::time::timeout(timeout, wait_for_conn_ack(&mut event_loop))
        .await
        .map_err(|_| MqttError::ConnAckTimeout(timeout))??;
    subscribe(&client)?;

    let hub = MessageHub::new(MqttSink {
        client: client.clone(),
    });
    tokio::spawn(pump(
        event_loop,
        client.clone(),
        hub.clone(),
        config.reconnect_delay(),
    ));
    tracing::info!(%client_id, "connected to broker");

    Ok(MqttConnection { hub, client })
}

async fn wait_for_conn_ack(event_loop: &mut EventLoop) -> Result<(), MqttError> {
    loop {
        if let Event::Incoming(Packet::ConnAck(ack)) =
            event_loop.poll().await.map_err(MqttError::Connection)?
        {
            if ack.code == ConnectReturnCode::Success {
                return Ok(());
            }
            return Err(MqttError::Refused(ack.code));
        }
    }
}

fn subscribe(client: &AsyncClient) -> Result<(), MqttError> {
    for filter in topic::SUBSCRIPTIONS {
        client
            .try_subscribe(filter, QoS::AtMostOnce)
            .map_err(MqttError::Client)?;
    }
    Ok(())
}

/// Drive the event loop until the connection is closed.
async fn pump(
    mut event_loop: EventLoop,
    client: AsyncClient,
    hub: MessageHub<MqttSink>,
    reconnect_delay: Duration,
) {
    while !hub.is_closed() {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => match topic::parse(&publish.topic) {
                Some(route) => {
                    let payload = topic::decode_payload(&publish.payload);
                    hub.deliver(route.device, route.tag, payload);
                }
                None => tracing::trace!(topic = %publish.topic, "ignoring publish"),
            },
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                tracing::info!("reconnected to broker");
                if let Err(err) = subscribe(&client) {
                    tracing::warn!(error = %err, "could not renew subscriptions");
                }
                hub.set_broker_link(LinkStatus::Online);
            }
            Ok(_) => {}
            Err(err) => {
                if hub.is_closed() {
                    break;
                }
                tracing::warn!(error = %err, "broker connection lost");
                hub.set_broker_link(LinkStatus::Offline);
                tokio::time::sleep(reconnect_delay).await;
            }
        }
    }
    tracing::debug!("broker event loop stopped");
}
