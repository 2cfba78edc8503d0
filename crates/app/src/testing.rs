//! Test doubles shared by the unit tests of this crate.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use tasmobridge_domain::availability::UnavailableReason;
use tasmobridge_domain::capability::{Capability, CapabilityValue};
use tasmobridge_domain::credentials::BrokerCredentials;
use tasmobridge_domain::error::{BridgeError, ConnectionError};
use tasmobridge_domain::settings::DeviceSettings;
use tasmobridge_domain::trigger::Trigger;

use crate::hub::{CommandSink, MessageHub, ProbeHandle, TopicChannel};
use crate::ports::{Broker, BrokerConnection, DeviceRuntime, Payload, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SentCommand {
    pub topic: String,
    pub command: String,
    pub payload: String,
}

type Responder = Arc<dyn Fn(&SentCommand) -> Vec<(String, Payload)> + Send + Sync>;

/// Records every published command and optionally answers through the hub.
#[derive(Clone, Default)]
pub(crate) struct RecordingSink {
    sent: Arc<Mutex<Vec<SentCommand>>>,
    failing: Arc<AtomicBool>,
    responder: Option<(Responder, mpsc::UnboundedSender<(String, String, Payload)>)>,
}

impl RecordingSink {
    pub fn sent(&self) -> Vec<SentCommand> {
        self.sent.lock().unwrap().clone()
    }
}

impl CommandSink for RecordingSink {
    fn publish(
        &self,
        topic: &str,
        command: &str,
        payload: &str,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send {
        let sent = SentCommand {
            topic: topic.to_string(),
            command: command.to_string(),
            payload: payload.to_string(),
        };
        let result = if self.failing.load(Ordering::SeqCst) {
            Err(ConnectionError::Publish {
                topic: sent.topic.clone(),
                command: sent.command.clone(),
                reason: "broker unavailable".to_string(),
            })
        } else {
            if let Some((responder, replies)) = &self.responder {
                for (tag, reply) in responder(&sent) {
                    let _ = replies.send((sent.topic.clone(), tag, reply));
                }
            }
            Ok(())
        };
        self.sent.lock().unwrap().push(sent);
        async move { result }
    }
}

/// A simulated controller answering the commands the engine sends.
#[derive(Debug, Clone)]
pub(crate) struct FakeDevice {
    pub topic: String,
    pub mac: String,
    pub relays: u8,
    pub shutter: bool,
    pub power: [bool; 4],
    pub position: u8,
    pub power_on_state: String,
    pub led_state: String,
    /// Reported back for every setting instead of the requested value.
    pub confirm_override: Option<String>,
    pub ignore_settings: bool,
    pub ignore_status: bool,
    /// Answer capability probes (commands sent without a value).
    pub answers_probes: bool,
}

impl FakeDevice {
    pub fn switch_bank(topic: &str, relays: u8) -> Self {
        Self {
            topic: topic.to_string(),
            mac: "A4:CF:12:0B:3E:7D".to_string(),
            relays,
            shutter: false,
            power: [false; 4],
            position: 0,
            power_on_state: "3".to_string(),
            led_state: "1".to_string(),
            confirm_override: None,
            ignore_settings: false,
            ignore_status: false,
            answers_probes: true,
        }
    }

    pub fn shutter(topic: &str) -> Self {
        Self {
            shutter: true,
            relays: 2,
            mac: "A4:CF:12:0B:3E:80".to_string(),
            ..Self::switch_bank(topic, 2)
        }
    }

    fn respond(&mut self, sent: &SentCommand) -> Vec<(String, Payload)> {
        let command = sent.command.to_ascii_lowercase();
        let payload = sent.payload.as_str();
        match command.as_str() {
            "status" if payload == "5" => {
                vec![("STATUS5".to_string(), json!({"StatusNET": {"Mac": self.mac}}))]
            }
            "status" if self.ignore_status => Vec::new(),
            "status" => {
                let setting =
                    |value: &str| value.parse::<u8>().map_or_else(|_| json!(value), |n| json!(n));
                let mask = self
                    .power
                    .iter()
                    .enumerate()
                    .filter(|(_, on)| **on)
                    .fold(0_u8, |mask, (bit, _)| mask | (1 << bit));
                vec![(
                    "STATUS".to_string(),
                    json!({"Status": {
                        "Topic": self.topic,
                        "Power": mask,
                        "PowerOnState": setting(&self.power_on_state),
                        "LedState": setting(&self.led_state),
                    }}),
                )]
            }
            "poweronstate" | "ledstate" => {
                if self.ignore_settings {
                    return Vec::new();
                }
                let confirmed = self
                    .confirm_override
                    .clone()
                    .unwrap_or_else(|| payload.to_string());
                if command == "poweronstate" {
                    self.power_on_state.clone_from(&confirmed);
                    vec![("RESULT".to_string(), json!({"PowerOnState": confirmed}))]
                } else {
                    self.led_state.clone_from(&confirmed);
                    vec![("RESULT".to_string(), json!({"LedState": confirmed}))]
                }
            }
            "shutterposition1" | "power1" | "power2" | "power3" | "power4"
                if payload.is_empty() && !self.answers_probes =>
            {
                Vec::new()
            }
            "shutterposition1" if payload.is_empty() => {
                if self.shutter {
                    vec![("RESULT".to_string(), self.shutter_report())]
                } else {
                    vec![unknown_command()]
                }
            }
            "shutteropen" | "shutterclose" | "shutterposition" | "shutterstop" if self.shutter => {
                match command.as_str() {
                    "shutteropen" => self.position = 100,
                    "shutterclose" => self.position = 0,
                    "shutterposition" => self.position = payload.parse().unwrap_or(self.position),
                    _ => {}
                }
                vec![("RESULT".to_string(), self.shutter_report())]
            }
            other => match other.strip_prefix("power") {
                Some(number) => self.respond_power(number, payload),
                None => Vec::new(),
            },
        }
    }

    fn respond_power(&mut self, number: &str, payload: &str) -> Vec<(String, Payload)> {
        let index = if number.is_empty() {
            1
        } else {
            match number.parse::<u8>() {
                Ok(n) => n,
                Err(_) => return Vec::new(),
            }
        };
        if index == 0 || index > self.relays {
            return vec![unknown_command()];
        }
        let key = if self.relays == 1 {
            "POWER".to_string()
        } else {
            format!("POWER{index}")
        };
        let slot = &mut self.power[usize::from(index - 1)];
        match payload.to_ascii_lowercase().as_str() {
            "on" | "1" => *slot = true,
            "off" | "0" => *slot = false,
            "toggle" => *slot = !*slot,
            _ => {}
        }
        let state = if *slot { "ON" } else { "OFF" };
        let mut reply = serde_json::Map::new();
        reply.insert(key, json!(state));
        vec![("RESULT".to_string(), Payload::Object(reply))]
    }

    fn shutter_report(&self) -> Payload {
        json!({"Shutter1": {"Position": self.position, "Direction": 0, "Target": self.position}})
    }
}

fn unknown_command() -> (String, Payload) {
    ("RESULT".to_string(), json!({"Command": "Unknown"}))
}

/// In-memory broker whose connections share one set of simulated devices.
pub(crate) struct FakeBroker {
    devices: Arc<Mutex<Vec<FakeDevice>>>,
    sent: Arc<Mutex<Vec<SentCommand>>>,
    failing: Arc<AtomicBool>,
    connects: AtomicUsize,
    connect_delay: Duration,
    accepted_password: Option<String>,
    hubs: Mutex<Vec<MessageHub<RecordingSink>>>,
}

impl FakeBroker {
    pub fn new(devices: Vec<FakeDevice>) -> Self {
        Self {
            devices: Arc::new(Mutex::new(devices)),
            sent: Arc::default(),
            failing: Arc::default(),
            connects: AtomicUsize::new(0),
            connect_delay: Duration::ZERO,
            accepted_password: None,
            hubs: Mutex::default(),
        }
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Refuse every connection whose password differs.
    pub fn with_password(mut self, password: &str) -> Self {
        self.accepted_password = Some(password.to_string());
        self
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<SentCommand> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, topic: &str) -> Vec<(String, String)> {
        self.sent()
            .into_iter()
            .filter(|sent| sent.topic == topic)
            .map(|sent| (sent.command, sent.payload))
            .collect()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }

    pub fn set_publish_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn device(&self, topic: &str) -> FakeDevice {
        self.devices
            .lock()
            .unwrap()
            .iter()
            .find(|device| device.topic == topic)
            .cloned()
            .unwrap()
    }

    pub fn update_device(&self, topic: &str, update: impl FnOnce(&mut FakeDevice)) {
        let mut devices = self.devices.lock().unwrap();
        let device = devices.iter_mut().find(|device| device.topic == topic).unwrap();
        update(device);
    }

    /// Inject a message on every open connection, as if the device sent it.
    pub fn deliver(&self, topic: &str, tag: &str, payload: Payload) {
        for hub in self.hubs.lock().unwrap().iter() {
            hub.deliver(topic, tag, payload.clone());
        }
    }

    fn open(&self) -> FakeConnection {
        let (replies_tx, mut replies_rx) = mpsc::unbounded_channel();
        let devices = Arc::clone(&self.devices);
        let responder: Responder = Arc::new(move |sent: &SentCommand| {
            let mut devices = devices.lock().unwrap();
            devices
                .iter_mut()
                .find(|device| device.topic == sent.topic)
                .map(|device| device.respond(sent))
                .unwrap_or_default()
        });
        let sink = RecordingSink {
            sent: Arc::clone(&self.sent),
            failing: Arc::clone(&self.failing),
            responder: Some((responder, replies_tx)),
        };
        let hub = MessageHub::new(sink);
        let pump = hub.clone();
        tokio::spawn(async move {
            while let Some((topic, tag, payload)) = replies_rx.recv().await {
                pump.deliver(&topic, &tag, payload);
            }
        });
        self.hubs.lock().unwrap().push(hub.clone());
        FakeConnection { hub }
    }
}

impl Broker for FakeBroker {
    type Connection = FakeConnection;

    fn connect(
        &self,
        credentials: &BrokerCredentials,
        _retry: RetryPolicy,
    ) -> impl Future<Output = Result<FakeConnection, ConnectionError>> + Send {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .accepted_password
            .as_ref()
            .is_some_and(|password| *password != credentials.password);
        let host = credentials.host.clone();
        let port = credentials.port;
        let delay = self.connect_delay;
        async move {
            tokio::time::sleep(delay).await;
            if refused {
                return Err(ConnectionError::Connect {
                    host,
                    port,
                    reason: "not authorized".to_string(),
                });
            }
            Ok(self.open())
        }
    }
}

#[derive(Clone)]
pub(crate) struct FakeConnection {
    hub: MessageHub<RecordingSink>,
}

impl BrokerConnection for FakeConnection {
    type Channel = TopicChannel<RecordingSink>;
    type Probe = ProbeHandle<RecordingSink>;

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
        async {}
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RuntimeCall {
    Value(Capability, CapabilityValue),
    Trigger(Trigger),
    Available,
    Unavailable(UnavailableReason),
    Settings(DeviceSettings),
}

/// Records every call the engine makes on the host.
#[derive(Clone, Default)]
pub(crate) struct RecordingRuntime {
    calls: Arc<Mutex<Vec<RuntimeCall>>>,
}

impl RecordingRuntime {
    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn triggers(&self) -> Vec<Trigger> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RuntimeCall::Trigger(trigger) => Some(trigger),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn record(&self, call: RuntimeCall) -> impl Future<Output = Result<(), BridgeError>> + Send {
        self.calls.lock().unwrap().push(call);
        async { Ok(()) }
    }
}

impl DeviceRuntime for RecordingRuntime {
    fn set_capability_value(
        &self,
        capability: Capability,
        value: CapabilityValue,
    ) -> impl Future<Output = Result<(), BridgeError>> + Send {
        self.record(RuntimeCall::Value(capability, value))
    }

    fn trigger(&self, trigger: Trigger) -> impl Future<Output = Result<(), BridgeError>> + Send {
        self.record(RuntimeCall::Trigger(trigger))
    }

    fn set_available(&self) -> impl Future<Output = Result<(), BridgeError>> + Send {
        self.record(RuntimeCall::Available)
    }

    fn set_unavailable(
        &self,
        reason: UnavailableReason,
    ) -> impl Future<Output = Result<(), BridgeError>> + Send {
        self.record(RuntimeCall::Unavailable(reason))
    }

    fn sync_settings(
        &self,
        settings: DeviceSettings,
    ) -> impl Future<Output = Result<(), BridgeError>> + Send {
        self.record(RuntimeCall::Settings(settings))
    }
}

/// Poll `condition` until it holds, letting spawned tasks run in between.
pub(crate) async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}
