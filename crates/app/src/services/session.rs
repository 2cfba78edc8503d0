//! Device session: the live side of one paired device.
//!
//! A session acquires a shared connection, registers the device topic, waits
//! for the device's status and then runs a single message loop that routes
//! reports into the capability cache and re-asserts switch states on a
//! watchdog. Capability writes, flow actions and settings changes enter
//! through [`DeviceSession`].
//!
//! ```text
//! Connecting ──► WaitingForStatus ──► Online ◄──► Offline
//!     │                  │                          ▲
//!     ▼                  └──────────────────────────┘
//!   Closed(connection_error)   (status request failed, retried when back online)
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use tasmobridge_domain::availability::UnavailableReason;
use tasmobridge_domain::capability::{Capability, CapabilityValue};
use tasmobridge_domain::device::{DeviceClass, DeviceRecord};
use tasmobridge_domain::error::{BridgeError, ConnectionError, ValidationError};
use tasmobridge_domain::id::DeviceId;
use tasmobridge_domain::settings::DeviceSettings;

use crate::ports::{
    Broker, BrokerConnection, DeviceChannel, DeviceRuntime, InboundMessage, LinkStatus,
    RetryPolicy,
};
use crate::registry::{DeviceRegistry, RegisteredDevice};
use crate::tasmota::StatusSnapshot;

use super::capability_cache::CapabilityCache;
use super::connection_pool::ConnectionPool;
use super::dispatcher::{self, CapabilityWrite, FlowAction};
use super::router;
use super::settings::{SettingsPlan, confirm_setting};
use super::watchdog::{self, Watchdog};

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    WaitingForStatus,
    Online,
    Offline(UnavailableReason),
    Closed(UnavailableReason),
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => f.write_str("connecting"),
            Self::WaitingForStatus => f.write_str("waiting-for-status"),
            Self::Online => f.write_str("online"),
            Self::Offline(reason) => write!(f, "offline ({reason})"),
            Self::Closed(reason) => write!(f, "closed ({reason})"),
        }
    }
}

/// Timing knobs for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Interval between watchdog passes on switch banks.
    pub watchdog_interval: Duration,
    /// Bound on every settings confirmation.
    pub reply_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            watchdog_interval: Duration::from_secs(300),
            reply_timeout: Duration::from_secs(10),
        }
    }
}

type ChannelOf<B> = <<B as Broker>::Connection as BrokerConnection>::Channel;

struct Link<B: Broker> {
    connection: B::Connection,
    channel: Arc<ChannelOf<B>>,
}

#[derive(Default)]
struct Tasks {
    connect: Option<JoinHandle<()>>,
    drive: Option<JoinHandle<()>>,
    link: Option<JoinHandle<()>>,
}

struct Shared<B: Broker, R> {
    id: DeviceId,
    name: String,
    class: DeviceClass,
    capabilities: Vec<Capability>,
    runtime: R,
    pool: Arc<ConnectionPool<B>>,
    registry: DeviceRegistry,
    config: SessionConfig,
    /// Also serialises settings changes.
    settings: tokio::sync::Mutex<DeviceSettings>,
    link: Mutex<Option<Link<B>>>,
    cache: Mutex<CapabilityCache>,
    state: watch::Sender<SessionState>,
    /// Set once the current channel delivered its status.
    seeded: AtomicBool,
    tasks: Mutex<Tasks>,
}

/// Handle on one running device session.
pub struct DeviceSession<B: Broker, R: DeviceRuntime> {
    shared: Arc<Shared<B, R>>,
}

impl<B: Broker, R: DeviceRuntime> DeviceSession<B, R> {
    /// Start a session for a paired device and register it.
    ///
    /// Connecting happens in the background; follow [`state`](Self::state)
    /// or the host runtime's availability calls to see it come online.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Validation`] if the record is invalid.
    pub fn start(
        record: DeviceRecord,
        runtime: R,
        pool: Arc<ConnectionPool<B>>,
        registry: DeviceRegistry,
        config: SessionConfig,
    ) -> Result<Self, BridgeError> {
        record.validate()?;
        let (state, state_rx) = watch::channel(SessionState::Connecting);
        registry.insert(RegisteredDevice {
            id: record.id.clone(),
            name: record.name.clone(),
            class: record.class,
            topic: record.settings.topic.clone(),
            state: state_rx,
        });
        tracing::info!(
            device_id = %record.id,
            topic = %record.settings.topic,
            class = %record.class,
            "starting device session"
        );

        let shared = Arc::new(Shared {
            id: record.id,
            name: record.name,
            class: record.class,
            capabilities: record.capabilities,
            runtime,
            pool,
            registry,
            config,
            settings: tokio::sync::Mutex::new(record.settings),
            link: Mutex::new(None),
            cache: Mutex::new(CapabilityCache::new()),
            state,
            seeded: AtomicBool::new(false),
            tasks: Mutex::new(Tasks::default()),
        });
        let connect = tokio::spawn(Arc::clone(&shared).connect());
        shared.tasks().connect = Some(connect);

        Ok(Self { shared })
    }

    #[must_use]
    pub fn id(&self) -> &DeviceId {
        &self.shared.id
    }

    #[must_use]
    pub fn class(&self) -> DeviceClass {
        self.shared.class
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Follow state transitions.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// The settings currently in effect.
    pub async fn settings(&self) -> DeviceSettings {
        self.shared.settings.lock().await.clone()
    }

    /// Last known value of a capability.
    #[must_use]
    pub fn capability_value(&self, capability: Capability) -> Option<CapabilityValue> {
        self.shared.cache().get(capability)
    }

    /// Dispatch a capability write as one device command.
    ///
    /// Returns once the command is sent; the device's confirmation arrives
    /// through the message loop like any other report.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::Validation`] if the device lacks the capability or the value is invalid.
    /// - [`BridgeError::Connection`] if the device has no connection or sending fails.
    #[tracing::instrument(skip(self), fields(device_id = %self.shared.id))]
    pub async fn write(&self, write: CapabilityWrite) -> Result<(), BridgeError> {
        let capability = write.capability();
        if !self.shared.capabilities.contains(&capability) {
            return Err(ValidationError::MissingCapability(capability.to_string()).into());
        }
        let command = dispatcher::translate(write)?;
        let channel = self.shared.channel().ok_or(ConnectionError::NotConnected)?;

        if let Some(value) = write.resulting_value() {
            self.shared.cache().store(capability, value);
        }
        channel
            .send_command(&command.command, command.payload.as_deref())
            .await?;
        tracing::debug!(%command, "command dispatched");
        Ok(())
    }

    /// Write a value to one capability.
    ///
    /// # Errors
    ///
    /// See [`write`](Self::write).
    pub async fn set_capability(
        &self,
        capability: Capability,
        value: CapabilityValue,
    ) -> Result<(), BridgeError> {
        self.write(CapabilityWrite::from_value(capability, value)?)
            .await
    }

    /// Stop a moving shutter.
    ///
    /// # Errors
    ///
    /// See [`write`](Self::write).
    pub async fn stop(&self) -> Result<(), BridgeError> {
        self.write(CapabilityWrite::Stop).await
    }

    /// Run a flow action and report the resulting value to the host.
    ///
    /// # Errors
    ///
    /// See [`write`](Self::write); host runtime failures are returned too.
    #[tracing::instrument(skip(self), fields(device_id = %self.shared.id, %action))]
    pub async fn run_action(&self, action: FlowAction) -> Result<(), BridgeError> {
        let write = action.resolve(|index| self.shared.cache().switch(index));
        self.write(write).await?;
        if let Some(value) = write.resulting_value() {
            self.shared
                .runtime
                .set_capability_value(write.capability(), value)
                .await?;
        }
        Ok(())
    }

    /// Validate and apply a settings change as one transaction.
    ///
    /// New broker credentials are validated on a fresh connection (no
    /// retries) before the current one is given up; a topic change
    /// registers the new topic first. Power-on state and LED state are sent
    /// to the device and must be confirmed with the requested value. Nothing
    /// is applied unless every step succeeds.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::Validation`] for an empty topic or broker host.
    /// - [`BridgeError::Connection`] if the new connection cannot be opened.
    /// - [`BridgeError::Timeout`] if the device does not confirm in time.
    /// - [`BridgeError::ValueMismatch`] if the device confirms another value.
    #[tracing::instrument(skip(self, requested), fields(device_id = %self.shared.id))]
    pub async fn update_settings(&self, requested: DeviceSettings) -> Result<(), BridgeError> {
        let shared = &self.shared;
        let mut current = shared.settings.lock().await;
        let plan = SettingsPlan::new(&current, &requested);
        if plan.is_empty() {
            return Ok(());
        }
        if requested.topic.trim().is_empty() {
            return Err(ValidationError::EmptyTopic.into());
        }
        requested.broker.validate()?;

        let replacement = if plan.reconnect || plan.retopic {
            let connection = if plan.reconnect {
                shared
                    .pool
                    .acquire(&requested.broker, RetryPolicy::FailFast)
                    .await?
            } else {
                shared.connection().ok_or(ConnectionError::NotConnected)?
            };
            let channel = connection.register_topic(&requested.topic)?;
            Some((connection, channel))
        } else {
            None
        };

        let confirmed = match &replacement {
            Some((_, channel)) => shared.confirm_all(channel, &plan).await,
            None => match shared.channel() {
                Some(channel) => shared.confirm_all(channel.as_ref(), &plan).await,
                None if plan.confirmations.is_empty() => Ok(()),
                None => Err(ConnectionError::NotConnected.into()),
            },
        };
        if let Err(err) = confirmed {
            if let Some((connection, channel)) = &replacement {
                channel.close();
                if plan.reconnect {
                    shared.pool.release(&requested.broker, connection).await;
                }
            }
            tracing::warn!(%err, "settings change rejected");
            return Err(err);
        }

        let previous = if plan.reconnect {
            shared.connection()
        } else {
            None
        };
        if let Some((connection, channel)) = replacement {
            shared.attach(connection, channel);
        }
        if let Some(previous) = previous {
            shared.pool.release(&current.broker, &previous).await;
        }
        shared.registry.insert(RegisteredDevice {
            id: shared.id.clone(),
            name: shared.name.clone(),
            class: shared.class,
            topic: requested.topic.clone(),
            state: shared.state.subscribe(),
        });
        *current = requested;
        tracing::info!(changed = ?plan.changed, "settings change accepted");
        Ok(())
    }

    /// Tear the session down: stop its tasks, close its topic registration
    /// and remove it from the registry.
    #[tracing::instrument(skip(self), fields(device_id = %self.shared.id))]
    pub fn delete(&self) {
        let shared = &self.shared;
        {
            let mut tasks = shared.tasks();
            for handle in [tasks.connect.take(), tasks.drive.take(), tasks.link.take()]
                .into_iter()
                .flatten()
            {
                handle.abort();
            }
        }
        let link = shared.link().take();
        if let Some(link) = link {
            link.channel.close();
        }
        shared.registry.remove(&shared.id);
        shared.set_state(SessionState::Closed(UnavailableReason::Deleted));
        tracing::info!("device session deleted");
    }
}

impl<B: Broker, R: DeviceRuntime> Shared<B, R> {
    async fn connect(self: Arc<Self>) {
        self.set_state(SessionState::Connecting);
        self.unavailable(UnavailableReason::WaitingForBroker).await;

        let settings = self.settings.lock().await.clone();
        let registered = match self.pool.acquire(&settings.broker, RetryPolicy::Retry).await {
            Ok(connection) => connection
                .register_topic(&settings.topic)
                .map(|channel| (connection, channel)),
            Err(err) => Err(err),
        };

        match registered {
            Ok((connection, channel)) => self.attach(connection, channel),
            Err(err) => {
                tracing::warn!(device_id = %self.id, %err, "could not connect device");
                self.set_state(SessionState::Closed(UnavailableReason::ConnectionError));
                self.unavailable(UnavailableReason::ConnectionError).await;
            }
        }
    }

    /// Make `channel` the session's registration and start its tasks.
    fn attach(self: &Arc<Self>, connection: B::Connection, channel: ChannelOf<B>) {
        let channel = Arc::new(channel);
        let link_status = channel.link_status();
        let previous = self.link().replace(Link {
            connection,
            channel: Arc::clone(&channel),
        });

        {
            let mut tasks = self.tasks();
            for handle in [tasks.drive.take(), tasks.link.take()].into_iter().flatten() {
                handle.abort();
            }
            self.seeded.store(false, Ordering::SeqCst);
            tasks.drive = Some(tokio::spawn(Arc::clone(self).drive(channel)));
            tasks.link = Some(tokio::spawn(Arc::clone(self).watch_link(link_status)));
        }

        if let Some(previous) = previous {
            previous.channel.close();
        }
    }

    /// The message loop. Ends when the channel closes.
    async fn drive(self: Arc<Self>, channel: Arc<ChannelOf<B>>) {
        self.set_state(SessionState::WaitingForStatus);
        self.unavailable(UnavailableReason::WaitingForDevice).await;

        let snapshot = loop {
            if let Some(snapshot) = channel.await_initial_status().await {
                break snapshot;
            }
            tracing::warn!(device_id = %self.id, "device status did not arrive");
            let mut link = channel.link_status();
            link.mark_unchanged();
            self.set_state(SessionState::Offline(UnavailableReason::ConnectionLost));
            self.unavailable(UnavailableReason::ConnectionLost).await;
            if !next_online(&mut link).await {
                tracing::debug!(
                    device_id = %self.id,
                    topic = %channel.topic(),
                    "channel closed before status"
                );
                return;
            }
        };
        self.go_online(&snapshot).await;

        let mut watchdog = Watchdog::new(self.config.watchdog_interval);
        if self.class == DeviceClass::SwitchBank {
            watchdog.arm();
        }

        loop {
            tokio::select! {
                message = channel.next_message() => {
                    let Some(message) = message else {
                        break;
                    };
                    self.handle_message(&message).await;
                }
                () = watchdog.fired() => {
                    self.reassert(channel.as_ref()).await;
                    watchdog.arm();
                }
            }
        }
        tracing::debug!(device_id = %self.id, topic = %channel.topic(), "message loop ended");
    }

    async fn go_online(&self, snapshot: &StatusSnapshot) {
        let seeded: Vec<(Capability, CapabilityValue)> = {
            let mut cache = self.cache();
            self.capabilities
                .iter()
                .filter_map(|capability| {
                    let on = snapshot.switch(capability.switch_index()?)?;
                    let value = CapabilityValue::Bool(on);
                    cache.seed(*capability, value);
                    Some((*capability, value))
                })
                .collect()
        };
        for (capability, value) in seeded {
            let result = self.runtime.set_capability_value(capability, value).await;
            self.report("set_capability_value", result);
        }

        self.sync_settings(snapshot).await;
        self.seeded.store(true, Ordering::SeqCst);
        self.set_state(SessionState::Online);
        let result = self.runtime.set_available().await;
        self.report("set_available", result);
    }

    async fn sync_settings(&self, snapshot: &StatusSnapshot) {
        let mut settings = self.settings.lock().await;
        let mut synced = settings.clone();
        if let Some(topic) = snapshot.topic.as_ref().filter(|topic| !topic.is_empty()) {
            synced.topic.clone_from(topic);
        }
        if let Some(power_on_state) = &snapshot.power_on_state {
            synced.power_on_state.clone_from(power_on_state);
        }
        if let Some(led_state) = &snapshot.led_state {
            synced.led_state.clone_from(led_state);
        }
        if synced == *settings {
            return;
        }
        settings.clone_from(&synced);
        drop(settings);

        tracing::debug!(device_id = %self.id, "settings synchronised from device");
        let result = self.runtime.sync_settings(synced).await;
        self.report("sync_settings", result);
    }

    async fn handle_message(&self, message: &InboundMessage) {
        let observations = router::route(self.class, &self.capabilities, message);
        if observations.is_empty() {
            tracing::trace!(device_id = %self.id, command = %message.command, "ignoring message");
            return;
        }

        for observation in observations {
            let applied = self.cache().apply(observation);
            if let Some(value) = applied.changed {
                tracing::debug!(
                    device_id = %self.id,
                    capability = %applied.capability,
                    %value,
                    "capability changed"
                );
                let result = self
                    .runtime
                    .set_capability_value(applied.capability, value)
                    .await;
                self.report("set_capability_value", result);
            }
            if let Some(trigger) = applied.trigger {
                tracing::info!(device_id = %self.id, %trigger, "trigger fired");
                let result = self.runtime.trigger(trigger).await;
                self.report("trigger", result);
            }
        }
    }

    /// One watchdog pass. Failures are logged; the caller always re-arms.
    async fn reassert(&self, channel: &ChannelOf<B>) {
        let commands = watchdog::reassert_commands(&self.cache(), &self.capabilities);
        tracing::debug!(device_id = %self.id, count = commands.len(), "watchdog pass");
        for command in commands {
            if let Err(err) = channel
                .send_command(&command.command, command.payload.as_deref())
                .await
            {
                tracing::warn!(device_id = %self.id, %err, %command, "watchdog command failed");
            }
        }
    }

    async fn watch_link(self: Arc<Self>, mut link: watch::Receiver<LinkStatus>) {
        while link.changed().await.is_ok() {
            let status = *link.borrow_and_update();
            match status {
                LinkStatus::Offline => {
                    tracing::warn!(device_id = %self.id, "device went offline");
                    self.set_state(SessionState::Offline(UnavailableReason::ConnectionLost));
                    self.unavailable(UnavailableReason::ConnectionLost).await;
                }
                LinkStatus::Online if self.seeded.load(Ordering::SeqCst) => {
                    tracing::info!(device_id = %self.id, "device back online");
                    self.set_state(SessionState::Online);
                    let result = self.runtime.set_available().await;
                    self.report("set_available", result);
                }
                LinkStatus::Online => {
                    let waiting = self.state.send_if_modified(|state| {
                        let offline = matches!(state, SessionState::Offline(_));
                        if offline {
                            *state = SessionState::WaitingForStatus;
                        }
                        offline
                    });
                    if waiting {
                        tracing::info!(device_id = %self.id, "device online, waiting for status");
                    }
                }
            }
        }
    }

    async fn confirm_all(
        &self,
        channel: &ChannelOf<B>,
        plan: &SettingsPlan,
    ) -> Result<(), BridgeError> {
        for (command, requested) in &plan.confirmations {
            confirm_setting(channel, command, requested, self.config.reply_timeout).await?;
        }
        Ok(())
    }

    async fn unavailable(&self, reason: UnavailableReason) {
        let result = self.runtime.set_unavailable(reason).await;
        self.report("set_unavailable", result);
    }

    fn report(&self, call: &'static str, result: Result<(), BridgeError>) {
        if let Err(err) = result {
            tracing::warn!(device_id = %self.id, call, %err, "host runtime call failed");
        }
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::info!(device_id = %self.id, %state, "session state changed");
        }
    }

    fn channel(&self) -> Option<Arc<ChannelOf<B>>> {
        self.link().as_ref().map(|link| Arc::clone(&link.channel))
    }

    fn connection(&self) -> Option<B::Connection> {
        self.link().as_ref().map(|link| link.connection.clone())
    }

    fn cache(&self) -> MutexGuard<'_, CapabilityCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn link(&self) -> MutexGuard<'_, Option<Link<B>>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tasks(&self) -> MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Wait for the next `Online` signal. Returns `false` once the channel closes.
async fn next_online(link: &mut watch::Receiver<LinkStatus>) -> bool {
    while link.changed().await.is_ok() {
        if *link.borrow_and_update() == LinkStatus::Online {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBroker, FakeDevice, RecordingRuntime, RuntimeCall, eventually};
    use serde_json::json;
    use tasmobridge_domain::capability::SwitchIndex;
    use tasmobridge_domain::credentials::BrokerCredentials;
    use tasmobridge_domain::trigger::Trigger;

    fn switch(n: u8) -> SwitchIndex {
        SwitchIndex::new(n).unwrap()
    }

    fn onoff(n: u8) -> Capability {
        Capability::OnOff(switch(n))
    }

    fn record(topic: &str, class: DeviceClass, capabilities: Vec<Capability>) -> DeviceRecord {
        DeviceRecord::builder(DeviceId::from_mac("A4:CF:12:0B:3E:7D").unwrap(), class)
            .capabilities(capabilities)
            .settings(DeviceSettings {
                topic: topic.to_string(),
                ..DeviceSettings::default()
            })
            .build()
            .unwrap()
    }

    fn dual(topic: &str) -> DeviceRecord {
        record(topic, DeviceClass::SwitchBank, vec![onoff(1), onoff(2)])
    }

    struct Harness {
        pool: Arc<ConnectionPool<FakeBroker>>,
        runtime: RecordingRuntime,
        registry: DeviceRegistry,
        session: DeviceSession<FakeBroker, RecordingRuntime>,
    }

    impl Harness {
        fn start(broker: FakeBroker, record: DeviceRecord) -> Self {
            let pool = Arc::new(ConnectionPool::new(broker));
            let runtime = RecordingRuntime::default();
            let registry = DeviceRegistry::new();
            let session = DeviceSession::start(
                record,
                runtime.clone(),
                Arc::clone(&pool),
                registry.clone(),
                SessionConfig::default(),
            )
            .unwrap();
            Self {
                pool,
                runtime,
                registry,
                session,
            }
        }

        fn broker(&self) -> &FakeBroker {
            self.pool.broker()
        }

        async fn online(&self) {
            eventually(|| self.session.state() == SessionState::Online).await;
        }
    }

    #[tokio::test]
    async fn should_seed_cache_from_status_without_triggers() {
        let mut device = FakeDevice::switch_bank("dual", 2);
        device.power = [true, false, false, false];
        let h = Harness::start(FakeBroker::new(vec![device]), dual("dual"));

        h.online().await;

        let calls = h.runtime.calls();
        assert!(calls.contains(&RuntimeCall::Value(onoff(1), CapabilityValue::Bool(true))));
        assert!(calls.contains(&RuntimeCall::Value(onoff(2), CapabilityValue::Bool(false))));
        assert!(calls.contains(&RuntimeCall::Available));
        assert!(h.runtime.triggers().is_empty());
        assert_eq!(h.session.capability_value(onoff(1)), Some(CapabilityValue::Bool(true)));
        assert_eq!(h.registry.list()[0].state, SessionState::Online);
    }

    #[tokio::test]
    async fn should_adopt_settings_reported_by_device() {
        let h = Harness::start(
            FakeBroker::new(vec![FakeDevice::switch_bank("dual", 2)]),
            dual("dual"),
        );
        h.online().await;

        let settings = h.session.settings().await;
        assert_eq!(settings.power_on_state, "3");
        assert_eq!(settings.led_state, "1");
        assert!(
            h.runtime
                .calls()
                .iter()
                .any(|call| matches!(call, RuntimeCall::Settings(s) if s.led_state == "1"))
        );
    }

    #[tokio::test]
    async fn should_trigger_once_per_flip_for_every_switch_in_a_message() {
        let h = Harness::start(
            FakeBroker::new(vec![FakeDevice::switch_bank("dual", 2)]),
            dual("dual"),
        );
        h.online().await;

        h.broker()
            .deliver("dual", "STATE", json!({"POWER1": "ON", "POWER2": "ON"}));
        h.broker()
            .deliver("dual", "STATE", json!({"POWER1": "ON", "POWER2": "ON"}));
        h.broker().deliver("dual", "POWER2", json!("OFF"));

        let expected = vec![
            Trigger::switch(switch(1), true),
            Trigger::switch(switch(2), true),
            Trigger::switch(switch(2), false),
        ];
        eventually(|| h.runtime.triggers().len() == 3).await;
        assert_eq!(h.runtime.triggers(), expected);
    }

    #[tokio::test]
    async fn should_emit_shutter_opened_only_when_settled() {
        let h = Harness::start(
            FakeBroker::new(vec![FakeDevice::shutter("blind")]),
            record("blind", DeviceClass::Shutter, vec![Capability::Position]),
        );
        h.online().await;

        h.broker().deliver(
            "blind",
            "SENSOR",
            json!({"Shutter1": {"Position": 100, "Direction": -1, "Target": 80}}),
        );
        h.broker().deliver(
            "blind",
            "RESULT",
            json!({"Shutter1": {"Position": 100, "Direction": 0, "Target": 100}}),
        );

        eventually(|| !h.runtime.triggers().is_empty()).await;
        assert_eq!(h.runtime.triggers(), vec![Trigger::ShutterOpened]);
        assert_eq!(
            h.session.capability_value(Capability::Position),
            Some(CapabilityValue::Position(1.0))
        );
    }

    #[tokio::test]
    async fn should_close_with_connection_error_when_broker_refuses() {
        let h = Harness::start(
            FakeBroker::new(Vec::new()).with_password("secret"),
            dual("dual"),
        );

        eventually(|| {
            h.session.state() == SessionState::Closed(UnavailableReason::ConnectionError)
        })
        .await;
        assert!(
            h.runtime
                .calls()
                .contains(&RuntimeCall::Unavailable(UnavailableReason::ConnectionError))
        );

        let err = h
            .session
            .write(CapabilityWrite::Switch {
                index: switch(1),
                on: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Connection(ConnectionError::NotConnected)));
    }

    #[tokio::test]
    async fn should_go_offline_when_status_can_never_arrive() {
        let mut device = FakeDevice::switch_bank("dual", 2);
        device.ignore_status = true;
        let h = Harness::start(FakeBroker::new(vec![device]), dual("dual"));
        eventually(|| h.session.state() == SessionState::WaitingForStatus).await;

        h.pool.close_all().await;

        eventually(|| {
            h.session.state() == SessionState::Offline(UnavailableReason::ConnectionLost)
        })
        .await;
        assert!(!h.runtime.calls().contains(&RuntimeCall::Available));
    }

    #[tokio::test]
    async fn should_request_status_again_when_device_comes_back_online() {
        let broker = FakeBroker::new(vec![FakeDevice::switch_bank("dual", 2)]);
        broker.set_publish_failing(true);
        let h = Harness::start(broker, dual("dual"));
        eventually(|| {
            h.session.state() == SessionState::Offline(UnavailableReason::ConnectionLost)
        })
        .await;

        h.broker().set_publish_failing(false);
        h.broker().clear_sent();
        h.broker().deliver("dual", "LWT", json!("Online"));
        h.online().await;

        assert_eq!(
            h.broker().sent_to("dual"),
            vec![("status".to_string(), String::new())]
        );
        h.broker().deliver("dual", "POWER1", json!("ON"));
        eventually(|| h.runtime.triggers() == vec![Trigger::switch(switch(1), true)]).await;
    }

    #[tokio::test]
    async fn should_follow_device_availability_and_keep_processing() {
        let h = Harness::start(
            FakeBroker::new(vec![FakeDevice::switch_bank("dual", 2)]),
            dual("dual"),
        );
        h.online().await;

        h.broker().deliver("dual", "LWT", json!("Offline"));
        eventually(|| {
            h.session.state() == SessionState::Offline(UnavailableReason::ConnectionLost)
        })
        .await;

        h.broker().deliver("dual", "LWT", json!("Online"));
        h.online().await;

        h.broker().deliver("dual", "POWER1", json!("ON"));
        eventually(|| h.runtime.triggers() == vec![Trigger::switch(switch(1), true)]).await;
    }

    #[tokio::test]
    async fn should_dispatch_writes_without_retriggering_on_confirmation() {
        let h = Harness::start(
            FakeBroker::new(vec![FakeDevice::switch_bank("dual", 2)]),
            dual("dual"),
        );
        h.online().await;
        h.broker().clear_sent();

        h.session
            .set_capability(onoff(2), CapabilityValue::Bool(true))
            .await
            .unwrap();

        assert_eq!(
            h.broker().sent_to("dual"),
            vec![("power2".to_string(), "on".to_string())]
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.runtime.triggers().is_empty());
        assert_eq!(h.session.capability_value(onoff(2)), Some(CapabilityValue::Bool(true)));
    }

    #[tokio::test]
    async fn should_reject_write_to_missing_capability() {
        let h = Harness::start(
            FakeBroker::new(vec![FakeDevice::switch_bank("dual", 2)]),
            dual("dual"),
        );
        h.online().await;

        let err = h
            .session
            .set_capability(onoff(3), CapabilityValue::Bool(true))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Validation(ValidationError::MissingCapability(_))
        ));
        assert!(h.session.stop().await.is_err());
    }

    #[tokio::test]
    async fn should_dispatch_shutter_commands() {
        let h = Harness::start(
            FakeBroker::new(vec![FakeDevice::shutter("blind")]),
            record("blind", DeviceClass::Shutter, vec![Capability::Position]),
        );
        h.online().await;
        h.broker().clear_sent();

        h.session.write(CapabilityWrite::Position(0.37)).await.unwrap();
        h.session.stop().await.unwrap();
        h.session.run_action(FlowAction::ShutterOpen).await.unwrap();

        assert_eq!(
            h.broker().sent_to("blind"),
            vec![
                ("shutterposition".to_string(), "37".to_string()),
                ("shutterstop".to_string(), String::new()),
                ("shutteropen".to_string(), String::new()),
            ]
        );
    }

    #[tokio::test]
    async fn should_toggle_against_cached_value_and_report_result() {
        let mut device = FakeDevice::switch_bank("dual", 2);
        device.power = [true, false, false, false];
        let h = Harness::start(FakeBroker::new(vec![device]), dual("dual"));
        h.online().await;
        h.broker().clear_sent();
        h.runtime.clear();

        h.session
            .run_action(FlowAction::SwitchToggle(switch(1)))
            .await
            .unwrap();

        assert_eq!(
            h.broker().sent_to("dual"),
            vec![("power1".to_string(), "off".to_string())]
        );
        assert_eq!(
            h.runtime.calls()[0],
            RuntimeCall::Value(onoff(1), CapabilityValue::Bool(false))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn should_reassert_cached_switch_states_every_interval() {
        let mut device = FakeDevice::switch_bank("dual", 2);
        device.power = [true, false, false, false];
        let h = Harness::start(FakeBroker::new(vec![device]), dual("dual"));
        h.online().await;
        h.broker().clear_sent();

        tokio::time::advance(Duration::from_secs(300)).await;
        eventually(|| h.broker().sent_to("dual").len() == 2).await;
        assert_eq!(
            h.broker().sent_to("dual"),
            vec![
                ("power1".to_string(), "on".to_string()),
                ("power2".to_string(), "off".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn should_keep_watchdog_running_after_failed_pass() {
        let h = Harness::start(
            FakeBroker::new(vec![FakeDevice::switch_bank("dual", 2)]),
            dual("dual"),
        );
        h.online().await;
        h.broker().clear_sent();

        h.broker().set_publish_failing(true);
        tokio::time::advance(Duration::from_secs(300)).await;
        eventually(|| h.broker().sent_to("dual").len() == 2).await;

        h.broker().set_publish_failing(false);
        tokio::time::advance(Duration::from_secs(300)).await;
        eventually(|| h.broker().sent_to("dual").len() == 4).await;
    }

    #[tokio::test(start_paused = true)]
    async fn should_not_run_watchdog_for_shutters() {
        let h = Harness::start(
            FakeBroker::new(vec![FakeDevice::shutter("blind")]),
            record("blind", DeviceClass::Shutter, vec![Capability::Position]),
        );
        h.online().await;
        h.broker().clear_sent();

        tokio::time::advance(Duration::from_secs(900)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(h.broker().sent().is_empty());
    }

    #[tokio::test]
    async fn should_apply_confirmed_settings() {
        let h = Harness::start(
            FakeBroker::new(vec![FakeDevice::switch_bank("dual", 2)]),
            dual("dual"),
        );
        h.online().await;

        let mut requested = h.session.settings().await;
        requested.led_state = "0".to_string();
        requested.group_topic = "tasmotas".to_string();
        h.session.update_settings(requested.clone()).await.unwrap();

        assert_eq!(h.session.settings().await, requested);
        assert_eq!(h.broker().device("dual").led_state, "0");
    }

    #[tokio::test]
    async fn should_reject_mismatch_and_keep_previous_setting() {
        let mut device = FakeDevice::switch_bank("dual", 2);
        device.power_on_state = "OFF".to_string();
        device.confirm_override = Some("OFF".to_string());
        let h = Harness::start(FakeBroker::new(vec![device]), dual("dual"));
        h.online().await;
        assert_eq!(h.session.settings().await.power_on_state, "OFF");

        let mut requested = h.session.settings().await;
        requested.power_on_state = "ON".to_string();
        let err = h.session.update_settings(requested).await.unwrap_err();

        assert!(matches!(err, BridgeError::ValueMismatch(_)));
        assert_eq!(h.session.settings().await.power_on_state, "OFF");
    }

    #[tokio::test(start_paused = true)]
    async fn should_time_out_unconfirmed_settings() {
        let mut device = FakeDevice::switch_bank("dual", 2);
        device.ignore_settings = true;
        let h = Harness::start(FakeBroker::new(vec![device]), dual("dual"));
        h.online().await;

        let mut requested = h.session.settings().await;
        requested.led_state = "2".to_string();
        let err = h.session.update_settings(requested).await.unwrap_err();

        assert!(matches!(err, BridgeError::Timeout(_)));
        assert_eq!(h.session.settings().await.led_state, "1");
        assert_eq!(h.session.state(), SessionState::Online);
    }

    #[tokio::test]
    async fn should_keep_working_connection_when_new_credentials_fail() {
        let broker = FakeBroker::new(vec![FakeDevice::switch_bank("dual", 2)]).with_password("");
        let h = Harness::start(broker, dual("dual"));
        h.online().await;

        let mut requested = h.session.settings().await;
        requested.broker = BrokerCredentials::new("localhost", 1883, "user", "wrong");
        let err = h.session.update_settings(requested).await.unwrap_err();

        assert!(matches!(err, BridgeError::Connection(ConnectionError::Connect { .. })));
        assert_eq!(h.session.settings().await.broker, BrokerCredentials::default());
        h.broker().deliver("dual", "POWER1", json!("ON"));
        eventually(|| h.runtime.triggers().len() == 1).await;
    }

    #[tokio::test]
    async fn should_keep_old_link_when_reconnected_settings_are_rejected() {
        let mut device = FakeDevice::switch_bank("dual", 2);
        device.confirm_override = Some("1".to_string());
        let h = Harness::start(FakeBroker::new(vec![device]), dual("dual"));
        h.online().await;

        let mut requested = h.session.settings().await;
        requested.broker = BrokerCredentials::new("localhost", 1884, "user", "secret");
        requested.led_state = "2".to_string();
        let err = h.session.update_settings(requested).await.unwrap_err();

        assert!(matches!(err, BridgeError::ValueMismatch(_)));
        assert_eq!(h.broker().connects(), 2);
        assert_eq!(h.pool.len(), 1);
        assert_eq!(h.session.settings().await.broker, BrokerCredentials::default());

        h.broker().deliver("dual", "POWER1", json!("ON"));
        eventually(|| h.runtime.triggers() == vec![Trigger::switch(switch(1), true)]).await;
    }

    #[tokio::test]
    async fn should_move_to_new_connection_when_credentials_change() {
        let h = Harness::start(
            FakeBroker::new(vec![FakeDevice::switch_bank("dual", 2)]),
            dual("dual"),
        );
        h.online().await;

        let mut requested = h.session.settings().await;
        requested.broker = BrokerCredentials::new("localhost", 1884, "user", "secret");
        h.session.update_settings(requested.clone()).await.unwrap();
        h.online().await;

        assert_eq!(h.broker().connects(), 2);
        assert_eq!(h.pool.len(), 1);
        assert_eq!(h.session.settings().await.broker, requested.broker);

        h.broker().deliver("dual", "POWER1", json!("ON"));
        eventually(|| !h.runtime.triggers().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.runtime.triggers(), vec![Trigger::switch(switch(1), true)]);
    }

    #[tokio::test]
    async fn should_register_new_topic_on_topic_change() {
        let h = Harness::start(
            FakeBroker::new(vec![FakeDevice::switch_bank("dual", 2)]),
            dual("dual"),
        );
        h.online().await;
        h.broker().update_device("dual", |device| device.topic = "kitchen".to_string());

        let mut requested = h.session.settings().await;
        requested.topic = "kitchen".to_string();
        h.session.update_settings(requested).await.unwrap();
        eventually(|| h.registry.list()[0].topic == "kitchen").await;
        h.online().await;

        h.broker().deliver("dual", "POWER1", json!("ON"));
        h.broker().deliver("kitchen", "POWER2", json!("ON"));
        eventually(|| !h.runtime.triggers().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.runtime.triggers(), vec![Trigger::switch(switch(2), true)]);
    }

    #[tokio::test]
    async fn should_unregister_and_stop_on_delete() {
        let h = Harness::start(
            FakeBroker::new(vec![FakeDevice::switch_bank("dual", 2)]),
            dual("dual"),
        );
        h.online().await;

        h.session.delete();

        assert!(h.registry.is_empty());
        assert_eq!(
            h.session.state(),
            SessionState::Closed(UnavailableReason::Deleted)
        );
        h.broker().deliver("dual", "POWER1", json!("ON"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.runtime.triggers().is_empty());
        assert!(h.session.stop().await.is_err());
    }
}
