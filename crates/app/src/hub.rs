//! In-process message hub shared by broker adapters.
//!
//! An adapter owns the transport; the hub owns the fan-out. For every
//! inbound `(topic, tag, payload)` the hub
//!
//! 1. resolves correlated reply waiters (`<tag>` or `<tag>.<field>`),
//! 2. latches a pending discovery probe onto an announcing device (`info1`),
//! 3. turns `lwt` messages into per-topic online/offline signals,
//! 4. forwards everything else to the registered topic's message stream.
//!
//! Outbound commands go through the adapter's [`CommandSink`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, oneshot, watch};

use tasmobridge_domain::capability::Capability;
use tasmobridge_domain::error::ConnectionError;

use crate::ports::{
    DeviceChannel, InboundMessage, LinkStatus, Payload, ProbeChannel, ReplyKey,
};
use crate::tasmota::{self, Announcement, StatusSnapshot};

/// Outbound half of a transport: publishes one command to one device topic.
pub trait CommandSink: Send + Sync + 'static {
    /// Publish `command` with `payload` (empty for a query) to `topic`.
    fn publish(
        &self,
        topic: &str,
        command: &str,
        payload: &str,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send;
}

/// Fan-out of inbound messages for one connection.
pub struct MessageHub<S> {
    inner: Arc<HubInner<S>>,
}

impl<S> Clone for MessageHub<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct HubInner<S> {
    sink: S,
    next_id: AtomicU64,
    state: Mutex<HubState>,
}

struct HubState {
    topics: HashMap<String, TopicSlot>,
    waiters: Vec<Waiter>,
    probe: Option<ProbeSlot>,
    broker_link: LinkStatus,
    closed: bool,
}

struct TopicSlot {
    id: u64,
    messages: mpsc::UnboundedSender<InboundMessage>,
    link: watch::Sender<LinkStatus>,
}

struct Waiter {
    topic: String,
    key: ReplyKey,
    reply: oneshot::Sender<Payload>,
}

impl Waiter {
    fn resolve(&self, topic: &str, tag: &str, payload: &Payload) -> Option<Payload> {
        if self.topic != topic {
            return None;
        }
        let key = self.key.as_str();
        if key == tag {
            return Some(payload.clone());
        }
        let (key_tag, key_field) = key.split_once('.')?;
        if key_tag != tag {
            return None;
        }
        tasmota::field(payload, key_field).cloned()
    }
}

struct ProbeSlot {
    id: u64,
    announcement: Option<oneshot::Sender<Announcement>>,
}

impl<S: CommandSink> MessageHub<S> {
    /// Create a hub that publishes through `sink`.
    pub fn new(sink: S) -> Self {
        Self {
            inner: Arc::new(HubInner {
                sink,
                next_id: AtomicU64::new(1),
                state: Mutex::new(HubState {
                    topics: HashMap::new(),
                    waiters: Vec::new(),
                    probe: None,
                    broker_link: LinkStatus::Online,
                    closed: false,
                }),
            }),
        }
    }

    /// The adapter's sink.
    pub fn sink(&self) -> &S {
        &self.inner.sink
    }

    /// Whether both handles share the same hub.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Register a per-device handle, replacing any previous one for `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Closed`] after [`shutdown`](Self::shutdown).
    pub fn register_topic(&self, topic: &str) -> Result<TopicChannel<S>, ConnectionError> {
        let id = self.next_id();
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        if state.closed {
            return Err(ConnectionError::Closed);
        }
        let (link_tx, link_rx) = watch::channel(state.broker_link);
        let replaced = state.topics.insert(
            topic.to_string(),
            TopicSlot {
                id,
                messages: messages_tx,
                link: link_tx,
            },
        );
        drop(state);
        if replaced.is_some() {
            tracing::debug!(%topic, "replaced existing topic registration");
        }

        Ok(TopicChannel {
            hub: self.clone(),
            topic: topic.to_string(),
            id,
            messages: tokio::sync::Mutex::new(messages_rx),
            link: link_rx,
        })
    }

    /// Register a probe for the next device that announces itself.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Closed`] after [`shutdown`](Self::shutdown).
    pub fn register_any_device(&self) -> Result<ProbeHandle<S>, ConnectionError> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();
        if state.closed {
            return Err(ConnectionError::Closed);
        }
        state.probe = Some(ProbeSlot {
            id,
            announcement: Some(tx),
        });
        drop(state);

        Ok(ProbeHandle {
            hub: self.clone(),
            id,
            pending: tokio::sync::Mutex::new(Some(rx)),
            latched: Mutex::new(None),
        })
    }

    /// Route one inbound message.
    pub fn deliver(&self, topic: &str, tag: &str, payload: Payload) {
        let tag = tag.to_ascii_lowercase();
        let mut state = self.lock();
        if state.closed {
            return;
        }

        if tag == "lwt" {
            if let Some(status) = parse_lwt(&payload) {
                if let Some(slot) = state.topics.get(topic) {
                    slot.link.send_replace(status);
                }
            }
            return;
        }

        if tag == "info1" {
            if let Some(sender) = state.probe.as_mut().and_then(|p| p.announcement.take()) {
                tracing::debug!(%topic, "probe latched onto announcing device");
                let _ = sender.send(Announcement::from_payload(topic, &payload));
            }
        }

        let waiters = std::mem::take(&mut state.waiters);
        for waiter in waiters {
            if let Some(value) = waiter.resolve(topic, &tag, &payload) {
                let _ = waiter.reply.send(value);
            } else if !waiter.reply.is_closed() {
                state.waiters.push(waiter);
            }
        }

        if let Some(slot) = state.topics.get(topic) {
            let _ = slot.messages.send(InboundMessage::new(&tag, payload));
        }
    }

    /// Set the online/offline signal for one topic.
    pub fn set_link(&self, topic: &str, status: LinkStatus) {
        if let Some(slot) = self.lock().topics.get(topic) {
            slot.link.send_replace(status);
        }
    }

    /// Set the online/offline signal for every topic (broker connection state).
    pub fn set_broker_link(&self, status: LinkStatus) {
        let mut state = self.lock();
        state.broker_link = status;
        for slot in state.topics.values() {
            slot.link.send_replace(status);
        }
    }

    /// Close every handle and fail every pending waiter.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.topics.clear();
        state.waiters.clear();
        state.probe = None;
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Topics that currently have a registered handle.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.lock().topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    fn expect(&self, topic: &str, key: ReplyKey) -> oneshot::Receiver<Payload> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();
        if !state.closed {
            state.waiters.push(Waiter {
                topic: topic.to_string(),
                key,
                reply: tx,
            });
        }
        rx
    }

    fn unregister_topic(&self, topic: &str, id: u64) {
        let mut state = self.lock();
        if state.topics.get(topic).is_some_and(|slot| slot.id == id) {
            state.topics.remove(topic);
        }
    }

    fn unregister_probe(&self, id: u64) {
        let mut state = self.lock();
        if state.probe.as_ref().is_some_and(|probe| probe.id == id) {
            state.probe = None;
        }
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn parse_lwt(payload: &Payload) -> Option<LinkStatus> {
    let text = payload.as_str()?;
    if text.eq_ignore_ascii_case("online") {
        Some(LinkStatus::Online)
    } else if text.eq_ignore_ascii_case("offline") {
        Some(LinkStatus::Offline)
    } else {
        None
    }
}

/// Per-device handle handed out by [`MessageHub::register_topic`].
pub struct TopicChannel<S> {
    hub: MessageHub<S>,
    topic: String,
    id: u64,
    messages: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundMessage>>,
    link: watch::Receiver<LinkStatus>,
}

impl<S: CommandSink> DeviceChannel for TopicChannel<S> {
    fn topic(&self) -> &str {
        &self.topic
    }

    /// Request `Status` and wait for the reply, asking again whenever the
    /// device comes back online.
    fn await_initial_status(&self) -> impl Future<Output = Option<StatusSnapshot>> + Send {
        async move {
            let mut link = self.link.clone();
            link.mark_unchanged();
            loop {
                let reply = self.await_reply(ReplyKey::tag("status"));
                tokio::pin!(reply);
                if let Err(err) = self.send_command("status", None).await {
                    tracing::warn!(topic = %self.topic, %err, "failed to request device status");
                    return None;
                }

                loop {
                    tokio::select! {
                        payload = &mut reply => {
                            let payload = payload.ok()?;
                            let snapshot = StatusSnapshot::from_payload(&payload);
                            if snapshot.is_none() {
                                tracing::warn!(
                                    topic = %self.topic,
                                    %payload,
                                    "unreadable status reply"
                                );
                            }
                            return snapshot;
                        }
                        changed = link.changed() => {
                            changed.ok()?;
                            if *link.borrow_and_update() == LinkStatus::Online {
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    fn next_message(&self) -> impl Future<Output = Option<InboundMessage>> + Send {
        async move { self.messages.lock().await.recv().await }
    }

    fn send_command(
        &self,
        command: &str,
        payload: Option<&str>,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send {
        self.hub
            .sink()
            .publish(&self.topic, command, payload.unwrap_or(""))
    }

    fn await_reply(
        &self,
        key: ReplyKey,
    ) -> impl Future<Output = Result<Payload, ConnectionError>> + Send {
        let reply = self.hub.expect(&self.topic, key);
        async move { reply.await.map_err(|_| ConnectionError::Closed) }
    }

    fn link_status(&self) -> watch::Receiver<LinkStatus> {
        self.link.clone()
    }

    fn close(&self) {
        self.hub.unregister_topic(&self.topic, self.id);
    }
}

/// Discovery handle handed out by [`MessageHub::register_any_device`].
pub struct ProbeHandle<S> {
    hub: MessageHub<S>,
    id: u64,
    pending: tokio::sync::Mutex<Option<oneshot::Receiver<Announcement>>>,
    latched: Mutex<Option<Announcement>>,
}

impl<S: CommandSink> ProbeHandle<S> {
    fn latched_topic(&self) -> Result<String, ConnectionError> {
        self.latched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|announcement| announcement.topic.clone())
            .ok_or(ConnectionError::NotConnected)
    }

    async fn request(
        &self,
        key: ReplyKey,
        command: &str,
        payload: &str,
    ) -> Result<Payload, ConnectionError> {
        let topic = self.latched_topic()?;
        let reply = self.hub.expect(&topic, key);
        self.hub.sink().publish(&topic, command, payload).await?;
        reply.await.map_err(|_| ConnectionError::Closed)
    }
}

impl<S: CommandSink> ProbeChannel for ProbeHandle<S> {
    fn await_announcement(
        &self,
    ) -> impl Future<Output = Result<Announcement, ConnectionError>> + Send {
        async move {
            let mut pending = self.pending.lock().await;
            if let Some(receiver) = pending.as_mut() {
                let announcement = receiver.await.map_err(|_| ConnectionError::Closed)?;
                *pending = None;
                *self.latched.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(announcement);
            }
            self.latched
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
                .ok_or(ConnectionError::Closed)
        }
    }

    fn query_network_status(
        &self,
    ) -> impl Future<Output = Result<Payload, ConnectionError>> + Send {
        self.request(ReplyKey::tag("status5"), "status", "5")
    }

    fn probe(
        &self,
        capability: Capability,
    ) -> impl Future<Output = Result<bool, ConnectionError>> + Send {
        async move {
            let command = match capability {
                Capability::OnOff(index) => format!("POWER{index}"),
                Capability::Position => "ShutterPosition1".to_string(),
            };
            let reply = self.request(ReplyKey::tag("result"), &command, "").await?;
            let supported = match capability {
                Capability::OnOff(index) => {
                    tasmota::field(&reply, &format!("POWER{index}")).is_some()
                        || (index.get() == 1 && tasmota::field(&reply, "POWER").is_some())
                }
                Capability::Position => {
                    tasmota::field(&reply, "Shutter1").is_some()
                        || tasmota::field(&reply, "ShutterPosition1").is_some()
                }
            };
            Ok(supported)
        }
    }

    fn unregister(&self) {
        self.hub.unregister_probe(self.id);
    }
}
