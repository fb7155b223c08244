//! Mock implementations for testing
//!
//! [`MockDeviceTransport`] stands in for the MQTT device transport and [`MockConnector`]
//! for an AMQP broker, so both clients can be exercised without a hub.

use crate::credentials::Credentials;
use crate::error::{HubError, HubResult};
use crate::protocol::addresses::{CBS_NODE, CBS_REPLY_TO, MANAGEMENT_NODE};
use crate::protocol::{Event, Mapping, Message, Value};
use crate::transport::amqp::{Connection, Connector, LinkOptions, Receiver, Sender, Session};
use crate::transport::{DeviceTransport, EventDispatcher, MethodDispatcher, TwinDispatcher};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Mock device transport
///
/// Records sent events, keeps the dispatchers handed to it so tests can inject inbound
/// traffic, and serves a twin document whose reported version grows with every patch.
#[derive(Default)]
pub struct MockDeviceTransport {
    sent: Mutex<Vec<Event>>,
    events: Mutex<Option<Arc<dyn EventDispatcher>>>,
    twin_updates: Mutex<Option<Arc<dyn TwinDispatcher>>>,
    methods: Mutex<Option<Arc<dyn MethodDispatcher>>>,
    desired: Mutex<Mapping>,
    reported: Mutex<Mapping>,
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    pub event_setups: AtomicUsize,
    pub twin_setups: AtomicUsize,
    pub method_setups: AtomicUsize,
    fail_connect: bool,
    fail_setup: AtomicBool,
    setup_delay: Option<Duration>,
}

impl MockDeviceTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_failure() -> Self {
        Self {
            fail_connect: true,
            ..Default::default()
        }
    }

    /// Every setup waits `delay` before completing
    pub fn with_setup_delay(delay: Duration) -> Self {
        Self {
            setup_delay: Some(delay),
            ..Default::default()
        }
    }

    /// Make the next setups fail (or succeed again)
    pub fn fail_setups(&self, fail: bool) {
        self.fail_setup.store(fail, Ordering::SeqCst);
    }

    pub fn set_desired(&self, desired: Mapping) {
        *self.desired.lock() = desired;
    }

    pub fn set_reported(&self, reported: Mapping) {
        *self.reported.lock() = reported;
    }

    pub fn sent_events(&self) -> Vec<Event> {
        self.sent.lock().clone()
    }

    pub fn reported(&self) -> Mapping {
        self.reported.lock().clone()
    }

    /// Deliver an inbound event; false when nothing subscribed yet
    pub fn inject_event(&self, event: Event) -> bool {
        let dispatcher = self.events.lock().clone();
        match dispatcher {
            Some(dispatcher) => {
                dispatcher.dispatch(event);
                true
            }
            None => false,
        }
    }

    pub fn inject_twin_update(&self, payload: &[u8]) -> bool {
        let dispatcher = self.twin_updates.lock().clone();
        match dispatcher {
            Some(dispatcher) => {
                dispatcher.dispatch(payload);
                true
            }
            None => false,
        }
    }

    /// Invoke a direct method the way the hub would
    pub fn call_method(&self, method: &str, payload: &[u8]) -> Option<(i32, Vec<u8>)> {
        let dispatcher = self.methods.lock().clone();
        dispatcher.map(|dispatcher| dispatcher.dispatch(method, payload))
    }

    async fn setup(&self, counter: &AtomicUsize, address: &str) -> HubResult<()> {
        if let Some(delay) = self.setup_delay {
            tokio::time::sleep(delay).await;
        }
        counter.fetch_add(1, Ordering::SeqCst);
        if self.fail_setup.load(Ordering::SeqCst) {
            return Err(HubError::link_setup(address, "mock setup failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceTransport for MockDeviceTransport {
    async fn connect(&self, _credentials: Arc<dyn Credentials>) -> HubResult<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect {
            return Err(HubError::transport("mock connection failure"));
        }
        Ok(())
    }

    async fn send(&self, event: Event) -> HubResult<()> {
        self.sent.lock().push(event);
        Ok(())
    }

    async fn subscribe_events(&self, dispatcher: Arc<dyn EventDispatcher>) -> HubResult<()> {
        self.setup(&self.event_setups, "devicebound").await?;
        *self.events.lock() = Some(dispatcher);
        Ok(())
    }

    async fn register_direct_methods(
        &self,
        dispatcher: Arc<dyn MethodDispatcher>,
    ) -> HubResult<()> {
        self.setup(&self.method_setups, "methods").await?;
        *self.methods.lock() = Some(dispatcher);
        Ok(())
    }

    async fn retrieve_twin_properties(&self) -> HubResult<Vec<u8>> {
        let mut document = Mapping::new();
        document.insert("desired".into(), Value::Mapping(self.desired.lock().clone()));
        document.insert("reported".into(), Value::Mapping(self.reported.lock().clone()));
        Value::Mapping(document).to_json_vec()
    }

    async fn update_twin_properties(&self, patch: Vec<u8>) -> HubResult<i64> {
        let patch = Value::from_json_slice(&patch)?.into_mapping()?;
        let mut reported = self.reported.lock();
        for (key, value) in patch {
            if value.is_null() {
                reported.remove(&key);
            } else {
                reported.insert(key, value);
            }
        }
        let version = reported
            .get("$version")
            .and_then(|v| v.as_i64().ok())
            .unwrap_or(0)
            + 1;
        reported.insert("$version".into(), Value::Int(version));
        Ok(version)
    }

    async fn subscribe_twin_updates(&self, dispatcher: Arc<dyn TwinDispatcher>) -> HubResult<()> {
        self.setup(&self.twin_setups, "twin").await?;
        *self.twin_updates.lock() = Some(dispatcher);
        Ok(())
    }

    async fn close(&self) -> HubResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

type Feed = mpsc::UnboundedSender<HubResult<Message>>;

/// Scripted broker behind [`MockConnector`]
///
/// Answers management partition queries and `put-token` requests, feeds partition
/// receivers from per-address queues, and counts open links.
pub struct MockBroker {
    partition_ids: Mutex<Vec<String>>,
    management_status: Mutex<(i32, String)>,
    cbs_status: Mutex<(i32, String)>,
    wrong_correlation: AtomicBool,
    silent: AtomicBool,
    fail_session: AtomicBool,
    failing_partition: Mutex<Option<String>>,
    granted: Mutex<Vec<(String, String)>>,
    replies: Mutex<HashMap<String, Feed>>,
    feeds: Mutex<HashMap<String, (Feed, Option<mpsc::UnboundedReceiver<HubResult<Message>>>)>>,
    open_links: AtomicUsize,
    links_opened: AtomicUsize,
    accepted: AtomicUsize,
    sessions_closed: AtomicUsize,
    connections_closed: AtomicUsize,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self {
            partition_ids: Mutex::new(vec!["0".to_string(), "1".to_string()]),
            management_status: Mutex::new((200, "OK".to_string())),
            cbs_status: Mutex::new((200, "OK".to_string())),
            wrong_correlation: AtomicBool::new(false),
            silent: AtomicBool::new(false),
            fail_session: AtomicBool::new(false),
            failing_partition: Mutex::new(None),
            granted: Mutex::new(Vec::new()),
            replies: Mutex::new(HashMap::new()),
            feeds: Mutex::new(HashMap::new()),
            open_links: AtomicUsize::new(0),
            links_opened: AtomicUsize::new(0),
            accepted: AtomicUsize::new(0),
            sessions_closed: AtomicUsize::new(0),
            connections_closed: AtomicUsize::new(0),
        }
    }
}

impl MockBroker {
    pub fn set_partition_ids(&self, ids: &[&str]) {
        *self.partition_ids.lock() = ids.iter().map(|id| id.to_string()).collect();
    }

    pub fn set_management_status(&self, code: i32, description: &str) {
        *self.management_status.lock() = (code, description.to_string());
    }

    pub fn set_cbs_status(&self, code: i32, description: &str) {
        *self.cbs_status.lock() = (code, description.to_string());
    }

    /// Answer requests with a correlation id that matches nothing
    pub fn answer_with_wrong_correlation(&self, wrong: bool) {
        self.wrong_correlation.store(wrong, Ordering::SeqCst);
    }

    /// Swallow requests without answering
    pub fn go_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    pub fn fail_sessions(&self, fail: bool) {
        self.fail_session.store(fail, Ordering::SeqCst);
    }

    /// Refuse to open the receiver of `partition_id`
    pub fn fail_partition(&self, partition_id: &str) {
        *self.failing_partition.lock() = Some(partition_id.to_string());
    }

    /// Queue feeding the receiver of `address`
    pub fn feed(&self, address: &str) -> Feed {
        let mut feeds = self.feeds.lock();
        let (tx, _) = feeds.entry(address.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            (tx, Some(rx))
        });
        tx.clone()
    }

    /// `(audience, token)` of every granted `put-token` request
    pub fn granted_tokens(&self) -> Vec<(String, String)> {
        self.granted.lock().clone()
    }

    pub fn open_links(&self) -> usize {
        self.open_links.load(Ordering::SeqCst)
    }

    pub fn links_opened(&self) -> usize {
        self.links_opened.load(Ordering::SeqCst)
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn sessions_closed(&self) -> usize {
        self.sessions_closed.load(Ordering::SeqCst)
    }

    pub fn connections_closed(&self) -> usize {
        self.connections_closed.load(Ordering::SeqCst)
    }

    fn link_opened(&self) {
        self.links_opened.fetch_add(1, Ordering::SeqCst);
        self.open_links.fetch_add(1, Ordering::SeqCst);
    }

    fn take_feed(&self, address: &str) -> mpsc::UnboundedReceiver<HubResult<Message>> {
        let mut feeds = self.feeds.lock();
        let slot = feeds.entry(address.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            (tx, Some(rx))
        });
        match slot.1.take() {
            Some(rx) => rx,
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                slot.0 = tx;
                rx
            }
        }
    }

    fn respond(&self, node: &str, request: Message) -> HubResult<()> {
        if self.silent.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut response = if node == MANAGEMENT_NODE {
            let (code, description) = self.management_status.lock().clone();
            let ids = self.partition_ids.lock().clone();
            let mut body = Mapping::new();
            body.insert(
                "partition_ids".into(),
                Value::Sequence(ids.into_iter().map(Value::String).collect()),
            );
            let mut response = Message::response_to(&request, code, &description);
            response.value = Value::Mapping(body);
            response
        } else {
            let (code, description) = self.cbs_status.lock().clone();
            if code == 200 {
                let audience = request
                    .application_properties
                    .get("name")
                    .and_then(|v| v.as_str().ok())
                    .unwrap_or_default()
                    .to_string();
                let token = request.value.as_str().unwrap_or_default().to_string();
                self.granted.lock().push((audience, token));
            }
            Message::response_to(&request, code, &description)
        };
        if self.wrong_correlation.load(Ordering::SeqCst) {
            response.properties.correlation_id = Some("unrelated".to_string());
        }

        let reply_to = request.properties.reply_to.clone().unwrap_or_default();
        let route = self.replies.lock().get(&reply_to).cloned();
        match route {
            Some(route) => {
                let _ = route.send(Ok(response));
                Ok(())
            }
            None => Err(HubError::transport(format!("no receiver for {reply_to}"))),
        }
    }
}

/// Mock AMQP connector; every dial shares one [`MockBroker`]
#[derive(Clone, Default)]
pub struct MockConnector {
    broker: Arc<MockBroker>,
    fail_dial: bool,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dial_failure() -> Self {
        Self {
            fail_dial: true,
            ..Default::default()
        }
    }

    pub fn broker(&self) -> Arc<MockBroker> {
        self.broker.clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn dial(&self, hostname: &str) -> HubResult<Box<dyn Connection>> {
        if self.fail_dial {
            return Err(HubError::transport(format!("cannot reach {hostname}")));
        }
        Ok(Box::new(MockConnection {
            broker: self.broker.clone(),
        }))
    }
}

struct MockConnection {
    broker: Arc<MockBroker>,
}

#[async_trait]
impl Connection for MockConnection {
    async fn new_session(&self) -> HubResult<Arc<dyn Session>> {
        if self.broker.fail_session.load(Ordering::SeqCst) {
            return Err(HubError::transport("mock session failure"));
        }
        Ok(Arc::new(MockSession {
            broker: self.broker.clone(),
        }))
    }

    async fn close(&self) -> HubResult<()> {
        self.broker.connections_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MockSession {
    broker: Arc<MockBroker>,
}

#[async_trait]
impl Session for MockSession {
    async fn open_sender(&self, options: LinkOptions) -> HubResult<Box<dyn Sender>> {
        self.broker.link_opened();
        Ok(Box::new(MockSender {
            broker: self.broker.clone(),
            node: options.target.unwrap_or_default(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn open_receiver(&self, options: LinkOptions) -> HubResult<Box<dyn Receiver>> {
        let source = options.source.clone().unwrap_or_default();
        let is_node = source == MANAGEMENT_NODE || source == CBS_NODE;

        if !is_node {
            let failing = self.broker.failing_partition.lock().clone();
            if let Some(partition_id) = failing {
                if source.ends_with(&format!("/Partitions/{partition_id}")) {
                    return Err(HubError::link_setup(source, "mock partition failure"));
                }
            }
        }

        let inbound = if is_node {
            let reply_to = options
                .target
                .clone()
                .unwrap_or_else(|| CBS_REPLY_TO.to_string());
            let (tx, rx) = mpsc::unbounded_channel();
            self.broker.replies.lock().insert(reply_to, tx);
            rx
        } else {
            self.broker.take_feed(&source)
        };

        self.broker.link_opened();
        Ok(Box::new(MockReceiver {
            broker: self.broker.clone(),
            options,
            inbound,
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> HubResult<()> {
        self.broker.sessions_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MockSender {
    broker: Arc<MockBroker>,
    node: String,
    closed: AtomicBool,
}

#[async_trait]
impl Sender for MockSender {
    async fn send(&self, message: Message) -> HubResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HubError::Closed);
        }
        self.broker.respond(&self.node, message)
    }

    async fn close(&self) -> HubResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.broker.open_links.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct MockReceiver {
    broker: Arc<MockBroker>,
    options: LinkOptions,
    inbound: mpsc::UnboundedReceiver<HubResult<Message>>,
    closed: AtomicBool,
}

#[async_trait]
impl Receiver for MockReceiver {
    async fn receive(&mut self) -> HubResult<Message> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(HubError::Closed);
            }
            let message = self.inbound.recv().await.ok_or(HubError::Closed)??;
            match &self.options.filter {
                Some(filter) if !filter.accepts(message.enqueued_time) => continue,
                _ => return Ok(message),
            }
        }
    }

    async fn accept(&self, _message: &Message) -> HubResult<()> {
        self.broker.accepted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> HubResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.broker.open_links.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Partition message stamped as enqueued now
pub fn partition_message(body: impl Into<Value>) -> Message {
    Message::new(body).with_enqueued_time(Utc::now())
}
