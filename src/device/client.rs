//! Device client
//!
//! Every data-plane operation first waits for the client to become ready (or closed, or for
//! the caller's token to fire) and then runs against the transport. Conversation links are
//! wired lazily through the three multiplexers.

use super::mux::{DirectMethodHandler, FanOut, Multiplexer, Registry, Subscription};
use super::twin::{split_document, TwinState};
use crate::config::{ClientOptions, HubConfig, SendOptions};
use crate::credentials::Credentials;
use crate::device_span;
use crate::error::{HubError, HubResult};
use crate::lifecycle::{run_cancellable, ConnectionState, Lifecycle};
use crate::protocol::Event;
use crate::transport::{DeviceTransport, EventDispatcher, MethodDispatcher, TwinDispatcher};
use bytes::Bytes;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Instrument};

/// Subscription to cloud-to-device events
pub type EventSubscription = Subscription<Event>;

/// Subscription to desired-property updates
pub type TwinSubscription = Subscription<TwinState>;

pub struct Client {
    credentials: Arc<dyn Credentials>,
    transport: Arc<dyn DeviceTransport>,
    lifecycle: Lifecycle,
    events: Arc<Multiplexer<FanOut<Event>>>,
    twin_updates: Arc<Multiplexer<FanOut<TwinState>>>,
    methods: Arc<Multiplexer<Registry>>,
}

impl Client {
    /// Build a client; without explicit credentials the options' environment variable is read
    pub fn new(transport: Arc<dyn DeviceTransport>, options: ClientOptions) -> HubResult<Self> {
        Ok(Self::with_credentials(
            transport,
            options.resolve_credentials()?,
        ))
    }

    pub fn with_credentials(
        transport: Arc<dyn DeviceTransport>,
        credentials: Arc<dyn Credentials>,
    ) -> Self {
        Self {
            credentials,
            transport,
            lifecycle: Lifecycle::new(),
            events: Arc::new(Multiplexer::new(FanOut::default())),
            twin_updates: Arc::new(Multiplexer::new(FanOut::default())),
            methods: Arc::new(Multiplexer::new(Registry::default())),
        }
    }

    /// Build a client from the `[device]` section of a configuration file
    pub fn from_config(transport: Arc<dyn DeviceTransport>, config: &HubConfig) -> HubResult<Self> {
        Ok(Self::with_credentials(
            transport,
            config.device.resolve_credentials()?,
        ))
    }

    pub fn device_id(&self) -> &str {
        self.credentials.device_id()
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    /// Connect the transport. A second connect fails with `AlreadyConnected`; a failed
    /// connect leaves the client unready so it can be retried.
    pub async fn connect(&self, cancel: &CancellationToken) -> HubResult<()> {
        let transition = run_cancellable(cancel, async { Ok(self.lifecycle.lock().await) }).await?;
        match transition.state() {
            ConnectionState::Ready => return Err(HubError::AlreadyConnected),
            ConnectionState::Closed => return Err(HubError::Closed),
            ConnectionState::Unready => {}
        }

        run_cancellable(cancel, self.transport.connect(self.credentials.clone()))
            .instrument(device_span!(device_id = self.device_id(), op = "connect"))
            .await?;
        transition.set(ConnectionState::Ready);
        info!(device_id = self.device_id(), "device client ready");
        Ok(())
    }

    /// Close the client. Only the first call tears anything down; later calls succeed
    /// without side effects.
    pub async fn close(&self) -> HubResult<()> {
        let transition = self.lifecycle.lock().await;
        if transition.state() == ConnectionState::Closed {
            return Ok(());
        }
        transition.set(ConnectionState::Closed);

        self.events.close(HubError::Closed);
        self.twin_updates.close(HubError::Closed);
        self.methods.close(HubError::Closed);

        self.transport.close().await
    }

    /// Send a device-to-cloud event; the payload must not be empty
    pub async fn send_event(
        &self,
        cancel: &CancellationToken,
        payload: impl Into<Bytes>,
        options: SendOptions,
    ) -> HubResult<()> {
        self.lifecycle.wait_ready(cancel).await?;

        let payload = payload.into();
        if payload.is_empty() {
            return Err(HubError::invalid_input("payload is empty"));
        }
        let event = options.into_event(payload)?;

        run_cancellable(cancel, self.transport.send(event))
            .instrument(device_span!(device_id = self.device_id(), op = "send_event"))
            .await?;
        debug!(device_id = self.device_id(), "device-to-cloud event sent");
        Ok(())
    }

    pub async fn subscribe_events(&self, cancel: &CancellationToken) -> HubResult<EventSubscription> {
        self.lifecycle.wait_ready(cancel).await?;

        let dispatcher: Arc<dyn EventDispatcher> = self.events.clone();
        let setup = self
            .events
            .once(|| self.transport.subscribe_events(dispatcher));
        run_cancellable(cancel, setup).await?;

        self.events.sub()
    }

    pub fn unsubscribe_events(&self, subscription: &EventSubscription) {
        self.events.unsub(subscription);
    }

    /// Register `handler` for direct method `name`; names must be non-empty and unique
    pub async fn register_method(
        &self,
        cancel: &CancellationToken,
        name: &str,
        handler: DirectMethodHandler,
    ) -> HubResult<()> {
        self.lifecycle.wait_ready(cancel).await?;
        if name.is_empty() {
            return Err(HubError::invalid_input("method name cannot be blank"));
        }

        let dispatcher: Arc<dyn MethodDispatcher> = self.methods.clone();
        let setup = self
            .methods
            .once(|| self.transport.register_direct_methods(dispatcher));
        run_cancellable(cancel, setup).await?;

        self.methods.handle(name, handler)
    }

    pub fn unregister_method(&self, name: &str) {
        self.methods.remove(name);
    }

    /// Current desired and reported twin state
    pub async fn retrieve_twin_state(
        &self,
        cancel: &CancellationToken,
    ) -> HubResult<(TwinState, TwinState)> {
        self.lifecycle.wait_ready(cancel).await?;
        let document = run_cancellable(cancel, self.transport.retrieve_twin_properties()).await?;
        split_document(&document)
    }

    /// Patch the reported state and return the new twin version. Keys set to
    /// `Value::Null` are removed.
    pub async fn update_twin_state(
        &self,
        cancel: &CancellationToken,
        state: &TwinState,
    ) -> HubResult<i64> {
        self.lifecycle.wait_ready(cancel).await?;
        let patch = state.to_json()?;
        run_cancellable(cancel, self.transport.update_twin_properties(patch)).await
    }

    pub async fn subscribe_twin_updates(
        &self,
        cancel: &CancellationToken,
    ) -> HubResult<TwinSubscription> {
        self.lifecycle.wait_ready(cancel).await?;

        let dispatcher: Arc<dyn TwinDispatcher> = self.twin_updates.clone();
        let setup = self
            .twin_updates
            .once(|| self.transport.subscribe_twin_updates(dispatcher));
        run_cancellable(cancel, setup).await?;

        self.twin_updates.sub()
    }

    pub fn unsubscribe_twin_updates(&self, subscription: &TwinSubscription) {
        self.twin_updates.unsub(subscription);
    }
}
