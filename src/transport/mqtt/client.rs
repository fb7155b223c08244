//! MQTT device transport I/O
//!
//! One background task drives the rumqttc event loop. It publishes connection state on a
//! `watch` channel, hands inbound publishes to the registered dispatchers, and completes
//! pending twin requests by request id. The connection is never re-established: when the
//! loop ends, pending requests fail and the caller decides whether to reconnect.

use super::connection::{configure_mqtt_options, LinkState, MqttSettings, TopicBuilder};
use super::message_handler::{EventRoute, InboundRoute, MessageHandler, TwinResponse};
use crate::config::MqttSection;
use crate::credentials::Credentials;
use crate::error::{HubError, HubResult};
use crate::protocol::{Event, Qos};
use crate::transport::{DeviceTransport, EventDispatcher, MethodDispatcher, TwinDispatcher};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, ConnectReturnCode, EventLoop, QoS};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const REQUEST_CHANNEL_CAPACITY: usize = 64;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

type PendingTwin = oneshot::Sender<HubResult<TwinResponse>>;

/// State shared with the event loop task
#[derive(Default)]
struct Shared {
    events: Mutex<Option<Arc<dyn EventDispatcher>>>,
    methods: Mutex<Option<Arc<dyn MethodDispatcher>>>,
    twin_updates: Mutex<Option<Arc<dyn TwinDispatcher>>>,
    pending: Mutex<HashMap<String, PendingTwin>>,
}

impl Shared {
    fn fail_pending(&self, reason: &str) {
        let pending: Vec<_> = self.pending.lock().drain().collect();
        if !pending.is_empty() {
            warn!(count = pending.len(), reason, "failing pending twin requests");
        }
        for (_, tx) in pending {
            let _ = tx.send(Err(HubError::transport(reason)));
        }
    }

    fn handle_publish(&self, client: &AsyncClient, device_id: &str, topic: &str, payload: Bytes) {
        match MessageHandler::route_publish(device_id, topic, payload) {
            InboundRoute::CloudToDevice(event) => {
                debug!(message_id = ?event.message_id, "cloud-to-device message");
                let dispatcher = self.events.lock().clone();
                if let Some(dispatcher) = dispatcher {
                    dispatcher.dispatch(event);
                }
            }
            InboundRoute::MethodCall {
                method,
                request_id,
                payload,
            } => {
                let Some(dispatcher) = self.methods.lock().clone() else {
                    debug!(%method, "method call before registration, ignoring");
                    return;
                };
                let client = client.clone();
                tokio::spawn(async move {
                    let (status, body) = dispatcher.dispatch(&method, &payload);
                    debug!(%method, status, "direct method handled");
                    let topic = TopicBuilder::method_response(status, &request_id);
                    if let Err(e) = client.publish(topic, QoS::AtMostOnce, false, body).await {
                        error!(%method, error = %e, "failed to publish method response");
                    }
                });
            }
            InboundRoute::TwinResponse(response) => {
                let waiter = self.pending.lock().remove(&response.request_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Ok(response));
                    }
                    None => debug!(rid = %response.request_id, "twin response without a waiter"),
                }
            }
            InboundRoute::TwinDesired(payload) => {
                let dispatcher = self.twin_updates.lock().clone();
                if let Some(dispatcher) = dispatcher {
                    dispatcher.dispatch(&payload);
                }
            }
            InboundRoute::Unknown => debug!(topic, "unroutable publish"),
        }
    }
}

/// Removes a pending twin request when the waiting call goes away early
struct PendingGuard<'a> {
    shared: &'a Shared,
    request_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending.lock().remove(&self.request_id);
    }
}

struct Connected {
    client: AsyncClient,
    device_id: String,
    shutdown: CancellationToken,
    event_loop: JoinHandle<()>,
    twin_responses: Arc<OnceCell<()>>,
}

/// Device transport over the hub's MQTT 3.1.1 surface
pub struct MqttTransport {
    section: MqttSection,
    shared: Arc<Shared>,
    connected: Mutex<Option<Connected>>,
}

impl MqttTransport {
    pub fn new(section: MqttSection) -> Self {
        Self {
            section,
            shared: Arc::new(Shared::default()),
            connected: Mutex::new(None),
        }
    }

    fn session(&self) -> HubResult<(AsyncClient, String, Arc<OnceCell<()>>)> {
        self.connected
            .lock()
            .as_ref()
            .map(|c| (c.client.clone(), c.device_id.clone(), c.twin_responses.clone()))
            .ok_or(HubError::NotReady)
    }

    /// Wait for the event loop to report ConnAck, a refusal or a dropped connection
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<LinkState>,
        timeout: Duration,
    ) -> HubResult<()> {
        let confirmed = tokio::time::timeout(timeout, async {
            let state = state_rx
                .wait_for(|state| *state != LinkState::Connecting)
                .await
                .map(|state| state.clone())
                .map_err(|_| HubError::transport("event loop stopped before ConnAck"))?;
            match state {
                LinkState::Connected => Ok(()),
                LinkState::Disconnected(reason) => Err(HubError::transport(reason)),
                LinkState::Connecting => Err(HubError::transport("still connecting")),
            }
        })
        .await;

        confirmed.unwrap_or_else(|_| {
            Err(HubError::transport(
                "ConnAck timeout - no connection confirmation received",
            ))
        })
    }

    async fn run_event_loop(
        mut event_loop: EventLoop,
        client: AsyncClient,
        device_id: String,
        shared: Arc<Shared>,
        state_tx: watch::Sender<LinkState>,
        shutdown: CancellationToken,
    ) {
        let reason = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break "transport closed".to_string(),
                polled = event_loop.poll() => match polled {
                    Ok(event) => match MessageHandler::route_event(&event) {
                        EventRoute::ConnectionAcknowledged(ConnectReturnCode::Success) => {
                            info!(%device_id, "MQTT connection acknowledged");
                            state_tx.send_replace(LinkState::Connected);
                        }
                        EventRoute::ConnectionAcknowledged(code) => {
                            break format!("connection refused: {code:?}");
                        }
                        EventRoute::Publish { topic, payload } => {
                            shared.handle_publish(&client, &device_id, &topic, payload);
                        }
                        EventRoute::Disconnected => break "disconnected".to_string(),
                        EventRoute::Other => {}
                    },
                    Err(e) => {
                        error!(%device_id, error = %e, "MQTT event loop error");
                        break e.to_string();
                    }
                }
            }
        };

        state_tx.send_replace(LinkState::Disconnected(reason.clone()));
        shared.fail_pending(&reason);
        info!(%device_id, %reason, "MQTT event loop stopped");
    }

    /// Subscribe to twin responses once per connection
    async fn ensure_twin_responses(client: &AsyncClient, once: &OnceCell<()>) -> HubResult<()> {
        once.get_or_try_init(|| async {
            client
                .subscribe(TopicBuilder::TWIN_RESPONSE_FILTER, QoS::AtMostOnce)
                .await
                .map_err(|e| HubError::link_setup(TopicBuilder::TWIN_RESPONSE_FILTER, e.to_string()))
        })
        .await
        .map(|_| ())
    }

    async fn twin_request(
        &self,
        topic: impl FnOnce(&str) -> String,
        body: Vec<u8>,
    ) -> HubResult<TwinResponse> {
        let (client, _, twin_responses) = self.session()?;
        Self::ensure_twin_responses(&client, &twin_responses).await?;

        let request_id = uuid::Uuid::new_v4().simple().to_string();
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(request_id.clone(), tx);
        let _guard = PendingGuard {
            shared: &self.shared,
            request_id: request_id.clone(),
        };

        client
            .publish(topic(&request_id), QoS::AtMostOnce, false, body)
            .await
            .map_err(|e| HubError::transport(e.to_string()))?;

        let response = rx
            .await
            .map_err(|_| HubError::transport("connection closed before twin response"))??;
        if !(200..300).contains(&response.status) {
            return Err(HubError::status(
                response.status,
                String::from_utf8_lossy(&response.payload),
            ));
        }
        Ok(response)
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> HubResult<()> {
        let (client, _, _) = self.session()?;
        client
            .subscribe(filter, qos)
            .await
            .map_err(|e| HubError::link_setup(filter, e.to_string()))
    }
}

fn mqtt_qos(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
    }
}

#[async_trait]
impl DeviceTransport for MqttTransport {
    async fn connect(&self, credentials: Arc<dyn Credentials>) -> HubResult<()> {
        if self.connected.lock().is_some() {
            return Err(HubError::AlreadyConnected);
        }

        let settings = MqttSettings::from_section(&self.section)?;
        let options = configure_mqtt_options(credentials.as_ref(), &settings)?;
        let device_id = credentials.device_id().to_string();
        info!(%device_id, hostname = credentials.hostname(), "connecting over MQTT");

        let (client, event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(Self::run_event_loop(
            event_loop,
            client.clone(),
            device_id.clone(),
            self.shared.clone(),
            state_tx,
            shutdown.clone(),
        ));
        // stops the event loop if this call is abandoned before the session is stored
        let abandoned = shutdown.clone().drop_guard();

        if let Err(e) = Self::wait_for_connection_confirmation(state_rx, settings.connect_timeout).await
        {
            shutdown.cancel();
            let _ = handle.await;
            return Err(e);
        }
        abandoned.disarm();

        *self.connected.lock() = Some(Connected {
            client,
            device_id,
            shutdown,
            event_loop: handle,
            twin_responses: Arc::new(OnceCell::new()),
        });
        Ok(())
    }

    async fn send(&self, event: Event) -> HubResult<()> {
        let (client, device_id, _) = self.session()?;
        let topic = TopicBuilder::events(&device_id, &MessageHandler::encode_properties(&event));
        debug!(%topic, bytes = event.payload.len(), "device-to-cloud event");
        client
            .publish(topic, mqtt_qos(event.qos), false, event.payload.to_vec())
            .await
            .map_err(|e| HubError::transport(e.to_string()))
    }

    async fn subscribe_events(&self, dispatcher: Arc<dyn EventDispatcher>) -> HubResult<()> {
        let (_, device_id, _) = self.session()?;
        *self.shared.events.lock() = Some(dispatcher);
        self.subscribe(&TopicBuilder::devicebound_filter(&device_id), QoS::AtLeastOnce)
            .await
    }

    async fn register_direct_methods(
        &self,
        dispatcher: Arc<dyn MethodDispatcher>,
    ) -> HubResult<()> {
        *self.shared.methods.lock() = Some(dispatcher);
        self.subscribe(TopicBuilder::METHODS_FILTER, QoS::AtMostOnce)
            .await
    }

    async fn retrieve_twin_properties(&self) -> HubResult<Vec<u8>> {
        let response = self.twin_request(TopicBuilder::twin_get, Vec::new()).await?;
        Ok(response.payload.to_vec())
    }

    async fn update_twin_properties(&self, patch: Vec<u8>) -> HubResult<i64> {
        let response = self
            .twin_request(TopicBuilder::twin_patch_reported, patch)
            .await?;
        response
            .version
            .ok_or_else(|| HubError::decode("twin update response carries no $version"))
    }

    async fn subscribe_twin_updates(&self, dispatcher: Arc<dyn TwinDispatcher>) -> HubResult<()> {
        *self.shared.twin_updates.lock() = Some(dispatcher);
        self.subscribe(TopicBuilder::TWIN_DESIRED_FILTER, QoS::AtMostOnce)
            .await
    }

    async fn close(&self) -> HubResult<()> {
        let connected = self.connected.lock().take();
        let Some(connected) = connected else {
            return Ok(());
        };

        if let Err(e) = connected.client.disconnect().await {
            debug!(error = %e, "disconnect request not delivered");
        }

        let mut event_loop = connected.event_loop;
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut event_loop).await.is_err() {
            warn!("event loop did not stop after disconnect, cancelling");
            connected.shutdown.cancel();
            let _ = event_loop.await;
        }
        info!(device_id = %connected.device_id, "MQTT transport closed");
        Ok(())
    }
}
