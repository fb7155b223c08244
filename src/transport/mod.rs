//! Transport seams
//!
//! The device client talks to the hub through [`DeviceTransport`]; inbound traffic is handed
//! back through the dispatcher traits, which the device multiplexers implement. The event hub
//! client consumes the AMQP session surface in [`amqp`].
//!
//! Transport methods do not take a cancellation token. Callers race them against their own
//! token and release anything they opened on both paths.

use crate::credentials::Credentials;
use crate::error::HubResult;
use crate::protocol::Event;
use std::sync::Arc;

pub mod amqp;
pub mod mqtt;

pub use mqtt::MqttTransport;

/// Receives every inbound cloud-to-device event
pub trait EventDispatcher: Send + Sync {
    fn dispatch(&self, event: Event);
}

/// Receives every desired-properties patch as its raw JSON document
pub trait TwinDispatcher: Send + Sync {
    fn dispatch(&self, payload: &[u8]);
}

/// Answers direct method invocations with a status code and a JSON body
pub trait MethodDispatcher: Send + Sync {
    fn dispatch(&self, method: &str, payload: &[u8]) -> (i32, Vec<u8>);
}

/// Device-side transport to the hub
///
/// Each `subscribe_*`/`register_*` call wires one conversation link and is invoked at most
/// once per successful setup by the owning client.
#[async_trait::async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Authenticate and connect; succeeds only once the broker has accepted the session
    async fn connect(&self, credentials: Arc<dyn Credentials>) -> HubResult<()>;

    async fn send(&self, event: Event) -> HubResult<()>;

    async fn subscribe_events(&self, dispatcher: Arc<dyn EventDispatcher>) -> HubResult<()>;

    async fn register_direct_methods(&self, dispatcher: Arc<dyn MethodDispatcher>)
        -> HubResult<()>;

    /// Full twin document `{"desired": {..}, "reported": {..}}`
    async fn retrieve_twin_properties(&self) -> HubResult<Vec<u8>>;

    /// Patch reported properties, returning the new twin version
    async fn update_twin_properties(&self, patch: Vec<u8>) -> HubResult<i64>;

    async fn subscribe_twin_updates(&self, dispatcher: Arc<dyn TwinDispatcher>) -> HubResult<()>;

    async fn close(&self) -> HubResult<()>;
}
