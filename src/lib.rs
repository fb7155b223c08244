//! hubclient - IoT hub device and event hub client
//!
//! Two clients share one protocol and error vocabulary:
//! - [`device::Client`] connects a single device over MQTT: device-to-cloud events,
//!   cloud-to-device event subscriptions, direct methods and twin state
//! - [`eventhub::EventHubClient`] consumes every partition of an event hub over an AMQP
//!   session and keeps claims-based security tokens granted
//!
//! # Quick Start
//!
//! ```no_run
//! use hubclient::config::{ClientOptions, HubConfig, SendOptions};
//! use hubclient::device::Client;
//! use hubclient::transport::MqttTransport;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> hubclient::HubResult<()> {
//! let config = HubConfig::default();
//! let transport = Arc::new(MqttTransport::new(config.mqtt.clone()));
//! let client = Client::new(transport, ClientOptions::default())?;
//!
//! let cancel = CancellationToken::new();
//! client.connect(&cancel).await?;
//! client
//!     .send_event(&cancel, "hello", SendOptions::default().with_property("kind", "greeting"))
//!     .await?;
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod credentials;
pub mod device;
pub mod error;
pub mod eventhub;
pub mod lifecycle;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use config::{ClientOptions, HubConfig, SendOptions};
pub use credentials::{Credentials, SasCredentials, SharedAccessSignature, X509Credentials};
pub use device::{Client, TwinState};
pub use error::{HubError, HubResult};
pub use eventhub::{EventHubClient, TokenManager};
pub use lifecycle::ConnectionState;
pub use protocol::{Event, Message, Qos, Value};
