//! MQTT device transport
//!
//! - [`connection`] - pure broker options and topic construction
//! - [`message_handler`] - pure inbound routing and property encoding
//! - [`client`] - event loop and request/response I/O

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::MqttTransport;
pub use connection::{configure_mqtt_options, LinkState, MqttSettings, TopicBuilder};
pub use message_handler::{EventRoute, InboundRoute, MessageHandler, TwinResponse};
