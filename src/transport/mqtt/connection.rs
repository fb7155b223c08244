//! Pure connection configuration for the MQTT device transport
//!
//! Builds broker options from credentials and settings, and every topic the hub's MQTT
//! surface uses.

use crate::config::MqttSection;
use crate::credentials::{device_audience, Credentials};
use crate::error::{HubError, HubResult};
use rumqttc::{MqttOptions, TlsConfiguration, Transport};
use std::path::Path;
use std::time::Duration;

/// State of the underlying MQTT connection as seen by the event loop
#[derive(Debug, Clone, PartialEq)]
pub enum LinkState {
    /// Waiting for the broker's ConnAck
    Connecting,
    Connected,
    /// Connection ended; the event loop has stopped
    Disconnected(String),
}

/// Resolved MQTT settings
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub port: u16,
    pub keep_alive: Duration,
    pub api_version: String,
    pub connect_timeout: Duration,
    pub token_lifetime: Duration,
    /// Trusted roots in PEM form; system roots when `None`
    pub ca_pem: Option<Vec<u8>>,
}

impl MqttSettings {
    /// Resolve settings from the configuration section, reading the CA bundle if one is named
    pub fn from_section(section: &MqttSection) -> HubResult<Self> {
        let ca_pem = section
            .ca_file
            .as_deref()
            .map(read_ca_file)
            .transpose()?;

        Ok(Self {
            port: section.port,
            keep_alive: section.keep_alive(),
            api_version: section.api_version.clone(),
            connect_timeout: section.connect_timeout(),
            token_lifetime: section.token_lifetime(),
            ca_pem,
        })
    }
}

fn read_ca_file(path: &Path) -> HubResult<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| HubError::Config(format!("failed to read CA file {}: {e}", path.display())))
}

/// Build broker options for `credentials`
///
/// The client id is the device id; the username carries the API version and the password is
/// a SAS token for the device audience (empty for certificate authentication).
pub fn configure_mqtt_options(
    credentials: &dyn Credentials,
    settings: &MqttSettings,
) -> HubResult<MqttOptions> {
    let device_id = credentials.device_id();
    let hostname = credentials.hostname();
    if device_id.is_empty() {
        return Err(HubError::credentials(
            "MQTT connections need device credentials with a DeviceId",
        ));
    }

    let mut options = MqttOptions::new(device_id, hostname, settings.port);
    options.set_keep_alive(settings.keep_alive);
    options.set_max_packet_size(256 * 1024, 256 * 1024);

    let password = credentials
        .token(&device_audience(hostname, device_id), settings.token_lifetime)?
        .map(|sas| sas.to_string())
        .unwrap_or_default();
    options.set_credentials(
        TopicBuilder::username(hostname, device_id, &settings.api_version),
        password,
    );

    let transport = match (credentials.client_identity(), &settings.ca_pem) {
        (None, None) => Transport::tls_with_default_config(),
        (identity, Some(ca)) => Transport::Tls(TlsConfiguration::Simple {
            ca: ca.clone(),
            alpn: None,
            client_auth: identity.map(|id| (id.cert_pem.clone(), id.key_pem.clone())),
        }),
        (Some(_), None) => {
            return Err(HubError::Config(
                "certificate authentication over MQTT requires mqtt.ca_file".into(),
            ))
        }
    };
    options.set_transport(transport);

    Ok(options)
}

/// Topic construction for the hub's MQTT surface
pub struct TopicBuilder;

impl TopicBuilder {
    /// Subscription filter for direct method invocations
    pub const METHODS_FILTER: &'static str = "$iothub/methods/POST/#";

    /// Subscription filter for twin request responses
    pub const TWIN_RESPONSE_FILTER: &'static str = "$iothub/twin/res/#";

    /// Subscription filter for desired-property patches
    pub const TWIN_DESIRED_FILTER: &'static str = "$iothub/twin/PATCH/properties/desired/#";

    /// MQTT username: `{hostname}/{device_id}/?api-version={version}`
    pub fn username(hostname: &str, device_id: &str, api_version: &str) -> String {
        format!("{hostname}/{device_id}/?api-version={api_version}")
    }

    /// Device-to-cloud topic with encoded properties appended
    pub fn events(device_id: &str, encoded_properties: &str) -> String {
        format!("devices/{device_id}/messages/events/{encoded_properties}")
    }

    /// Subscription filter for cloud-to-device messages
    pub fn devicebound_filter(device_id: &str) -> String {
        format!("devices/{device_id}/messages/devicebound/#")
    }

    /// Prefix of every cloud-to-device topic
    pub fn devicebound_prefix(device_id: &str) -> String {
        format!("devices/{device_id}/messages/devicebound/")
    }

    pub fn method_response(status: i32, request_id: &str) -> String {
        format!("$iothub/methods/res/{status}/?$rid={request_id}")
    }

    pub fn twin_get(request_id: &str) -> String {
        format!("$iothub/twin/GET/?$rid={request_id}")
    }

    pub fn twin_patch_reported(request_id: &str) -> String {
        format!("$iothub/twin/PATCH/properties/reported/?$rid={request_id}")
    }
}
