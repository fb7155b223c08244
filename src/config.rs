//! Configuration for the hub client
//!
//! Configuration is an explicit record loaded from TOML. Defaults are documented per field;
//! the only environment lookup is the named connection-string variable, consulted when no
//! credentials were configured explicitly.

use crate::credentials::{Credentials, SasCredentials, X509Credentials};
use crate::error::{HubError, HubResult};
use crate::protocol::addresses::DEFAULT_CONSUMER_GROUP;
use crate::protocol::{Event, Qos};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Environment variable holding the device connection string when none is configured
pub const DEFAULT_CONNECTION_STRING_ENV: &str = "IOTHUB_DEVICE_CONNECTION_STRING";

/// Token type sent with every claims-based security put-token request
pub const DEFAULT_TOKEN_TYPE: &str = "servicebus.windows.net:sastoken";

/// Hub API version negotiated over MQTT
pub const DEFAULT_API_VERSION: &str = "2020-09-30";

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HubConfig {
    #[serde(default)]
    pub device: DeviceSection,
    #[serde(default)]
    pub mqtt: MqttSection,
    pub eventhub: Option<EventHubSection>,
    #[serde(default)]
    pub tokens: TokenSection,
}

/// Device identity
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Literal connection string; wins over every other source
    pub connection_string: Option<String>,
    /// Variable consulted when neither a connection string nor x509 material is configured
    #[serde(default = "default_connection_string_env")]
    pub connection_string_env: String,
    pub x509: Option<X509Section>,
}

fn default_connection_string_env() -> String {
    DEFAULT_CONNECTION_STRING_ENV.to_string()
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            connection_string: None,
            connection_string_env: default_connection_string_env(),
            x509: None,
        }
    }
}

impl fmt::Debug for DeviceSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSection")
            .field(
                "connection_string",
                &self.connection_string.as_deref().map(crate::error::redact),
            )
            .field("connection_string_env", &self.connection_string_env)
            .field("x509", &self.x509)
            .finish()
    }
}

/// Certificate identity files
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct X509Section {
    pub device_id: String,
    pub hostname: String,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

/// MQTT transport settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// PEM bundle of trusted roots; system roots are used when absent
    pub ca_file: Option<PathBuf>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Lifetime of the SAS token presented as the MQTT password
    #[serde(default = "default_token_lifetime")]
    pub token_lifetime_secs: u64,
}

fn default_port() -> u16 {
    8883
}

fn default_keep_alive() -> u64 {
    60
}

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_token_lifetime() -> u64 {
    3600
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            keep_alive_secs: default_keep_alive(),
            api_version: default_api_version(),
            ca_file: None,
            connect_timeout_secs: default_connect_timeout(),
            token_lifetime_secs: default_token_lifetime(),
        }
    }
}

impl MqttSection {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn token_lifetime(&self) -> Duration {
        Duration::from_secs(self.token_lifetime_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidConfig("mqtt.port must be non-zero".into()));
        }
        if self.keep_alive_secs < 5 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.keep_alive_secs must be at least 5".into(),
            ));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.connect_timeout_secs must be positive".into(),
            ));
        }
        if self.token_lifetime_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.token_lifetime_secs must be positive".into(),
            ));
        }
        if self.api_version.trim().is_empty() {
            return Err(ConfigError::InvalidConfig("mqtt.api_version is empty".into()));
        }
        Ok(())
    }
}

/// Event hub to consume
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventHubSection {
    pub hostname: String,
    pub name: String,
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
}

fn default_consumer_group() -> String {
    DEFAULT_CONSUMER_GROUP.to_string()
}

impl EventHubSection {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("hostname", &self.hostname),
            ("name", &self.name),
            ("consumer_group", &self.consumer_group),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(format!("eventhub.{field} is empty")));
            }
        }
        Ok(())
    }
}

/// Claims-based security token maintenance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenSection {
    /// Interval between background token renewals (default one hour)
    #[serde(default = "default_renewal_interval")]
    pub renewal_interval_secs: u64,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_renewal_interval() -> u64 {
    3600
}

fn default_token_type() -> String {
    DEFAULT_TOKEN_TYPE.to_string()
}

impl Default for TokenSection {
    fn default() -> Self {
        Self {
            renewal_interval_secs: default_renewal_interval(),
            token_type: default_token_type(),
        }
    }
}

impl TokenSection {
    pub fn renewal_interval(&self) -> Duration {
        Duration::from_secs(self.renewal_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.renewal_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "tokens.renewal_interval_secs must be positive".into(),
            ));
        }
        if self.token_type.trim().is_empty() {
            return Err(ConfigError::InvalidConfig("tokens.token_type is empty".into()));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl HubConfig {
    /// Load and validate a TOML configuration file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: HubConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.mqtt.validate()?;
        self.tokens.validate()?;
        if let Some(eventhub) = &self.eventhub {
            eventhub.validate()?;
        }
        if self.device.connection_string_env.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "device.connection_string_env is empty".into(),
            ));
        }
        Ok(())
    }
}

impl DeviceSection {
    /// Resolve credentials: explicit connection string, then x509 files, then the named
    /// environment variable
    pub fn resolve_credentials(&self) -> HubResult<Arc<dyn Credentials>> {
        if let Some(cs) = &self.connection_string {
            return Ok(Arc::new(SasCredentials::parse(cs)?));
        }
        if let Some(x509) = &self.x509 {
            return Ok(Arc::new(X509Credentials::from_files(
                &x509.device_id,
                &x509.hostname,
                &x509.cert_file,
                &x509.key_file,
            )?));
        }
        credentials_from_env(&self.connection_string_env)
    }
}

/// Parse the connection string stored in environment variable `name`
pub fn credentials_from_env(name: &str) -> HubResult<Arc<dyn Credentials>> {
    let cs = std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ConfigError::EnvVarNotFound(name.to_string()))?;
    Ok(Arc::new(SasCredentials::parse(&cs)?))
}

/// Construction options for the device client
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Explicit credentials; when absent `connection_string_env` is read once at construction
    pub credentials: Option<Arc<dyn Credentials>>,
    pub connection_string_env: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            credentials: None,
            connection_string_env: default_connection_string_env(),
        }
    }
}

impl ClientOptions {
    pub fn with_credentials(credentials: Arc<dyn Credentials>) -> Self {
        Self {
            credentials: Some(credentials),
            ..Default::default()
        }
    }

    pub fn resolve_credentials(&self) -> HubResult<Arc<dyn Credentials>> {
        match &self.credentials {
            Some(credentials) => Ok(credentials.clone()),
            None => credentials_from_env(&self.connection_string_env),
        }
    }
}

/// Options applied to one outgoing device event
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendOptions {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub properties: HashMap<String, String>,
    /// Defaults to at-least-once
    pub qos: Qos,
}

impl SendOptions {
    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_properties(mut self, properties: HashMap<String, String>) -> Self {
        self.properties.extend(properties);
        self
    }

    pub fn with_qos(mut self, qos: Qos) -> Self {
        self.qos = qos;
        self
    }

    pub fn validate(&self) -> HubResult<()> {
        if self.message_id.as_deref().is_some_and(str::is_empty) {
            return Err(HubError::invalid_input("message id is empty"));
        }
        if self.correlation_id.as_deref().is_some_and(str::is_empty) {
            return Err(HubError::invalid_input("correlation id is empty"));
        }
        if let Some(key) = self.properties.keys().find(|k| k.is_empty() || k.starts_with('$')) {
            return Err(HubError::invalid_input(format!(
                "property name {key:?} is empty or reserved"
            )));
        }
        Ok(())
    }

    /// Validate and wrap `payload` into an event
    pub fn into_event(self, payload: impl Into<bytes::Bytes>) -> HubResult<Event> {
        self.validate()?;
        Ok(Event {
            payload: payload.into(),
            message_id: self.message_id,
            correlation_id: self.correlation_id,
            to: None,
            properties: self.properties,
            qos: self.qos,
        })
    }
}
