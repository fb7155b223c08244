//! Shared access signature credentials
//!
//! Connection strings are `;`-separated `Key=Value` pairs, e.g.
//! `HostName=hub.example.net;DeviceId=sensor-1;SharedAccessKey=<base64>` for a device or
//! `Endpoint=sb://ns.example.net/;SharedAccessKeyName=listen;SharedAccessKey=<base64>` for a
//! service namespace.

use super::Credentials;
use crate::error::{HubError, HubResult};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use std::time::Duration;
use url::Url;

type HmacSha256 = Hmac<Sha256>;

/// Signed token granting access to a resource until `expiry`
#[derive(Clone, PartialEq, Eq)]
pub struct SharedAccessSignature {
    pub resource: String,
    pub signature: String,
    /// Expiry as unix seconds
    pub expiry: i64,
    pub key_name: Option<String>,
}

impl SharedAccessSignature {
    /// Sign `resource` with the base64-encoded shared `key`
    pub fn generate(
        resource: &str,
        key: &str,
        key_name: Option<&str>,
        expiry: i64,
    ) -> HubResult<Self> {
        let key_bytes = STANDARD
            .decode(key)
            .map_err(|e| HubError::credentials(format!("shared access key is not base64: {e}")))?;

        let string_to_sign = format!("{}\n{}", urlencoding::encode(resource), expiry);
        let mut mac = HmacSha256::new_from_slice(&key_bytes)
            .map_err(|e| HubError::credentials(format!("invalid shared access key: {e}")))?;
        mac.update(string_to_sign.as_bytes());
        let signature = STANDARD.encode(mac.finalize().into_bytes());

        Ok(Self {
            resource: resource.to_string(),
            signature,
            expiry,
            key_name: key_name.map(str::to_string),
        })
    }

    /// True once the expiry instant has passed
    pub fn is_expired(&self) -> bool {
        chrono::Utc::now().timestamp() >= self.expiry
    }
}

impl fmt::Display for SharedAccessSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SharedAccessSignature sr={}&sig={}&se={}",
            urlencoding::encode(&self.resource),
            urlencoding::encode(&self.signature),
            self.expiry
        )?;
        if let Some(name) = &self.key_name {
            write!(f, "&skn={}", urlencoding::encode(name))?;
        }
        Ok(())
    }
}

impl fmt::Debug for SharedAccessSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedAccessSignature")
            .field("resource", &self.resource)
            .field("expiry", &self.expiry)
            .field("key_name", &self.key_name)
            .finish_non_exhaustive()
    }
}

/// Credentials parsed from a shared access connection string
#[derive(Clone)]
pub struct SasCredentials {
    hostname: String,
    device_id: Option<String>,
    key_name: Option<String>,
    key: String,
    audience: Option<String>,
    entity_path: Option<String>,
}

impl SasCredentials {
    /// Parse a connection string
    pub fn parse(connection_string: &str) -> HubResult<Self> {
        let mut hostname = None;
        let mut device_id = None;
        let mut key_name = None;
        let mut key = None;
        let mut audience = None;
        let mut entity_path = None;

        for pair in connection_string.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, value) = pair.split_once('=').ok_or_else(|| {
                HubError::credentials(format!("malformed connection string segment {pair:?}"))
            })?;
            let value = value.trim().to_string();
            match name.trim() {
                "HostName" => hostname = Some(value),
                "Endpoint" => hostname = Some(host_from_endpoint(&value)?),
                "DeviceId" => device_id = Some(value),
                "SharedAccessKeyName" => key_name = Some(value),
                "SharedAccessKey" => key = Some(value),
                "Audience" => audience = Some(value),
                "EntityPath" => entity_path = Some(value),
                other => {
                    return Err(HubError::credentials(format!(
                        "unsupported connection string key {other:?}"
                    )))
                }
            }
        }

        let hostname = hostname
            .filter(|h| !h.is_empty())
            .ok_or_else(|| HubError::credentials("connection string has no HostName or Endpoint"))?;
        let key = key
            .filter(|k| !k.is_empty())
            .ok_or_else(|| HubError::credentials("connection string has no SharedAccessKey"))?;
        if device_id.is_none() && key_name.is_none() {
            return Err(HubError::credentials(
                "connection string needs a DeviceId or a SharedAccessKeyName",
            ));
        }
        STANDARD
            .decode(&key)
            .map_err(|e| HubError::credentials(format!("shared access key is not base64: {e}")))?;

        Ok(Self {
            hostname,
            device_id,
            key_name,
            key,
            audience,
            entity_path,
        })
    }

    /// Override the audience every token is issued for
    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    pub fn key_name(&self) -> Option<&str> {
        self.key_name.as_deref()
    }

    pub fn audience(&self) -> Option<&str> {
        self.audience.as_deref()
    }

    pub fn entity_path(&self) -> Option<&str> {
        self.entity_path.as_deref()
    }
}

fn host_from_endpoint(endpoint: &str) -> HubResult<String> {
    let url = Url::parse(endpoint)
        .map_err(|e| HubError::credentials(format!("invalid Endpoint {endpoint:?}: {e}")))?;
    url.host_str()
        .map(str::to_string)
        .ok_or_else(|| HubError::credentials(format!("Endpoint {endpoint:?} has no host")))
}

impl Credentials for SasCredentials {
    fn device_id(&self) -> &str {
        self.device_id.as_deref().unwrap_or_default()
    }

    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn token(&self, audience: &str, lifetime: Duration) -> HubResult<Option<SharedAccessSignature>> {
        let resource = self.audience.as_deref().unwrap_or(audience);
        let lifetime = i64::try_from(lifetime.as_secs())
            .map_err(|_| HubError::invalid_input("token lifetime is too long"))?;
        let expiry = chrono::Utc::now().timestamp() + lifetime;
        SharedAccessSignature::generate(resource, &self.key, self.key_name.as_deref(), expiry).map(Some)
    }
}

impl fmt::Debug for SasCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SasCredentials")
            .field("hostname", &self.hostname)
            .field("device_id", &self.device_id)
            .field("key_name", &self.key_name)
            .field("audience", &self.audience)
            .finish_non_exhaustive()
    }
}
