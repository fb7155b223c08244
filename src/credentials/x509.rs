//! X.509 certificate credentials

use super::{Credentials, SharedAccessSignature};
use crate::error::{HubError, HubResult};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// PEM-encoded certificate chain and private key presented during the TLS handshake
#[derive(Clone)]
pub struct ClientIdentity {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

impl ClientIdentity {
    pub fn from_pem(cert_pem: Vec<u8>, key_pem: Vec<u8>) -> HubResult<Self> {
        if !looks_like_pem(&cert_pem) {
            return Err(HubError::credentials("certificate is not PEM encoded"));
        }
        if !looks_like_pem(&key_pem) {
            return Err(HubError::credentials("private key is not PEM encoded"));
        }
        Ok(Self { cert_pem, key_pem })
    }

    pub fn from_files(cert_file: &Path, key_file: &Path) -> HubResult<Self> {
        let read = |path: &Path| {
            std::fs::read(path).map_err(|e| {
                HubError::credentials(format!("failed to read {}: {e}", path.display()))
            })
        };
        Self::from_pem(read(cert_file)?, read(key_file)?)
    }
}

fn looks_like_pem(bytes: &[u8]) -> bool {
    String::from_utf8_lossy(bytes).contains("-----BEGIN ")
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("cert_len", &self.cert_pem.len())
            .finish_non_exhaustive()
    }
}

/// Certificate-based credentials for one device
#[derive(Debug, Clone)]
pub struct X509Credentials {
    device_id: String,
    hostname: String,
    identity: ClientIdentity,
}

impl X509Credentials {
    pub fn new(
        device_id: impl Into<String>,
        hostname: impl Into<String>,
        identity: ClientIdentity,
    ) -> HubResult<Self> {
        let device_id = device_id.into();
        let hostname = hostname.into();
        if device_id.is_empty() {
            return Err(HubError::credentials("device id is empty"));
        }
        if hostname.is_empty() {
            return Err(HubError::credentials("hostname is empty"));
        }
        Ok(Self {
            device_id,
            hostname,
            identity,
        })
    }

    pub fn from_files(
        device_id: impl Into<String>,
        hostname: impl Into<String>,
        cert_file: &Path,
        key_file: &Path,
    ) -> HubResult<Self> {
        Self::new(device_id, hostname, ClientIdentity::from_files(cert_file, key_file)?)
    }
}

impl Credentials for X509Credentials {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn token(&self, _audience: &str, _lifetime: Duration) -> HubResult<Option<SharedAccessSignature>> {
        Ok(None)
    }

    fn client_identity(&self) -> Option<&ClientIdentity> {
        Some(&self.identity)
    }
}
