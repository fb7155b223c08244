//! Credential providers
//!
//! The device client and the token manager depend only on the [`Credentials`] capability
//! set, never on a concrete variant. Two variants are provided:
//!
//! - [`SasCredentials`] - shared access signatures derived from a connection string
//! - [`X509Credentials`] - TLS client certificate authentication

pub mod sas;
pub mod x509;

pub use sas::{SasCredentials, SharedAccessSignature};
pub use x509::{ClientIdentity, X509Credentials};

use crate::error::HubResult;
use std::fmt;
use std::time::Duration;

/// Capability set of a credential provider
pub trait Credentials: Send + Sync + fmt::Debug {
    /// Device identity; empty for service-level credentials that carry no device id
    fn device_id(&self) -> &str;

    /// Hub hostname the credentials belong to
    fn hostname(&self) -> &str;

    /// Produce a fresh token for `audience`, valid for `lifetime`.
    ///
    /// Returns `None` when the credentials authenticate by other means (client certificate).
    fn token(&self, audience: &str, lifetime: Duration) -> HubResult<Option<SharedAccessSignature>>;

    /// TLS client identity for certificate-based authentication
    fn client_identity(&self) -> Option<&ClientIdentity> {
        None
    }
}

/// Token audience addressing a single device on a hub
pub fn device_audience(hostname: &str, device_id: &str) -> String {
    format!("{hostname}/devices/{device_id}")
}
