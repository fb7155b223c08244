//! Error types for hub client operations
//!
//! Every public operation returns a [`HubError`] rather than aborting. Variants follow the
//! taxonomy of the client: setup failures, protocol failures, lifecycle failures and
//! misuse of configuration.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for hub client operations
///
/// `HubError` is `Clone` so that a single close error can be delivered to every
/// blocked subscriber of a multiplexer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HubError {
    #[error("already connected")]
    AlreadyConnected,

    #[error("client is not connected")]
    NotReady,

    #[error("closed")]
    Closed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("failed to open link {address}: {message}")]
    LinkSetup { address: String, message: String },

    #[error("code = {code}, description = {description:?}")]
    Status { code: i32, description: String },

    #[error("correlation id mismatch: expected {expected}, got {actual:?}")]
    CorrelationMismatch {
        expected: String,
        actual: Option<String>,
    },

    #[error("decode error: {message}")]
    Decode { message: String },

    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    #[error("method {name:?} is already registered")]
    DuplicateMethod { name: String },

    #[error("credentials error: {message}")]
    Credentials { message: String },

    #[error("configuration error: {0}")]
    Config(String),
}

impl HubError {
    /// Create transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create link setup error for the given node address
    pub fn link_setup<A: Into<String>, S: Into<String>>(address: A, message: S) -> Self {
        Self::LinkSetup {
            address: address.into(),
            message: message.into(),
        }
    }

    /// Create decode error
    pub fn decode<S: Into<String>>(message: S) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Create invalid input error
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create credentials error
    pub fn credentials<S: Into<String>>(message: S) -> Self {
        Self::Credentials {
            message: message.into(),
        }
    }

    /// Broker status error
    pub fn status<S: Into<String>>(code: i32, description: S) -> Self {
        Self::Status {
            code,
            description: description.into(),
        }
    }

    /// True for errors produced by the connection lifecycle rather than the network
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            HubError::AlreadyConnected | HubError::NotReady | HubError::Closed | HubError::Cancelled
        )
    }

    /// Display form with credential material removed, suitable for logs and CLI output
    pub fn redacted(&self) -> String {
        redact(&self.to_string())
    }
}

impl From<crate::config::ConfigError> for HubError {
    fn from(err: crate::config::ConfigError) -> Self {
        HubError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        HubError::decode(err.to_string())
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(sig|sharedaccesskey|password|token)=[^;&\s]+").expect("static secret pattern")
});

const MAX_MESSAGE_LEN: usize = 500;

/// Strip signatures, shared keys and over-long content from a message
pub fn redact(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN.replace_all(message, "${1}=***").to_string();

    if sanitized.len() > MAX_MESSAGE_LEN {
        let suffix = "...[truncated]";
        let mut cut = MAX_MESSAGE_LEN - suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], suffix);
    }

    sanitized
}

/// Result type for hub client operations
pub type HubResult<T> = Result<T, HubError>;
