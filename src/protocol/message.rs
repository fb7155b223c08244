//! AMQP-level message carried over transport sessions
//!
//! Request/response exchanges use the application-property convention of a numeric
//! `status-code` and a string `status-description` on every response.

use super::value::Value;
use crate::error::{HubError, HubResult};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Application property holding the response status code
pub const STATUS_CODE: &str = "status-code";

/// Application property holding the response status description
pub const STATUS_DESCRIPTION: &str = "status-description";

/// Status code of a successful request/response exchange
pub const STATUS_OK: i32 = 200;

/// Standard message properties
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub to: Option<String>,
    pub reply_to: Option<String>,
}

/// Message exchanged over a session link
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub value: Value,
    pub properties: MessageProperties,
    pub application_properties: HashMap<String, Value>,
    /// Broker enqueue time annotation, present on messages read from partitions
    pub enqueued_time: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.properties.message_id = Some(id.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.properties.correlation_id = Some(id.into());
        self
    }

    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.properties.to = Some(to.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.properties.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.application_properties.insert(key.into(), value.into());
        self
    }

    pub fn with_enqueued_time(mut self, time: DateTime<Utc>) -> Self {
        self.enqueued_time = Some(time);
        self
    }

    /// Build a response to `request` carrying the given status
    pub fn response_to(request: &Message, code: i32, description: &str) -> Self {
        let mut response = Message::default()
            .with_property(STATUS_CODE, code)
            .with_property(STATUS_DESCRIPTION, description);
        response.properties.correlation_id = request.properties.message_id.clone();
        response.properties.to = request.properties.reply_to.clone();
        response
    }

    /// Decoded `status-code` application property
    pub fn status_code(&self) -> HubResult<i32> {
        let raw = self
            .application_properties
            .get(STATUS_CODE)
            .ok_or_else(|| HubError::decode("response has no status-code"))?
            .as_i64()
            .map_err(|e| HubError::decode(format!("status-code: {e}")))?;
        i32::try_from(raw).map_err(|_| HubError::decode(format!("status-code {raw} out of range")))
    }

    /// `status-description` application property, empty when absent or not a string
    pub fn status_description(&self) -> String {
        self.application_properties
            .get(STATUS_DESCRIPTION)
            .and_then(|v| v.as_str().ok())
            .unwrap_or_default()
            .to_string()
    }
}

/// Check a response for the 200 status code, otherwise surface the broker's code and
/// description
pub fn check_response(message: &Message) -> HubResult<()> {
    let code = message.status_code()?;
    if code == STATUS_OK {
        return Ok(());
    }
    Err(HubError::status(code, message.status_description()))
}

/// Verify that a response echoes the request's message id as its correlation id
pub fn check_correlation(expected: &str, response: &Message) -> HubResult<()> {
    match response.properties.correlation_id.as_deref() {
        Some(actual) if actual == expected => Ok(()),
        actual => Err(HubError::CorrelationMismatch {
            expected: expected.to_string(),
            actual: actual.map(str::to_string),
        }),
    }
}
