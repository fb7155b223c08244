//! Device-to-cloud and cloud-to-device event messages

use crate::error::{HubError, HubResult};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Delivery guarantee requested for an outgoing event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Qos {
    AtMostOnce,
    #[default]
    AtLeastOnce,
}

impl Qos {
    /// Only levels 0 and 1 are supported by the hub
    pub fn from_level(level: u8) -> HubResult<Self> {
        match level {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            other => Err(HubError::invalid_input(format!(
                "unsupported quality of service {other}, only 0 and 1 are allowed"
            ))),
        }
    }

    pub fn level(self) -> u8 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
        }
    }
}

/// Event payload with its system and application properties
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Event {
    pub payload: Bytes,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    /// Cloud-side address the event was sent to, set on inbound events only
    pub to: Option<String>,
    pub properties: HashMap<String, String>,
    pub qos: Qos,
}

impl Event {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }

    /// Payload as UTF-8 text, lossy for binary payloads
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_levels() {
        assert_eq!(Qos::from_level(0).unwrap(), Qos::AtMostOnce);
        assert_eq!(Qos::from_level(1).unwrap(), Qos::AtLeastOnce);
        assert!(Qos::from_level(2).is_err());
        assert_eq!(Qos::default().level(), 1);
    }

    #[test]
    fn test_payload_text() {
        let event = Event::new(&b"hello"[..]);
        assert_eq!(event.payload_text(), "hello");
        assert_eq!(event.qos, Qos::AtLeastOnce);
    }
}
