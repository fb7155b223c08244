//! Pure routing of inbound MQTT traffic and property encoding
//!
//! Nothing here touches the network: topics and payloads go in, routing decisions come out.

use super::connection::TopicBuilder;
use crate::protocol::Event;
use bytes::Bytes;
use rumqttc::{ConnectReturnCode, Event as MqttEvent, Outgoing, Packet};
use std::collections::HashMap;

/// System property carrying the message id
pub const PROP_MESSAGE_ID: &str = "$.mid";
/// System property carrying the correlation id
pub const PROP_CORRELATION_ID: &str = "$.cid";
/// System property carrying the destination of a cloud-to-device message
pub const PROP_TO: &str = "$.to";

/// What the event loop should do with one polled event
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    ConnectionAcknowledged(ConnectReturnCode),
    Publish { topic: String, payload: Bytes },
    /// Broker or local side ended the connection
    Disconnected,
    Other,
}

/// Decoded inbound publish
#[derive(Debug, Clone, PartialEq)]
pub enum InboundRoute {
    CloudToDevice(Event),
    MethodCall {
        method: String,
        request_id: String,
        payload: Bytes,
    },
    TwinResponse(TwinResponse),
    TwinDesired(Bytes),
    Unknown,
}

/// Response to a twin GET or PATCH request
#[derive(Debug, Clone, PartialEq)]
pub struct TwinResponse {
    pub request_id: String,
    pub status: i32,
    pub version: Option<i64>,
    pub payload: Bytes,
}

pub struct MessageHandler;

impl MessageHandler {
    pub fn route_event(event: &MqttEvent) -> EventRoute {
        match event {
            MqttEvent::Incoming(Packet::ConnAck(ack)) => EventRoute::ConnectionAcknowledged(ack.code),
            MqttEvent::Incoming(Packet::Publish(publish)) => EventRoute::Publish {
                topic: publish.topic.clone(),
                payload: publish.payload.clone(),
            },
            MqttEvent::Incoming(Packet::Disconnect) => EventRoute::Disconnected,
            MqttEvent::Outgoing(Outgoing::Disconnect) => EventRoute::Disconnected,
            _ => EventRoute::Other,
        }
    }

    /// Classify an inbound publish for `device_id`
    pub fn route_publish(device_id: &str, topic: &str, payload: Bytes) -> InboundRoute {
        if let Some(rest) = topic.strip_prefix(&TopicBuilder::devicebound_prefix(device_id)) {
            return InboundRoute::CloudToDevice(Self::decode_event(rest, payload));
        }

        if let Some(rest) = topic.strip_prefix("$iothub/methods/POST/") {
            let (method, query) = split_query(rest);
            let query = parse_query(query);
            return match query.get("$rid") {
                Some(rid) if !method.is_empty() => InboundRoute::MethodCall {
                    method: method.to_string(),
                    request_id: rid.clone(),
                    payload,
                },
                _ => InboundRoute::Unknown,
            };
        }

        if let Some(rest) = topic.strip_prefix("$iothub/twin/res/") {
            let (status, query) = split_query(rest);
            let query = parse_query(query);
            return match (status.parse::<i32>(), query.get("$rid")) {
                (Ok(status), Some(rid)) => InboundRoute::TwinResponse(TwinResponse {
                    request_id: rid.clone(),
                    status,
                    version: query.get("$version").and_then(|v| v.parse().ok()),
                    payload,
                }),
                _ => InboundRoute::Unknown,
            };
        }

        if topic.starts_with("$iothub/twin/PATCH/properties/desired/") {
            return InboundRoute::TwinDesired(payload);
        }

        InboundRoute::Unknown
    }

    /// Build a cloud-to-device event from the encoded property segment of its topic
    pub fn decode_event(encoded_properties: &str, payload: Bytes) -> Event {
        let mut event = Event::new(payload);
        for (key, value) in parse_query(encoded_properties) {
            match key.as_str() {
                PROP_MESSAGE_ID => event.message_id = Some(value),
                PROP_CORRELATION_ID => event.correlation_id = Some(value),
                PROP_TO => event.to = Some(value),
                system if system.starts_with("$.") || system.starts_with("iothub-") => {}
                _ => {
                    event.properties.insert(key, value);
                }
            }
        }
        event
    }

    /// Encode an outgoing event's ids and application properties as a topic segment
    ///
    /// Keys are sorted so equal events always produce the same topic.
    pub fn encode_properties(event: &Event) -> String {
        let mut pairs: Vec<(&str, &str)> = Vec::with_capacity(event.properties.len() + 2);
        if let Some(mid) = &event.message_id {
            pairs.push((PROP_MESSAGE_ID, mid));
        }
        if let Some(cid) = &event.correlation_id {
            pairs.push((PROP_CORRELATION_ID, cid));
        }
        let mut properties: Vec<_> = event
            .properties
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        properties.sort_unstable();
        pairs.extend(properties);

        pairs
            .into_iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }
}

/// Split `path/?query` into its path (without trailing slash) and query
fn split_query(s: &str) -> (&str, &str) {
    match s.split_once('?') {
        Some((path, query)) => (path.trim_end_matches('/'), query),
        None => (s.trim_end_matches('/'), ""),
    }
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(k), decode_component(v))
        })
        .collect()
}

fn decode_component(s: &str) -> String {
    urlencoding::decode(s)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| s.to_string())
}
