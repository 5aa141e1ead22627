//! Bus envelope and claim-check pointer.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::EventError;

/// Suffix of the per-topic sequence counter key.
pub const NEXT_ID_SUFFIX: &str = "nextId";

/// Prefix of the per-pointer claim lock key.
pub const LOCK_PREFIX: &str = "lock";

/// Envelope metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Trace propagation headers (W3C `traceparent` and friends).
    #[serde(
        rename = "otelTraceHeader",
        default,
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub otel_trace_header: HashMap<String, String>,
}

/// The event envelope stored in the payload store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Topic the message was published on (e.g., "DEVICE.CREATE").
    #[serde(rename = "Topic")]
    pub topic: String,

    /// Opaque payload, usually JSON-encoded domain data.
    #[serde(rename = "Payload")]
    pub payload: String,

    /// Propagation metadata.
    #[serde(default)]
    pub metadata: Metadata,
}

impl Message {
    /// Create a message with empty metadata.
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            metadata: Metadata::default(),
        }
    }

    /// Create a message whose payload is `value` encoded as JSON.
    pub fn json<T: Serialize>(topic: impl Into<String>, value: &T) -> Result<Self, EventError> {
        Ok(Self::new(topic, serde_json::to_string(value)?))
    }

    /// Decode the payload as JSON.
    pub fn decode_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, EventError> {
        serde_json::from_str(&self.payload)
            .map_err(|e| EventError::InvalidPayload {
                topic: self.topic.clone(),
                reason: e.to_string(),
            })
    }

    /// An envelope without a payload carries nothing to act on.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Serialize for the payload store.
    pub fn to_json(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from the payload store.
    pub fn from_json(s: &str) -> Result<Self, EventError> {
        Ok(serde_json::from_str(s)?)
    }
}

/// Claim-check pointer sent on the broadcast channel: `{Topic, Key}`.
///
/// `key` is the per-topic sequence number assigned at publish time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pointer {
    #[serde(rename = "Topic")]
    pub topic: String,

    #[serde(rename = "Key")]
    pub key: i64,
}

impl Pointer {
    /// Create a pointer.
    pub fn new(topic: impl Into<String>, key: i64) -> Self {
        Self {
            topic: topic.into(),
            key,
        }
    }

    /// Key of the stored envelope (`{topic}.{seq}`).
    pub fn payload_key(&self) -> String {
        payload_key(&self.topic, self.key)
    }

    /// Key of the claim lock (`lock.{topic}.{seq}`).
    pub fn lock_key(&self) -> String {
        format!("{}.{}", LOCK_PREFIX, self.payload_key())
    }

    /// Serialize for the broadcast channel.
    pub fn to_json(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from the broadcast channel.
    pub fn from_json(s: &str) -> Result<Self, EventError> {
        Ok(serde_json::from_str(s)?)
    }
}

/// Key of the per-topic sequence counter (`{topic}.nextId`).
pub fn sequence_key(topic: &str) -> String {
    format!("{}.{}", topic, NEXT_ID_SUFFIX)
}

/// Key of a stored envelope (`{topic}.{seq}`).
pub fn payload_key(topic: &str, seq: i64) -> String {
    format!("{}.{}", topic, seq)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_wire_format() {
        let mut msg = Message::new("DEVICE.CREATE", "{\"type\":\"DEVICE.CREATE\"}");
        msg.metadata
            .otel_trace_header
            .insert("traceparent".to_string(), "00-abc-def-01".to_string());

        let json: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json["Topic"], "DEVICE.CREATE");
        assert_eq!(json["Payload"], "{\"type\":\"DEVICE.CREATE\"}");
        assert_eq!(
            json["metadata"]["otelTraceHeader"]["traceparent"],
            "00-abc-def-01"
        );
    }

    #[test]
    fn test_message_without_metadata_parses() {
        let msg = Message::from_json(r#"{"Topic":"DEVICE.DELETE","Payload":"x"}"#).unwrap();
        assert_eq!(msg.topic, "DEVICE.DELETE");
        assert!(msg.metadata.otel_trace_header.is_empty());
    }

    #[test]
    fn test_empty_message() {
        assert!(Message::default().is_empty());
        assert!(Message::new("DEVICE.CREATE", "").is_empty());
        assert!(!Message::new("DEVICE.CREATE", "{}").is_empty());
    }

    #[test]
    fn test_decode_payload_error_names_topic() {
        let err = Message::new("DEVICE.CREATE", "nope")
            .decode_payload::<serde_json::Value>()
            .unwrap_err();
        assert!(matches!(err, EventError::InvalidPayload { ref topic, .. } if topic == "DEVICE.CREATE"));
    }

    #[test]
    fn test_pointer_keys() {
        let pointer = Pointer::new("DEVICE.CREATE", 42);
        assert_eq!(pointer.payload_key(), "DEVICE.CREATE.42");
        assert_eq!(pointer.lock_key(), "lock.DEVICE.CREATE.42");
        assert_eq!(sequence_key("DEVICE.CREATE"), "DEVICE.CREATE.nextId");
    }

    #[test]
    fn test_pointer_wire_format() {
        let json = Pointer::new("DEVICE.CREATE", 7).to_json().unwrap();
        assert_eq!(json, r#"{"Topic":"DEVICE.CREATE","Key":7}"#);

        assert!(Pointer::from_json("not json").is_err());
        assert!(Pointer::from_json(r#"{"Topic":"x"}"#).is_err());
    }
}
