//! Device event types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Topic Constants
// =============================================================================

/// All topic names as constants.
pub mod topics {
    /// A device record was created.
    pub const DEVICE_CREATE: &str = "DEVICE.CREATE";

    /// A device record is being deleted.
    pub const DEVICE_DELETE: &str = "DEVICE.DELETE";

    /// Pattern matching every device topic.
    pub const DEVICE_ALL: &str = "DEVICE.*";
}

// =============================================================================
// Device
// =============================================================================

/// A device (VPN peer identity) as persisted in the record store.
///
/// Natural key is `(owner, name)`; `public_key` is unique as well.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub owner: String,
    pub owner_name: String,
    pub owner_email: String,
    pub name: String,
    pub public_key: String,

    /// Assigned address as a single-host CIDR (`10.44.0.2/32`).
    pub address: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Most recent handshake observed by the metadata poller.
    pub last_handshake_time: Option<DateTime<Utc>>,

    #[serde(rename = "received_bytes")]
    pub receive_bytes: i64,
    pub transmit_bytes: i64,

    /// Last seen tunnel endpoint (IP only).
    pub endpoint: String,
}

impl Device {
    /// Create a device with no telemetry.
    pub fn new(
        owner: impl Into<String>,
        name: impl Into<String>,
        public_key: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            owner: owner.into(),
            owner_name: String::new(),
            owner_email: String::new(),
            name: name.into(),
            public_key: public_key.into(),
            address: address.into(),
            created_at: now,
            updated_at: now,
            last_handshake_time: None,
            receive_bytes: 0,
            transmit_bytes: 0,
            endpoint: String::new(),
        }
    }

    /// Whether the device handshook recently enough to count as connected.
    pub fn is_connected(&self, now: DateTime<Utc>) -> bool {
        wgfleet_reconcile::is_connected(self.last_handshake_time, now)
    }
}

/// Payload of `DEVICE.*` messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevicePayload {
    /// Topic this payload was published on.
    #[serde(rename = "type")]
    pub kind: String,

    pub device: Option<Device>,
}

impl DevicePayload {
    /// A `DEVICE.CREATE` payload.
    pub fn created(device: Device) -> Self {
        Self {
            kind: topics::DEVICE_CREATE.to_string(),
            device: Some(device),
        }
    }

    /// A `DEVICE.DELETE` payload.
    pub fn deleted(device: Device) -> Self {
        Self {
            kind: topics::DEVICE_DELETE.to_string(),
            device: Some(device),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_json_field_names() {
        let device = Device::new("alice", "laptop", "pk", "10.44.0.2/32");
        let json = serde_json::to_value(&device).unwrap();

        assert_eq!(json["owner"], "alice");
        assert_eq!(json["public_key"], "pk");
        assert_eq!(json["received_bytes"], 0);
        assert_eq!(json["transmit_bytes"], 0);
        assert!(json["last_handshake_time"].is_null());
    }

    #[test]
    fn test_device_is_connected() {
        let now = Utc::now();
        let mut device = Device::new("alice", "laptop", "pk", "10.44.0.2/32");
        assert!(!device.is_connected(now));

        device.last_handshake_time = Some(now - chrono::Duration::seconds(30));
        assert!(device.is_connected(now));

        device.last_handshake_time = Some(now - chrono::Duration::minutes(5));
        assert!(!device.is_connected(now));
    }

    #[test]
    fn test_device_payload_type_tag() {
        let payload = DevicePayload::created(Device::new("alice", "phone", "pk", "10.44.0.3/32"));
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"type\":\"DEVICE.CREATE\""));

        let parsed: DevicePayload = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.kind, topics::DEVICE_CREATE);
        assert_eq!(parsed.device.unwrap().name, "phone");
    }

    #[test]
    fn test_device_payload_without_device() {
        let parsed: DevicePayload =
            serde_json::from_str(r#"{"type":"DEVICE.DELETE","device":null}"#).unwrap();
        assert!(parsed.device.is_none());
    }
}
