//! Device message wire format
//!
//! Messages are JSON objects:
//!
//! ```text
//! {"pod": "device-1", "type": "heartbeat", "timestamp": 1718000000.25}
//! {"pod": "device-1", "type": "custom", "message": "hello", "timestamp": 1718000000.5}
//! ```
//!
//! A message is built at publish time, serialized, and not retained.

use serde::{Deserialize, Serialize};

use crate::{DeviceIdentity, DeviceResult};

/// Message kind, serialized as the `type` field
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Custom,
    Heartbeat,
}

/// A message published by a device
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub pod: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Float seconds since the Unix epoch at publish time
    pub timestamp: f64,
}

impl Message {
    pub fn heartbeat(identity: &DeviceIdentity, timestamp: f64) -> Self {
        Message {
            pod: identity.name().to_string(),
            kind: MessageKind::Heartbeat,
            message: None,
            timestamp,
        }
    }

    pub fn custom(identity: &DeviceIdentity, text: impl Into<String>, timestamp: f64) -> Self {
        Message {
            pod: identity.name().to_string(),
            kind: MessageKind::Custom,
            message: Some(text.into()),
            timestamp,
        }
    }

    pub fn to_payload(&self) -> DeviceResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_payload(payload: &[u8]) -> DeviceResult<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

#[derive(Deserialize)]
struct TimestampField {
    timestamp: f64,
}

/// Extract the embedded `timestamp` from an inbound payload.
///
/// Any JSON object with a numeric `timestamp` qualifies, not only payloads
/// produced by devsim. Anything else yields `None`.
pub fn embedded_timestamp(payload: &[u8]) -> Option<f64> {
    serde_json::from_slice::<TimestampField>(payload)
        .ok()
        .map(|field| field.timestamp)
}
