//! Device identity
//!
//! The identity is assigned once at startup and never mutated. It derives
//! the topic namespace the device publishes under.

use std::fmt;

use crate::{DeviceError, DeviceResult};

/// Root of every device topic
pub const TOPIC_ROOT: &str = "mqtt";

/// Subscription filter covering all devices
pub const ALL_DEVICES_FILTER: &str = "mqtt/#";

/// Immutable identity of one simulated endpoint
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    name: String,
}

impl DeviceIdentity {
    /// Create an identity, rejecting names that would break the topic namespace.
    pub fn new(name: impl Into<String>) -> DeviceResult<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(DeviceError::config("device name must not be empty"));
        }
        if name.contains(['/', '+', '#']) {
            return Err(DeviceError::config(format!(
                "device name {name:?} contains a topic separator or wildcard"
            )));
        }
        Ok(DeviceIdentity { name })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Topic this device publishes to: `mqtt/{name}`
    pub fn topic(&self) -> String {
        format!("{}/{}", TOPIC_ROOT, self.name)
    }

    /// MQTT client id used for the broker session
    pub fn client_id(&self) -> String {
        format!("devsim-{}", self.name)
    }
}

impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Device({})", self.name)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_namespace() {
        let id = DeviceIdentity::new("sensor-7").unwrap();
        assert_eq!(id.topic(), "mqtt/sensor-7");
        assert_eq!(id.name(), "sensor-7");
        assert_eq!(id.to_string(), "sensor-7");
    }

    #[test]
    fn test_rejects_bad_names() {
        assert!(DeviceIdentity::new("").is_err());
        assert!(DeviceIdentity::new("a/b").is_err());
        assert!(DeviceIdentity::new("dev#").is_err());
        assert!(DeviceIdentity::new("+").is_err());
    }
}
