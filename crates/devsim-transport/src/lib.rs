//! devsim Transport Layer - the broker seam
//!
//! This crate provides:
//! - The transport traits the connection supervisor drives
//! - MQTT 3.1.1 over TCP
//! - An in-memory loopback broker for tests and offline runs
//!
//! # Session Flow
//!
//! ```text
//! Supervisor                Transport                   Broker
//!   |                           |                          |
//!   |-- connect(opts, h) ------>|-- CONNECT -------------->|
//!   |                           |<------------- CONNACK ---|
//!   |          h.on_connect() <-|                          |
//!   |                           |-- SUBSCRIBE(filters) --->|
//!   |<------------- session ----|                          |
//!   |                           |<------------- PUBLISH ---|
//!   |          h.on_message() <-|                          |
//!   |-- session.halt() -------->|   (no DISCONNECT sent)   |
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use devsim_core::{DeviceError, DeviceResult};
use devsim_wire::ConnAck;

pub mod memory;
pub mod tcp;

pub use memory::{MemoryBroker, MemorySession};
pub use tcp::{MqttTcpTransport, TcpSession};

/// Callbacks a transport invokes on behalf of its owner.
///
/// Both methods run on the transport's own tasks and must not block.
pub trait BrokerHandler: Send + Sync + 'static {
    /// Called once the broker accepted the session.
    ///
    /// Returns the topic filters to subscribe to.
    fn on_connect(&self, ack: &ConnAck) -> Vec<String>;

    /// Called for every inbound PUBLISH.
    fn on_message(&self, topic: &str, payload: &[u8]);
}

/// An established broker session
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Publish a payload (QoS 0).
    ///
    /// # Returns
    /// * `Ok(())` - Handed to the link
    /// * `Err(DeviceError::LinkDown)` - Session halted or dead
    async fn publish(&self, topic: &str, payload: Bytes) -> DeviceResult<()>;

    /// Stop the receive and keepalive loops.
    ///
    /// No DISCONNECT is sent and the link is left open; the broker notices
    /// the silence through its keepalive timeout. The link is released when
    /// the session is dropped.
    fn halt(&self);

    /// False once halted or once the broker closed the link.
    fn is_alive(&self) -> bool;
}

/// Establishes broker sessions
#[async_trait]
pub trait BrokerTransport: Send + Sync + 'static {
    async fn connect(
        &self,
        options: &ConnectOptions,
        handler: Arc<dyn BrokerHandler>,
    ) -> DeviceResult<Arc<dyn BrokerSession>>;
}

/// Parameters of one connect attempt
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    /// Keepalive announced to the broker; pings go out at half this period
    pub keep_alive: Duration,
    /// Bound on TCP connect plus CONNACK wait
    pub connect_timeout: Duration,
    /// Bound on a single outbound packet write
    pub write_timeout: Duration,
    pub clean_session: bool,
}

impl ConnectOptions {
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        ConnectOptions {
            host: host.into(),
            port,
            client_id: client_id.into(),
            keep_alive: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(20),
            write_timeout: Duration::from_secs(10),
            clean_session: true,
        }
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Check the options can be carried by CONNECT as given.
    ///
    /// The keepalive is either zero (disabled) or a whole number of
    /// seconds that fits the 16-bit CONNECT field.
    pub fn validate(&self) -> DeviceResult<()> {
        if self.keep_alive.subsec_nanos() != 0 {
            return Err(DeviceError::config(format!(
                "keepalive {:?} is not a whole number of seconds",
                self.keep_alive
            )));
        }
        if self.keep_alive.as_secs() > u64::from(u16::MAX) {
            return Err(DeviceError::config(format!(
                "keepalive {:?} exceeds {}s",
                self.keep_alive,
                u16::MAX
            )));
        }
        if self.connect_timeout.is_zero() {
            return Err(DeviceError::config("connect timeout must be non-zero"));
        }
        if self.write_timeout.is_zero() {
            return Err(DeviceError::config("write timeout must be non-zero"));
        }
        Ok(())
    }

    /// Keepalive in whole seconds as carried by CONNECT
    pub fn keep_alive_secs(&self) -> u16 {
        self.keep_alive.as_secs().min(u16::MAX as u64) as u16
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_keep_alive() {
        let options = ConnectOptions::new("localhost", 1883, "devsim-a");
        assert!(options.validate().is_ok());
        assert!(options.clone().with_keep_alive(Duration::ZERO).validate().is_ok());
        assert!(options
            .clone()
            .with_keep_alive(Duration::from_secs(u64::from(u16::MAX)))
            .validate()
            .is_ok());

        for bad in [
            Duration::from_millis(1),
            Duration::from_millis(500),
            Duration::from_millis(1500),
            Duration::from_secs(u64::from(u16::MAX) + 1),
        ] {
            let result = options.clone().with_keep_alive(bad).validate();
            assert!(matches!(result, Err(DeviceError::InvalidConfig(_))), "{:?}", bad);
        }
    }

    #[test]
    fn test_validate_timeouts() {
        let options = ConnectOptions::new("localhost", 1883, "devsim-a");
        assert!(options
            .clone()
            .with_write_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(options
            .with_connect_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }
}
