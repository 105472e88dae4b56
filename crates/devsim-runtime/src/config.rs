//! Device configuration

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use devsim_core::{
    DeviceError, DeviceIdentity, DeviceResult, FailureProfile, NetworkProfile, RetryPolicy,
};
use devsim_transport::ConnectOptions;

pub const DEFAULT_BROKER_HOST: &str = "mqtt-broker";
pub const DEFAULT_BROKER_PORT: u16 = 1883;
pub const DEFAULT_HTTP_PORT: u16 = 5000;

/// Validated, immutable configuration of one simulated device
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    pub identity: DeviceIdentity,
    pub broker_host: String,
    pub broker_port: u16,
    /// Keepalive announced to the broker
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub network: NetworkProfile,
    pub failure: FailureProfile,
    pub heartbeat_interval: Duration,
    /// Supervisor poll interval and connect retry policy
    pub retry: RetryPolicy,
    pub http_addr: SocketAddr,
    /// Seed for reproducible loss and failure decisions
    pub seed: Option<u64>,
}

impl DeviceConfig {
    pub fn new(identity: DeviceIdentity) -> Self {
        DeviceConfig {
            identity,
            broker_host: DEFAULT_BROKER_HOST.to_string(),
            broker_port: DEFAULT_BROKER_PORT,
            keep_alive: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(20),
            network: NetworkProfile::default(),
            failure: FailureProfile::default(),
            heartbeat_interval: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            http_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_HTTP_PORT)),
            seed: None,
        }
    }

    pub fn with_broker(mut self, host: impl Into<String>, port: u16) -> Self {
        self.broker_host = host.into();
        self.broker_port = port;
        self
    }

    pub fn with_network(mut self, network: NetworkProfile) -> Self {
        self.network = network;
        self
    }

    pub fn with_failure(mut self, failure: FailureProfile) -> Self {
        self.failure = failure;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_http_addr(mut self, addr: SocketAddr) -> Self {
        self.http_addr = addr;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Check the settings not already enforced by the profile types
    pub fn validate(&self) -> DeviceResult<()> {
        if self.broker_host.trim().is_empty() {
            return Err(DeviceError::config("broker host is empty"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(DeviceError::config("heartbeat interval must be non-zero"));
        }
        if self.retry.interval.is_zero() {
            return Err(DeviceError::config("poll interval must be non-zero"));
        }
        if self.retry.max_attempts == Some(0) {
            return Err(DeviceError::config("max connect attempts must be non-zero"));
        }
        if self.keep_alive.subsec_nanos() != 0 {
            return Err(DeviceError::config(format!(
                "keepalive {} is not a whole number of seconds",
                humantime::format_duration(self.keep_alive)
            )));
        }
        if self.keep_alive.as_secs() > u16::MAX as u64 {
            return Err(DeviceError::config(format!(
                "keepalive {} exceeds {}s",
                humantime::format_duration(self.keep_alive),
                u16::MAX
            )));
        }
        self.connect_options().validate()
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions::new(
            self.broker_host.clone(),
            self.broker_port,
            self.identity.client_id(),
        )
        .with_keep_alive(self.keep_alive)
        .with_connect_timeout(self.connect_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DeviceConfig {
        DeviceConfig::new(DeviceIdentity::new("dev-1").unwrap())
    }

    #[test]
    fn test_defaults() {
        let config = config();
        assert!(config.validate().is_ok());
        assert_eq!(config.broker_host, "mqtt-broker");
        assert_eq!(config.broker_port, 1883);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.retry.interval, Duration::from_secs(1));
        assert_eq!(config.http_addr.port(), 5000);
        assert_eq!(config.seed, None);
    }

    #[test]
    fn test_connect_options() {
        let options = config().with_broker("localhost", 1884).connect_options();
        assert_eq!(options.endpoint(), "localhost:1884");
        assert_eq!(options.client_id, "devsim-dev-1");
        assert_eq!(options.keep_alive_secs(), 20);
    }

    #[test]
    fn test_invalid_settings() {
        assert!(config().with_broker(" ", 1883).validate().is_err());
        assert!(config().with_heartbeat_interval(Duration::ZERO).validate().is_err());
        assert!(config()
            .with_retry(RetryPolicy::fixed(Duration::ZERO))
            .validate()
            .is_err());
        assert!(config()
            .with_retry(RetryPolicy::default().with_max_attempts(0))
            .validate()
            .is_err());

        let mut config = config();
        config.keep_alive = Duration::from_secs(100_000);
        assert!(matches!(config.validate(), Err(DeviceError::InvalidConfig(_))));
    }

    #[test]
    fn test_keep_alive_whole_seconds() {
        let mut config = config();
        config.keep_alive = Duration::ZERO;
        assert!(config.validate().is_ok());

        config.keep_alive = Duration::from_millis(500);
        assert!(matches!(config.validate(), Err(DeviceError::InvalidConfig(_))));
        config.keep_alive = Duration::from_millis(2500);
        assert!(matches!(config.validate(), Err(DeviceError::InvalidConfig(_))));

        config.keep_alive = Duration::from_secs(1);
        config.validate().unwrap();
        assert_eq!(config.connect_options().keep_alive_secs(), 1);
    }
}
