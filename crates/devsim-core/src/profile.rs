//! Simulation profiles
//!
//! Profiles are validated on construction and read-only afterwards; they are
//! shared by every sender of a device.

use std::time::Duration;

use crate::{DeviceError, DeviceResult};

fn check_probability(name: &str, p: f64) -> DeviceResult<()> {
    if !(0.0..=1.0).contains(&p) {
        return Err(DeviceError::config(format!(
            "{name} must be within [0, 1], got {p}"
        )));
    }
    Ok(())
}

/// Injected latency and loss applied to every send attempt
#[derive(Clone, Debug, PartialEq)]
pub struct NetworkProfile {
    min_delay: Duration,
    max_delay: Duration,
    loss_probability: f64,
}

impl NetworkProfile {
    pub fn new(
        min_delay: Duration,
        max_delay: Duration,
        loss_probability: f64,
    ) -> DeviceResult<Self> {
        if min_delay > max_delay {
            return Err(DeviceError::config(format!(
                "min delay {min_delay:?} exceeds max delay {max_delay:?}"
            )));
        }
        check_probability("loss probability", loss_probability)?;
        Ok(NetworkProfile {
            min_delay,
            max_delay,
            loss_probability,
        })
    }

    /// No delay, no loss
    pub fn perfect() -> Self {
        NetworkProfile {
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            loss_probability: 0.0,
        }
    }

    #[inline]
    pub fn min_delay(&self) -> Duration {
        self.min_delay
    }

    #[inline]
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    #[inline]
    pub fn loss_probability(&self) -> f64 {
        self.loss_probability
    }
}

impl Default for NetworkProfile {
    fn default() -> Self {
        NetworkProfile {
            min_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            loss_probability: 0.1,
        }
    }
}

/// Probability and length of full-device outages
#[derive(Clone, Debug, PartialEq)]
pub struct FailureProfile {
    failure_probability: f64,
    outage_duration: Duration,
}

impl FailureProfile {
    pub fn new(failure_probability: f64, outage_duration: Duration) -> DeviceResult<Self> {
        check_probability("failure probability", failure_probability)?;
        Ok(FailureProfile {
            failure_probability,
            outage_duration,
        })
    }

    /// A device that never fails
    pub fn never() -> Self {
        FailureProfile {
            failure_probability: 0.0,
            outage_duration: Duration::ZERO,
        }
    }

    #[inline]
    pub fn failure_probability(&self) -> f64 {
        self.failure_probability
    }

    #[inline]
    pub fn outage_duration(&self) -> Duration {
        self.outage_duration
    }
}

impl Default for FailureProfile {
    fn default() -> Self {
        FailureProfile {
            failure_probability: 0.05,
            outage_duration: Duration::from_secs(40),
        }
    }
}

/// How the connection supervisor retries a failed broker connect.
///
/// The default retries forever on a fixed interval.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn fixed(interval: Duration) -> Self {
        RetryPolicy {
            interval,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Whether another attempt is allowed after `failures` consecutive failures.
    #[inline]
    pub fn allows(&self, failures: u32) -> bool {
        self.max_attempts.map_or(true, |max| failures < max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::fixed(Duration::from_secs(1))
    }
}
