//! Wall-clock helpers
//!
//! Message timestamps are float seconds since the Unix epoch so that any
//! receiver can compute `now - timestamp` without sharing a clock type.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current wall-clock time as float seconds since the Unix epoch.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Latency between an embedded send timestamp and a receive timestamp.
///
/// A sender whose clock runs ahead yields a negative difference; that is
/// clamped to zero. Non-finite or out-of-range inputs yield `None`.
pub fn latency_between(sent_at: f64, received_at: f64) -> Option<Duration> {
    let delta = received_at - sent_at;
    if !delta.is_finite() {
        return None;
    }
    Duration::try_from_secs_f64(delta.max(0.0)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_between() {
        assert_eq!(latency_between(10.0, 10.5), Some(Duration::from_millis(500)));
        assert_eq!(latency_between(10.0, 9.0), Some(Duration::ZERO));
        assert_eq!(latency_between(f64::NAN, 9.0), None);
        assert_eq!(latency_between(f64::NEG_INFINITY, 9.0), None);
        assert_eq!(latency_between(-1e300, 9.0), None);
    }

    #[test]
    fn test_unix_now_is_epoch_seconds() {
        assert!(unix_now() > 1_600_000_000.0);
    }
}
