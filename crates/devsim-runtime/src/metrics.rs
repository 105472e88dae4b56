//! Traffic metrics

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;

/// Number of latency samples exposed by a snapshot
pub const RECENT_LATENCY_WINDOW: usize = 10;

#[derive(Debug, Default)]
struct MetricsInner {
    sent: u64,
    received: u64,
    /// Running sum in seconds over every recorded sample
    latency_sum: f64,
    latency_count: u64,
    recent: VecDeque<Duration>,
}

/// Counters for sent and received messages plus latency aggregates.
///
/// One lock guards everything so a receive and its latency sample land
/// together.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    inner: Mutex<MetricsInner>,
}

/// Point-in-time view of the metrics
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub sent: u64,
    pub received: u64,
    /// Mean of all recorded latencies in seconds, `None` before the first
    pub average_latency: Option<f64>,
    /// Most recent latencies, oldest first
    pub recent_latencies: Vec<Duration>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self) {
        self.inner.lock().sent += 1;
    }

    /// Count one inbound message, with its latency when it carried a usable
    /// timestamp.
    pub fn record_received(&self, latency: Option<Duration>) {
        let mut inner = self.inner.lock();
        inner.received += 1;

        if let Some(latency) = latency {
            inner.latency_sum += latency.as_secs_f64();
            inner.latency_count += 1;
            if inner.recent.len() == RECENT_LATENCY_WINDOW {
                inner.recent.pop_front();
            }
            inner.recent.push_back(latency);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock();
        let average_latency = if inner.latency_count == 0 {
            None
        } else {
            Some(inner.latency_sum / inner.latency_count as f64)
        };

        MetricsSnapshot {
            sent: inner.sent,
            received: inner.received,
            average_latency,
            recent_latencies: inner.recent.iter().copied().collect(),
        }
    }
}
