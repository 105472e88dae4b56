//! Heartbeat and on-demand publishing

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use devsim_core::{unix_now, DeviceError, DeviceIdentity, Message};

use crate::failure::FailureInjector;
use crate::metrics::MetricsCollector;
use crate::network::NetworkConditionSimulator;
use crate::state::RunState;
use crate::supervisor::ConnectionSupervisor;

/// Error reported when the simulated network drops an on-demand publish
pub const LOSS_ERROR: &str = "Simulated packet loss";

/// Error reported when the link is down
pub const OFFLINE_ERROR: &str = "Device offline";

/// Outcome of an on-demand publish
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PublishResult {
    pub published: bool,
    pub topic: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of one heartbeat tick
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Sent,
    /// Dropped by the simulated network
    Lost,
    /// Still paused after the failure check
    Paused,
    /// The link rejected the publish
    Offline,
}

pub struct PublishScheduler {
    identity: DeviceIdentity,
    supervisor: Arc<ConnectionSupervisor>,
    network: Arc<NetworkConditionSimulator>,
    failure: Arc<FailureInjector>,
    run_state: Arc<RunState>,
    metrics: Arc<MetricsCollector>,
    period: Duration,
}

impl PublishScheduler {
    pub fn new(
        identity: DeviceIdentity,
        supervisor: Arc<ConnectionSupervisor>,
        network: Arc<NetworkConditionSimulator>,
        failure: Arc<FailureInjector>,
        run_state: Arc<RunState>,
        metrics: Arc<MetricsCollector>,
        period: Duration,
    ) -> Self {
        PublishScheduler {
            identity,
            supervisor,
            network,
            failure,
            run_state,
            metrics,
            period,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Emit a heartbeat every period, forever
    pub async fn run_heartbeat_loop(&self) {
        loop {
            let outcome = self.heartbeat_once().await;
            tracing::trace!(pod = %self.identity, ?outcome, "Heartbeat tick");
            tokio::time::sleep(self.period).await;
        }
    }

    /// One heartbeat tick: failure check, then a gated send.
    ///
    /// Loss and link errors are silent here.
    pub async fn heartbeat_once(&self) -> HeartbeatOutcome {
        if self.failure.check_and_maybe_fail(&self.run_state).await {
            // Give the supervisor a poll or two to bring the link back
            let limit = (self.supervisor.retry_policy().interval * 2).min(self.period);
            if !self.supervisor.wait_until_active(limit).await {
                tracing::debug!(pod = %self.identity, "Link still down after outage");
            }
        }
        if self.run_state.is_paused() {
            return HeartbeatOutcome::Paused;
        }

        if !self.network.attempt_send().await {
            return HeartbeatOutcome::Lost;
        }

        let message = Message::heartbeat(&self.identity, unix_now());
        match self.send(&message).await {
            Ok(()) => {
                tracing::debug!(pod = %self.identity, "Heartbeat sent");
                HeartbeatOutcome::Sent
            }
            Err(DeviceError::LinkDown) => {
                tracing::debug!(pod = %self.identity, "Heartbeat dropped, link down");
                HeartbeatOutcome::Offline
            }
            Err(e) => {
                tracing::warn!(pod = %self.identity, "Heartbeat publish failed: {}", e);
                HeartbeatOutcome::Offline
            }
        }
    }

    /// Publish a custom message and report what happened
    pub async fn publish_custom(&self, text: &str) -> PublishResult {
        let mut result = PublishResult {
            published: false,
            topic: self.identity.topic(),
            message: text.to_string(),
            error: None,
        };

        if !self.network.attempt_send().await {
            result.error = Some(LOSS_ERROR.to_string());
            return result;
        }

        let message = Message::custom(&self.identity, text, unix_now());
        match self.send(&message).await {
            Ok(()) => result.published = true,
            Err(DeviceError::LinkDown) => result.error = Some(OFFLINE_ERROR.to_string()),
            Err(e) => result.error = Some(e.to_string()),
        }
        result
    }

    async fn send(&self, message: &Message) -> Result<(), DeviceError> {
        let payload = Bytes::from(message.to_payload()?);
        self.supervisor.publish(&self.identity.topic(), payload).await?;
        self.metrics.record_sent();
        Ok(())
    }
}
