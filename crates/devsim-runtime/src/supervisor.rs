//! Broker link supervision
//!
//! The supervisor owns the broker session. Its loop polls the shared
//! [`RunState`] on the retry interval, halts the session when an outage
//! begins and reconnects when it ends. A halted session is never closed
//! gracefully: it is kept until the next connect attempt so the broker only
//! learns of the outage through its keepalive timeout.

use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;

use devsim_core::{
    embedded_timestamp, latency_between, unix_now, DeviceError, DeviceIdentity, DeviceResult,
    RetryPolicy, ALL_DEVICES_FILTER,
};
use devsim_transport::{BrokerHandler, BrokerSession, BrokerTransport, ConnectOptions};
use devsim_wire::ConnAck;

use crate::metrics::MetricsCollector;
use crate::state::{LinkState, RunState};

pub struct ConnectionSupervisor {
    identity: DeviceIdentity,
    options: ConnectOptions,
    transport: Arc<dyn BrokerTransport>,
    run_state: Arc<RunState>,
    metrics: Arc<MetricsCollector>,
    retry: RetryPolicy,
    state: watch::Sender<LinkState>,
    session: Mutex<Option<Arc<dyn BrokerSession>>>,
}

impl ConnectionSupervisor {
    pub fn new(
        identity: DeviceIdentity,
        options: ConnectOptions,
        transport: Arc<dyn BrokerTransport>,
        run_state: Arc<RunState>,
        metrics: Arc<MetricsCollector>,
        retry: RetryPolicy,
    ) -> Self {
        ConnectionSupervisor {
            identity,
            options,
            transport,
            run_state,
            metrics,
            retry,
            state: watch::channel(LinkState::Disconnected).0,
            session: Mutex::new(None),
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Wait up to `limit` for the link to become active
    pub async fn wait_until_active(&self, limit: Duration) -> bool {
        let mut link = self.state.subscribe();
        let reached = tokio::time::timeout(limit, link.wait_for(|s| *s == LinkState::Active)).await;
        matches!(reached, Ok(Ok(_)))
    }

    fn set_state(&self, next: LinkState) {
        self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            tracing::debug!(pod = %self.identity, "Link {} -> {}", *state, next);
            *state = next;
            true
        });
    }

    fn session_alive(&self) -> bool {
        self.session.lock().as_ref().map_or(false, |s| s.is_alive())
    }

    /// Publish through the current session.
    ///
    /// Rejected with [`DeviceError::LinkDown`] unless the link is active and
    /// the device is not paused.
    pub async fn publish(&self, topic: &str, payload: Bytes) -> DeviceResult<()> {
        if self.run_state.is_paused() || self.state() != LinkState::Active {
            return Err(DeviceError::LinkDown);
        }
        let session = self.session.lock().clone().ok_or(DeviceError::LinkDown)?;
        session.publish(topic, payload).await
    }

    /// Count an inbound message and record its latency when the payload
    /// carries a timestamp.
    pub fn on_message_received(&self, topic: &str, payload: &[u8]) {
        let latency =
            embedded_timestamp(payload).and_then(|sent| latency_between(sent, unix_now()));
        match latency {
            Some(latency) => tracing::debug!(topic, ?latency, "Received message"),
            None => tracing::debug!(
                topic,
                payload = %String::from_utf8_lossy(payload),
                "Received message without a usable timestamp"
            ),
        }
        self.metrics.record_received(latency);
    }

    /// Availability loop.
    ///
    /// Runs until the retry policy gives up; with an unbounded policy it
    /// never returns.
    pub async fn run(self: Arc<Self>) -> DeviceResult<()> {
        let handler: Arc<dyn BrokerHandler> = Arc::new(SupervisorHandler(Arc::downgrade(&self)));
        let interval = self.retry.interval;
        let mut failures: u32 = 0;

        loop {
            if self.run_state.is_paused() {
                self.suspend();
                tokio::time::sleep(interval).await;
                continue;
            }

            match self.state() {
                LinkState::Active => {
                    if !self.session_alive() {
                        tracing::warn!(pod = %self.identity, "Broker session lost");
                        self.session.lock().take();
                        self.set_state(LinkState::Disconnected);
                    }
                    tokio::time::sleep(interval).await;
                    continue;
                }
                LinkState::Paused => {
                    tracing::info!(pod = %self.identity, "Outage over, reconnecting");
                }
                LinkState::Disconnected | LinkState::Connecting => {}
            }

            match self.connect_once(&handler).await {
                Ok(()) => failures = 0,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    self.set_state(LinkState::Disconnected);
                    tracing::error!(
                        pod = %self.identity,
                        endpoint = %self.options.endpoint(),
                        attempt = failures,
                        "Broker connect failed: {}",
                        e
                    );
                    if !self.retry.allows(failures) {
                        return Err(DeviceError::RetriesExhausted(failures));
                    }
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }

    async fn connect_once(&self, handler: &Arc<dyn BrokerHandler>) -> DeviceResult<()> {
        self.set_state(LinkState::Connecting);
        // Release the halted link from the last outage, if any
        self.session.lock().take();

        let session = self.transport.connect(&self.options, Arc::clone(handler)).await?;

        if self.run_state.is_paused() {
            session.halt();
            *self.session.lock() = Some(session);
            self.set_state(LinkState::Paused);
            return Ok(());
        }

        *self.session.lock() = Some(session);
        self.set_state(LinkState::Active);
        tracing::info!(
            pod = %self.identity,
            endpoint = %self.options.endpoint(),
            "Connected to broker"
        );
        Ok(())
    }

    fn suspend(&self) {
        if self.state() == LinkState::Paused {
            return;
        }
        if let Some(session) = self.session.lock().as_ref() {
            session.halt();
        }
        self.set_state(LinkState::Paused);
        tracing::warn!(pod = %self.identity, "Link paused, transport loop stopped");
    }
}

impl BrokerHandler for ConnectionSupervisor {
    fn on_connect(&self, ack: &ConnAck) -> Vec<String> {
        tracing::debug!(pod = %self.identity, session_present = ack.session_present, "CONNACK");
        vec![ALL_DEVICES_FILTER.to_string()]
    }

    fn on_message(&self, topic: &str, payload: &[u8]) {
        self.on_message_received(topic, payload);
    }
}

/// Registered with the transport in place of the supervisor itself, so a
/// session never keeps its owner alive.
struct SupervisorHandler(Weak<ConnectionSupervisor>);

impl BrokerHandler for SupervisorHandler {
    fn on_connect(&self, ack: &ConnAck) -> Vec<String> {
        self.0.upgrade().map(|s| s.on_connect(ack)).unwrap_or_default()
    }

    fn on_message(&self, topic: &str, payload: &[u8]) {
        if let Some(supervisor) = self.0.upgrade() {
            supervisor.on_message(topic, payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devsim_core::Message;
    use devsim_transport::MemoryBroker;
    use std::time::Duration;

    struct Fixture {
        broker: MemoryBroker,
        supervisor: Arc<ConnectionSupervisor>,
        run_state: Arc<RunState>,
        metrics: Arc<MetricsCollector>,
    }

    fn fixture(retry: RetryPolicy) -> Fixture {
        let broker = MemoryBroker::new();
        let identity = DeviceIdentity::new("dev-1").unwrap();
        let run_state = Arc::new(RunState::new());
        let metrics = Arc::new(MetricsCollector::new());
        let supervisor = Arc::new(ConnectionSupervisor::new(
            identity.clone(),
            ConnectOptions::new("memory", 0, identity.client_id()),
            Arc::new(broker.clone()),
            run_state.clone(),
            metrics.clone(),
            retry,
        ));
        Fixture {
            broker,
            supervisor,
            run_state,
            metrics,
        }
    }

    fn heartbeat_payload() -> Bytes {
        let identity = DeviceIdentity::new("dev-1").unwrap();
        Bytes::from(Message::heartbeat(&identity, unix_now()).to_payload().unwrap())
    }

    async fn sleep_ms(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_and_receives_own_traffic() {
        let f = fixture(RetryPolicy::default());
        assert_eq!(f.supervisor.state(), LinkState::Disconnected);
        tokio::spawn(f.supervisor.clone().run());
        sleep_ms(10).await;

        assert_eq!(f.supervisor.state(), LinkState::Active);
        assert_eq!(f.broker.connection_count(), 1);

        f.supervisor.publish("mqtt/dev-1", heartbeat_payload()).await.unwrap();

        let snap = f.metrics.snapshot();
        assert_eq!(snap.received, 1);
        assert_eq!(snap.recent_latencies.len(), 1);
        assert!(snap.average_latency.unwrap() >= 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_before_connect_is_rejected() {
        let f = fixture(RetryPolicy::default());
        let result = f.supervisor.publish("mqtt/dev-1", heartbeat_payload()).await;
        assert!(matches!(result, Err(DeviceError::LinkDown)));
        assert_eq!(f.broker.published_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_halts_and_resume_reconnects() {
        let f = fixture(RetryPolicy::default());
        tokio::spawn(f.supervisor.clone().run());
        sleep_ms(10).await;

        f.run_state.pause();
        // Rejected at once, before the loop notices
        assert!(matches!(
            f.supervisor.publish("mqtt/dev-1", heartbeat_payload()).await,
            Err(DeviceError::LinkDown)
        ));

        sleep_ms(1500).await;
        assert_eq!(f.supervisor.state(), LinkState::Paused);
        assert_eq!(f.broker.live_sessions(), 0);
        assert_eq!(f.broker.published_count(), 0);

        f.run_state.resume();
        sleep_ms(1500).await;
        assert_eq!(f.supervisor.state(), LinkState::Active);
        assert_eq!(f.broker.connection_count(), 2);
        assert_eq!(f.broker.live_sessions(), 1);

        f.supervisor.publish("mqtt/dev-1", heartbeat_payload()).await.unwrap();
        assert_eq!(f.broker.published_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_retry_gives_up() {
        let f = fixture(RetryPolicy::fixed(Duration::from_secs(1)).with_max_attempts(3));
        f.broker.set_refuse_connections(true);

        let result = f.supervisor.clone().run().await;
        assert!(matches!(result, Err(DeviceError::RetriesExhausted(3))));
        assert_eq!(f.supervisor.state(), LinkState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_retry_keeps_trying() {
        let f = fixture(RetryPolicy::default());
        f.broker.set_refuse_connections(true);

        let task = tokio::spawn(f.supervisor.clone().run());
        sleep_ms(5500).await;
        assert!(!task.is_finished());
        assert_eq!(f.supervisor.state(), LinkState::Disconnected);

        f.broker.set_refuse_connections(false);
        sleep_ms(1500).await;
        assert_eq!(f.supervisor.state(), LinkState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_session_is_replaced() {
        let f = fixture(RetryPolicy::default());
        tokio::spawn(f.supervisor.clone().run());
        sleep_ms(10).await;

        f.broker.sever_all();
        sleep_ms(2500).await;

        assert_eq!(f.supervisor.state(), LinkState::Active);
        assert_eq!(f.broker.connection_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_payload_still_counted() {
        let f = fixture(RetryPolicy::default());
        tokio::spawn(f.supervisor.clone().run());
        sleep_ms(10).await;

        f.broker.publish_external("mqtt/other", &b"not json"[..]).unwrap();
        f.broker
            .publish_external("mqtt/other", &b"{\"timestamp\":\"soon\"}"[..])
            .unwrap();

        let snap = f.metrics.snapshot();
        assert_eq!(snap.received, 2);
        assert_eq!(snap.average_latency, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_active() {
        let f = fixture(RetryPolicy::default());
        assert!(!f.supervisor.wait_until_active(Duration::from_millis(500)).await);

        tokio::spawn(f.supervisor.clone().run());
        assert!(f.supervisor.wait_until_active(Duration::from_millis(500)).await);
        // Already active resolves at once
        assert!(f.supervisor.wait_until_active(Duration::ZERO).await);
    }
}
