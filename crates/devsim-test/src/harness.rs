//! Device harness over the in-memory broker

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use devsim_core::{
    DeviceError, DeviceIdentity, DeviceResult, FailureProfile, NetworkProfile, RetryPolicy,
};
use devsim_runtime::{http, DeviceConfig, DeviceRuntime, LinkState, PublishResult, RuntimeHandle};
use devsim_transport::MemoryBroker;

use crate::client::ControlClient;

/// Knobs for one harnessed device.
///
/// Defaults: no delay, no loss, no outages, 10s heartbeat, 1s poll, seed 42.
#[derive(Clone, Debug)]
pub struct HarnessConfig {
    pub name: String,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub loss: f64,
    pub failure_probability: f64,
    pub outage: Duration,
    pub heartbeat: Duration,
    pub poll: Duration,
    pub seed: u64,
}

impl HarnessConfig {
    pub fn new(name: impl Into<String>) -> Self {
        HarnessConfig {
            name: name.into(),
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            loss: 0.0,
            failure_probability: 0.0,
            outage: Duration::ZERO,
            heartbeat: Duration::from_secs(10),
            poll: Duration::from_secs(1),
            seed: 42,
        }
    }

    pub fn loss(mut self, probability: f64) -> Self {
        self.loss = probability;
        self
    }

    pub fn delay(mut self, min: Duration, max: Duration) -> Self {
        self.min_delay = min;
        self.max_delay = max;
        self
    }

    pub fn failures(mut self, probability: f64, outage: Duration) -> Self {
        self.failure_probability = probability;
        self.outage = outage;
        self
    }

    pub fn heartbeat(mut self, period: Duration) -> Self {
        self.heartbeat = period;
        self
    }

    pub fn poll(mut self, interval: Duration) -> Self {
        self.poll = interval;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn device_config(&self) -> DeviceResult<DeviceConfig> {
        Ok(DeviceConfig::new(DeviceIdentity::new(self.name.clone())?)
            .with_broker("memory", 0)
            .with_network(NetworkProfile::new(self.min_delay, self.max_delay, self.loss)?)
            .with_failure(FailureProfile::new(self.failure_probability, self.outage)?)
            .with_heartbeat_interval(self.heartbeat)
            .with_retry(RetryPolicy::fixed(self.poll))
            .with_http_addr(SocketAddr::from(([127, 0, 0, 1], 0)))
            .with_seed(self.seed))
    }
}

/// One device wired to an in-memory broker
pub struct DeviceHarness {
    broker: MemoryBroker,
    device: Arc<DeviceRuntime>,
    handle: Option<RuntimeHandle>,
}

impl DeviceHarness {
    pub fn new(config: &HarnessConfig) -> DeviceResult<Self> {
        Self::on_broker(MemoryBroker::new(), config)
    }

    /// Attach to an existing broker, sharing it with other devices
    pub fn on_broker(broker: MemoryBroker, config: &HarnessConfig) -> DeviceResult<Self> {
        let device = DeviceRuntime::new(config.device_config()?, Arc::new(broker.clone()))?;
        Ok(DeviceHarness {
            broker,
            device: Arc::new(device),
            handle: None,
        })
    }

    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    pub fn device(&self) -> &Arc<DeviceRuntime> {
        &self.device
    }

    /// Start the supervisor and heartbeat loops once
    pub fn start(&mut self) {
        if self.handle.is_none() {
            self.handle = Some(self.device.start());
        }
    }

    /// Poll until the link reaches `state`
    pub async fn wait_for_link(&self, state: LinkState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.device.link_status().state == state {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Start and wait for an active link
    pub async fn start_active(&mut self) -> DeviceResult<()> {
        self.start();
        if self.wait_for_link(LinkState::Active, Duration::from_secs(5)).await {
            Ok(())
        } else {
            Err(DeviceError::transport("link never became active"))
        }
    }

    /// Sequential on-demand publishes
    pub async fn publish_many(&self, count: usize, text: &str) -> Vec<PublishResult> {
        let mut results = Vec::with_capacity(count);
        for _ in 0..count {
            results.push(self.device.publish(text).await);
        }
        results
    }

    /// Serve the control surface on an ephemeral local port
    pub async fn spawn_http(&self) -> DeviceResult<ControlServer> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(http::serve_on(Arc::clone(&self.device), listener, async move {
            let _ = stopped.await;
        }));
        Ok(ControlServer {
            client: ControlClient::new(format!("http://{addr}")),
            stop: Some(stop),
            task,
        })
    }

    pub async fn shutdown(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.shutdown().await;
        }
    }
}

/// A running control surface
pub struct ControlServer {
    client: ControlClient,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<DeviceResult<()>>,
}

impl ControlServer {
    pub fn client(&self) -> &ControlClient {
        &self.client
    }

    /// Graceful stop
    pub async fn stop(mut self) -> DeviceResult<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        (&mut self.task).await.map_err(DeviceError::transport)?
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        if self.stop.is_some() {
            self.task.abort();
        }
    }
}

/// Several devices on one broker
pub struct Fleet {
    broker: MemoryBroker,
    devices: Vec<DeviceHarness>,
}

impl Fleet {
    pub fn new(configs: &[HarnessConfig]) -> DeviceResult<Self> {
        let broker = MemoryBroker::new();
        let devices = configs
            .iter()
            .map(|config| DeviceHarness::on_broker(broker.clone(), config))
            .collect::<DeviceResult<Vec<_>>>()?;
        Ok(Fleet { broker, devices })
    }

    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    pub fn device(&self, index: usize) -> Option<&DeviceHarness> {
        self.devices.get(index)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Start every device without waiting on its link
    pub fn start_all(&mut self) {
        for device in &mut self.devices {
            device.start();
        }
    }

    pub async fn start_active(&mut self) -> DeviceResult<()> {
        for device in &mut self.devices {
            device.start_active().await?;
        }
        Ok(())
    }

    pub async fn shutdown(self) {
        for device in self.devices {
            device.shutdown().await;
        }
    }
}
