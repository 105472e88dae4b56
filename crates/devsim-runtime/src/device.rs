//! Device runtime - the composed simulated endpoint

use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinSet;

use devsim_core::{DeviceIdentity, DeviceResult};
use devsim_transport::BrokerTransport;

use crate::config::DeviceConfig;
use crate::failure::FailureInjector;
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::network::NetworkConditionSimulator;
use crate::scheduler::{PublishResult, PublishScheduler};
use crate::state::{LinkState, RunState};
use crate::supervisor::ConnectionSupervisor;

/// Offsets the failure stream from the network stream for a shared seed
const FAILURE_SEED_OFFSET: u64 = 0x9e37_79b9_7f4a_7c15;

/// Control-surface status. Always online: only the broker link goes down.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub pod: String,
    pub status: &'static str,
}

/// Broker link view
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LinkStatus {
    pub pod: String,
    pub state: LinkState,
    pub paused: bool,
    /// Simulated outages so far
    pub outages: u64,
    /// Sends dropped by the simulated network so far
    pub dropped: u64,
}

pub struct DeviceRuntime {
    config: DeviceConfig,
    run_state: Arc<RunState>,
    metrics: Arc<MetricsCollector>,
    network: Arc<NetworkConditionSimulator>,
    failure: Arc<FailureInjector>,
    supervisor: Arc<ConnectionSupervisor>,
    scheduler: Arc<PublishScheduler>,
}

impl DeviceRuntime {
    /// Wire up one device over `transport`
    pub fn new(config: DeviceConfig, transport: Arc<dyn BrokerTransport>) -> DeviceResult<Self> {
        config.validate()?;

        let identity = config.identity.clone();
        let run_state = Arc::new(RunState::new());
        let metrics = Arc::new(MetricsCollector::new());

        let (network, failure) = match config.seed {
            Some(seed) => (
                NetworkConditionSimulator::with_seed(config.network.clone(), seed),
                FailureInjector::with_seed(
                    identity.clone(),
                    config.failure.clone(),
                    seed ^ FAILURE_SEED_OFFSET,
                ),
            ),
            None => (
                NetworkConditionSimulator::new(config.network.clone()),
                FailureInjector::new(identity.clone(), config.failure.clone()),
            ),
        };
        let network = Arc::new(network);
        let failure = Arc::new(failure);

        let supervisor = Arc::new(ConnectionSupervisor::new(
            identity.clone(),
            config.connect_options(),
            transport,
            Arc::clone(&run_state),
            Arc::clone(&metrics),
            config.retry.clone(),
        ));

        let scheduler = Arc::new(PublishScheduler::new(
            identity,
            Arc::clone(&supervisor),
            Arc::clone(&network),
            Arc::clone(&failure),
            Arc::clone(&run_state),
            Arc::clone(&metrics),
            config.heartbeat_interval,
        ));

        Ok(DeviceRuntime {
            config,
            run_state,
            metrics,
            network,
            failure,
            supervisor,
            scheduler,
        })
    }

    /// Spawn the link supervisor and the heartbeat loop
    pub fn start(&self) -> RuntimeHandle {
        let mut tasks = JoinSet::new();

        let supervisor = Arc::clone(&self.supervisor);
        let pod = self.identity().clone();
        tasks.spawn(async move {
            if let Err(e) = supervisor.run().await {
                tracing::error!(%pod, "Link supervisor stopped: {}", e);
            }
        });

        let scheduler = Arc::clone(&self.scheduler);
        tasks.spawn(async move { scheduler.run_heartbeat_loop().await });

        tracing::info!(
            pod = %self.identity(),
            endpoint = %format!("{}:{}", self.config.broker_host, self.config.broker_port),
            heartbeat = %humantime::format_duration(self.config.heartbeat_interval),
            "Device started"
        );
        RuntimeHandle { tasks }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.config.identity
    }

    pub fn run_state(&self) -> &Arc<RunState> {
        &self.run_state
    }

    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }

    pub fn scheduler(&self) -> &Arc<PublishScheduler> {
        &self.scheduler
    }

    pub fn network(&self) -> &Arc<NetworkConditionSimulator> {
        &self.network
    }

    pub fn failure_injector(&self) -> &Arc<FailureInjector> {
        &self.failure
    }

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus {
            pod: self.identity().name().to_string(),
            status: "online",
        }
    }

    pub fn link_status(&self) -> LinkStatus {
        LinkStatus {
            pod: self.identity().name().to_string(),
            state: self.supervisor.state(),
            paused: self.run_state.is_paused(),
            outages: self.failure.outages(),
            dropped: self.network.dropped(),
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub async fn publish(&self, text: &str) -> PublishResult {
        self.scheduler.publish_custom(text).await
    }
}

/// Running daemon loops of a started device
pub struct RuntimeHandle {
    tasks: JoinSet<()>,
}

impl RuntimeHandle {
    /// Resolves when either loop exits on its own
    pub async fn wait(&mut self) {
        if let Some(Err(e)) = self.tasks.join_next().await {
            if e.is_panic() {
                tracing::error!("Device task panicked: {}", e);
            }
        }
    }

    /// Abort both loops and wait for them to unwind
    pub async fn shutdown(mut self) {
        self.tasks.shutdown().await;
    }
}
