//! devsim node - one simulated MQTT device
//!
//! Every flag falls back to an environment variable so the binary can be
//! configured entirely from a container definition.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use devsim_core::{
    DeviceError, DeviceIdentity, DeviceResult, FailureProfile, NetworkProfile, RetryPolicy,
};
use devsim_runtime::{http, init_tracing, DeviceConfig, DeviceRuntime, LogFormat};
use devsim_transport::{BrokerTransport, MemoryBroker, MqttTcpTransport};

/// Broker host value selecting the in-process loopback broker
const MEMORY_BROKER: &str = "memory";

#[derive(Parser, Debug)]
#[command(
    name = "devsim-node",
    version,
    about = "Simulated MQTT device with injected latency, loss and outages"
)]
struct Args {
    /// Device name, also the topic suffix under mqtt/
    #[arg(long, env = "POD_NAME", default_value = "device")]
    name: String,

    /// Broker host, or "memory" for an in-process broker
    #[arg(long, env = "MQTT_BROKER", default_value = "mqtt-broker")]
    broker: String,

    /// Broker port
    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    /// Minimum injected latency in seconds
    #[arg(long, env = "SIM_MIN_LATENCY", default_value_t = 0.01)]
    min_latency: f64,

    /// Maximum injected latency in seconds
    #[arg(long, env = "SIM_LATENCY", default_value_t = 0.1)]
    latency: f64,

    /// Probability that a send is lost
    #[arg(long, env = "SIM_LOSS", default_value_t = 0.1)]
    loss: f64,

    /// Probability of an outage per heartbeat tick
    #[arg(long, env = "FAIL_PROB", default_value_t = 0.05)]
    fail_prob: f64,

    /// Outage length in seconds
    #[arg(long, env = "FAIL_DUR", default_value_t = 40.0)]
    fail_dur: f64,

    /// Heartbeat period in seconds
    #[arg(long, env = "HEARTBEAT_INTERVAL", default_value_t = 10.0)]
    heartbeat: f64,

    /// MQTT keepalive in seconds
    #[arg(long, env = "MQTT_KEEPALIVE", default_value_t = 20)]
    keep_alive: u16,

    /// HTTP control surface address
    #[arg(long, env = "HTTP_ADDR", default_value = "0.0.0.0:5000")]
    http_addr: SocketAddr,

    /// Seed for reproducible loss and failure decisions
    #[arg(long, env = "SIM_SEED")]
    seed: Option<u64>,

    /// Log format: text or json
    #[arg(long, env = "LOG_FORMAT", default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

impl Args {
    fn device_config(&self) -> DeviceResult<DeviceConfig> {
        let network = NetworkProfile::new(
            seconds("SIM_MIN_LATENCY", self.min_latency)?,
            seconds("SIM_LATENCY", self.latency)?,
            self.loss,
        )?;
        let failure = FailureProfile::new(self.fail_prob, seconds("FAIL_DUR", self.fail_dur)?)?;

        let mut config = DeviceConfig::new(DeviceIdentity::new(self.name.clone())?)
            .with_broker(self.broker.clone(), self.port)
            .with_network(network)
            .with_failure(failure)
            .with_heartbeat_interval(seconds("HEARTBEAT_INTERVAL", self.heartbeat)?)
            .with_retry(RetryPolicy::default())
            .with_http_addr(self.http_addr);
        config.keep_alive = Duration::from_secs(self.keep_alive.into());
        if let Some(seed) = self.seed {
            config = config.with_seed(seed);
        }
        config.validate()?;
        Ok(config)
    }

    fn transport(&self) -> Arc<dyn BrokerTransport> {
        if self.broker == MEMORY_BROKER {
            info!("Using the in-process loopback broker");
            Arc::new(MemoryBroker::new())
        } else {
            Arc::new(MqttTcpTransport::new())
        }
    }
}

fn seconds(name: &str, value: f64) -> DeviceResult<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| DeviceError::config(format!("{name}={value}: {e}")))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = init_tracing(args.log_format) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("devsim-node failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> DeviceResult<()> {
    let config = args.device_config()?;
    let http_addr = config.http_addr;
    let device = Arc::new(DeviceRuntime::new(config, args.transport())?);

    let mut handle = device.start();

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let mut server = tokio::spawn(http::serve(Arc::clone(&device), http_addr, async move {
        let _ = stop_rx.await;
    }));

    let early_exit = tokio::select! {
        _ = shutdown_signal() => {
            info!(pod = %device.identity(), "Shutdown signal received");
            None
        }
        _ = handle.wait() => {
            warn!(pod = %device.identity(), "Device loop exited");
            Some(Err(DeviceError::transport("device loop exited")))
        }
        joined = &mut server => Some(joined.map_err(DeviceError::transport).and_then(|r| r)),
    };

    let _ = stop_tx.send(());
    handle.shutdown().await;

    match early_exit {
        Some(result) => result,
        None => server.await.map_err(DeviceError::transport)?,
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["devsim-node"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_explicit_flags() {
        let args = parse(&[
            "--name=sensor-7",
            "--broker=localhost",
            "--port=1884",
            "--min-latency=0",
            "--latency=0.5",
            "--loss=0.25",
            "--fail-prob=0",
            "--fail-dur=5",
            "--heartbeat=2",
            "--seed=9",
            "--log-format=json",
        ]);
        let config = args.device_config().unwrap();

        assert_eq!(config.identity.name(), "sensor-7");
        assert_eq!(config.connect_options().endpoint(), "localhost:1884");
        assert_eq!(config.network.max_delay(), Duration::from_millis(500));
        assert_eq!(config.network.loss_probability(), 0.25);
        assert_eq!(config.failure.outage_duration(), Duration::from_secs(5));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(2));
        assert_eq!(config.seed, Some(9));
        assert_eq!(args.log_format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_values_fail_startup() {
        let bad_loss = parse(&["--loss", "1.5"]);
        assert!(matches!(bad_loss.device_config(), Err(DeviceError::InvalidConfig(_))));

        let inverted = parse(&["--min-latency", "0.5", "--latency", "0.1"]);
        assert!(inverted.device_config().is_err());

        let negative = parse(&["--fail-dur=-1"]);
        assert!(negative.device_config().is_err());

        let bad_name = parse(&["--name", "a/b"]);
        assert!(bad_name.device_config().is_err());

        assert!(Args::try_parse_from(["devsim-node", "--log-format", "xml"]).is_err());
    }
}
