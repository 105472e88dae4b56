//! devsim Runtime - one simulated device
//!
//! This crate implements the device core:
//! - `NetworkConditionSimulator`: injected delay and loss on every send
//! - `FailureInjector`: random full outages of bounded length
//! - `MetricsCollector`: sent / received / latency aggregation
//! - `ConnectionSupervisor`: broker link state machine
//! - `PublishScheduler`: heartbeat loop and on-demand publish
//! - `DeviceRuntime`: composition plus the HTTP control surface
//!
//! # Link States
//!
//! ```text
//!                 connect ok
//! Disconnected -> Connecting -> Active
//!      ^              |           |  paused
//!      +-- error -----+           v
//!                 Connecting <- Paused
//!                        resumed
//! ```

pub mod config;
pub mod device;
pub mod failure;
pub mod http;
pub mod metrics;
pub mod network;
pub mod scheduler;
pub mod state;
pub mod supervisor;
pub mod telemetry;

pub use config::*;
pub use device::*;
pub use failure::*;
pub use metrics::*;
pub use network::*;
pub use scheduler::*;
pub use state::*;
pub use supervisor::*;
pub use telemetry::{init_tracing, LogFormat};
