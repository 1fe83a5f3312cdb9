//! xcomet: supervisor for the xCOMET translation-quality worker.
//!
//! Launches the Python scoring worker, waits for it to announce a port and
//! answer its readiness probe, proxies typed requests to it, and restarts it
//! (within a budget) when health probes keep failing.

mod announce;
mod readiness;
mod version;

pub mod client;
pub mod config;
pub mod error;
pub mod health;
pub mod launcher;
pub mod manager;
pub mod monitor;
pub mod protocol;
pub mod proxy;
pub mod service;
pub mod transport;

pub use announce::{AnnouncementCodec, WorkerLine, parse_line};
pub use client::WorkerClient;
pub use config::{ReferencePolicy, ScriptLocator, SupervisorConfig, TimeoutPolicy};
pub use error::{StartupPhase, SupervisorError};
pub use health::{ManagerSnapshot, MonitorState, WorkerStatus};
pub use launcher::{PythonSpawner, WorkerSpawnConfig, WorkerSpawner};
pub use manager::WorkerManager;
pub use monitor::HealthMonitor;
pub use proxy::RequestProxy;
pub use readiness::{GateConfig, ReadyWorker, pass_readiness_gate};
pub use service::EvaluationService;
pub use version::{VersionInfo, XCOMET_VERSION};
