//! Observable state of the worker and its health monitor.

use serde::{Deserialize, Serialize};

/// Lifecycle status of the managed worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    /// No worker launched yet
    #[default]
    NotStarted,
    /// Spawned, waiting for the port announcement and /health
    Starting,
    /// Passed the readiness gate
    Ready,
    /// Last startup failed or the process died
    Failed,
    /// Manager shut down; the worker will not come back
    Stopped,
}

/// Health monitor state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorState {
    #[default]
    Healthy,
    /// Probes failing, threshold not reached yet (or a restart failed).
    Degrading,
    Restarting,
    /// Restart warranted but the budget is spent.
    Exhausted,
}

/// Point-in-time view of the manager, for diagnostics and the HTTP front.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagerSnapshot {
    pub status: WorkerStatus,
    pub monitor: MonitorState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub restart_count: u32,
    pub max_restarts: u32,
    pub consecutive_failures: u32,
    pub spawn_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// When the current worker passed its readiness gate (RFC 3339).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready_since: Option<String>,
}

impl ManagerSnapshot {
    pub fn is_ready(&self) -> bool {
        self.status == WorkerStatus::Ready
    }

    pub fn restarts_exhausted(&self) -> bool {
        self.restart_count >= self.max_restarts
    }
}
