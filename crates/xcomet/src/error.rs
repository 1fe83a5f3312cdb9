//! Error types for the worker supervisor.
//!
//! Startup failures (`SpawnFailure`, `StartupTimeout`, `PrematureExit`,
//! `ReadinessTimeout`) are shared by every caller joined on the same startup
//! attempt, so the enum is `Clone` and carries rendered messages rather than
//! source errors.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to spawn xCOMET worker: {0}")]
    SpawnFailure(String),

    #[error("xCOMET worker did not announce a port within {}s", .timeout.as_secs_f64())]
    StartupTimeout { timeout: Duration },

    #[error("xCOMET worker exited {phase} ({})", describe_exit(.code))]
    PrematureExit {
        code: Option<i32>,
        phase: StartupPhase,
    },

    #[error("xCOMET worker announced port {port} but /health did not succeed after {attempts} attempts")]
    ReadinessTimeout { port: u16, attempts: u32 },

    #[error("{operation} timed out after {}s", .timeout.as_secs_f64())]
    RequestTimeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("xCOMET worker rejected request ({status}): {detail}")]
    WorkerError { status: u16, detail: String },

    #[error("{operation} failed talking to xCOMET worker: {message}")]
    TransportFailure {
        operation: &'static str,
        message: String,
    },

    #[error("automatic restart budget exhausted after {max_restarts} restarts")]
    RestartExhausted { max_restarts: u32 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("worker manager has been stopped")]
    Stopped,
}

/// Which half of the readiness gate the worker died in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupPhase {
    AwaitingPort,
    AwaitingHealth,
}

impl std::fmt::Display for StartupPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AwaitingPort => f.write_str("before announcing a port"),
            Self::AwaitingHealth => f.write_str("before answering its readiness probe"),
        }
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

impl SupervisorError {
    /// The worker never became ready.
    pub fn is_startup_failure(&self) -> bool {
        matches!(
            self,
            Self::SpawnFailure(_)
                | Self::StartupTimeout { .. }
                | Self::PrematureExit { .. }
                | Self::ReadinessTimeout { .. }
        )
    }

    /// The worker was ready but this particular call failed.
    pub fn is_request_failure(&self) -> bool {
        matches!(
            self,
            Self::RequestTimeout { .. } | Self::WorkerError { .. } | Self::TransportFailure { .. }
        )
    }

    /// Stable identifier used in transport error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SpawnFailure(_) => "spawn_failure",
            Self::StartupTimeout { .. } => "startup_timeout",
            Self::PrematureExit { .. } => "premature_exit",
            Self::ReadinessTimeout { .. } => "readiness_timeout",
            Self::RequestTimeout { .. } => "request_timeout",
            Self::WorkerError { .. } => "worker_error",
            Self::TransportFailure { .. } => "transport_failure",
            Self::RestartExhausted { .. } => "restart_exhausted",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Stopped => "stopped",
        }
    }
}
