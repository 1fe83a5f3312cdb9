//! Two-phase readiness gate.
//!
//! Phase one reads the worker's stdout until it announces a port. Phase two
//! polls `GET /health` on that port, because the worker prints the port
//! before its listener accepts connections. Both phases race the process
//! exit and one overall startup deadline.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::codec::FramedRead;

use crate::announce::{AnnouncementCodec, WorkerLine};
use crate::client::WorkerClient;
use crate::config::SupervisorConfig;
use crate::error::{StartupPhase, SupervisorError};
use crate::launcher::WorkerProcess;
use crate::protocol::WorkerHealth;

#[derive(Debug, Clone, Copy)]
pub struct GateConfig {
    pub startup_timeout: Duration,
    pub readiness_interval: Duration,
    pub readiness_attempts: u32,
    pub probe_timeout: Duration,
}

impl From<&SupervisorConfig> for GateConfig {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            startup_timeout: config.startup_timeout,
            readiness_interval: config.readiness_interval,
            readiness_attempts: config.readiness_attempts,
            probe_timeout: config.health_timeout,
        }
    }
}

/// A worker that passed the gate.
#[derive(Debug, Clone)]
pub struct ReadyWorker {
    pub port: u16,
    pub health: WorkerHealth,
}

/// Run both phases against a freshly spawned worker.
///
/// After the port is found the rest of stdout keeps being drained in the
/// background so the worker never blocks on a full pipe.
pub async fn pass_readiness_gate<R>(
    process: &WorkerProcess,
    stdout: R,
    http: &reqwest::Client,
    gate: GateConfig,
) -> Result<ReadyWorker, SupervisorError>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let deadline = Instant::now() + gate.startup_timeout;
    let mut lines = FramedRead::new(stdout, AnnouncementCodec::new());

    let port = discover_port(&mut lines, process, deadline, gate.startup_timeout).await?;
    tracing::debug!(port, pid = process.pid(), "Worker announced port");
    drain_stdout(lines, process.pid());

    let client = WorkerClient::new(http.clone(), port);
    let health = await_health(&client, port, process, deadline, gate).await?;
    Ok(ReadyWorker { port, health })
}

async fn discover_port<R>(
    lines: &mut FramedRead<R, AnnouncementCodec>,
    process: &WorkerProcess,
    deadline: Instant,
    timeout: Duration,
) -> Result<u16, SupervisorError>
where
    R: AsyncRead + Unpin,
{
    let read = async {
        while let Some(item) = lines.next().await {
            match item {
                Ok(WorkerLine::Announce(announcement)) => return Some(announcement.port),
                Ok(WorkerLine::Log(line)) => {
                    if !line.is_empty() {
                        tracing::debug!(target: "xcomet::worker", "{}", line);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed reading worker stdout");
                    break;
                }
            }
        }
        None
    };

    let premature = |code| SupervisorError::PrematureExit {
        code,
        phase: StartupPhase::AwaitingPort,
    };

    tokio::select! {
        biased;

        port = read => match port {
            Some(port) => Ok(port),
            // stdout closed without an announcement; the exit or the deadline decides.
            None => tokio::select! {
                exit = process.exited() => Err(premature(exit.code)),
                _ = sleep_until(deadline) => Err(SupervisorError::StartupTimeout { timeout }),
            },
        },
        exit = process.exited() => Err(premature(exit.code)),
        _ = sleep_until(deadline) => Err(SupervisorError::StartupTimeout { timeout }),
    }
}

async fn await_health(
    client: &WorkerClient,
    port: u16,
    process: &WorkerProcess,
    deadline: Instant,
    gate: GateConfig,
) -> Result<WorkerHealth, SupervisorError> {
    let attempts_made = AtomicU32::new(0);

    let probe = async {
        for attempt in 1..=gate.readiness_attempts {
            attempts_made.store(attempt, Ordering::Relaxed);
            match client.health(gate.probe_timeout).await {
                Ok(health) => {
                    tracing::debug!(port, attempt, model_loaded = health.model_loaded, "Worker answered readiness probe");
                    return Ok(health);
                }
                Err(e) => {
                    tracing::trace!(port, attempt, error = %e, "Readiness probe failed");
                }
            }
            if attempt < gate.readiness_attempts {
                sleep(gate.readiness_interval).await;
            }
        }
        Err(SupervisorError::ReadinessTimeout {
            port,
            attempts: gate.readiness_attempts,
        })
    };

    tokio::select! {
        biased;

        result = probe => result,
        exit = process.exited() => Err(SupervisorError::PrematureExit {
            code: exit.code,
            phase: StartupPhase::AwaitingHealth,
        }),
        _ = sleep_until(deadline) => Err(SupervisorError::ReadinessTimeout {
            port,
            attempts: attempts_made.load(Ordering::Relaxed),
        }),
    }
}

fn drain_stdout<R>(mut lines: FramedRead<R, AnnouncementCodec>, pid: Option<u32>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(item) = lines.next().await {
            match item {
                Ok(WorkerLine::Log(line)) if !line.is_empty() => {
                    tracing::debug!(target: "xcomet::worker", pid, "{}", line);
                }
                Ok(WorkerLine::Announce(announcement)) => {
                    tracing::warn!(pid, port = announcement.port, "Ignoring repeated port announcement");
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });
}
