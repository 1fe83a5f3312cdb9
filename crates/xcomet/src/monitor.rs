//! Health monitor and restart controller.
//!
//! Every interval the monitor probes the worker through the manager. Below
//! the failure threshold it only logs. At the threshold it restarts the
//! worker once, unless the restart budget is spent, in which case it stays
//! `Exhausted` until the process is restarted from outside.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::SupervisorError;
use crate::health::MonitorState;
use crate::manager::{RestartDecision, WorkerManager};

pub struct HealthMonitor {
    manager: Arc<WorkerManager>,
}

impl HealthMonitor {
    pub fn new(manager: Arc<WorkerManager>) -> Self {
        Self { manager }
    }

    /// Run one probe cycle and return the resulting state.
    ///
    /// A restart runs inside the tick, so the periodic loop does not probe
    /// while one is in progress.
    pub async fn tick(&self) -> MonitorState {
        if self.manager.is_restarting() {
            tracing::debug!("Restart in progress, skipping health probe");
            return MonitorState::Restarting;
        }

        let Some(probe) = self.manager.probe_health().await else {
            return self.manager.monitor_state().await;
        };

        let failure = match probe {
            Ok(health) => {
                let recovered = self.manager.consecutive_failures() > 0;
                self.manager.record_probe_success();
                if recovered {
                    tracing::info!(model_loaded = health.model_loaded, "xCOMET worker healthy again");
                }
                return self.enter(MonitorState::Healthy).await;
            }
            Err(e) => e,
        };

        let threshold = self.manager.config().failure_threshold;
        let consecutive_failures = self.manager.record_probe_failure();
        tracing::warn!(
            consecutive_failures,
            threshold,
            error = %failure,
            "xCOMET worker health probe failed"
        );
        if consecutive_failures < threshold {
            return self.enter(MonitorState::Degrading).await;
        }

        match self.manager.try_begin_restart() {
            RestartDecision::InFlight => MonitorState::Restarting,
            RestartDecision::Exhausted { max_restarts } => {
                if self.manager.monitor_state().await != MonitorState::Exhausted {
                    let exhausted = SupervisorError::RestartExhausted { max_restarts };
                    tracing::error!(
                        error = %exhausted,
                        "xCOMET worker unhealthy, giving up on automatic recovery"
                    );
                    self.manager.record_error(&exhausted).await;
                }
                self.enter(MonitorState::Exhausted).await
            }
            RestartDecision::Begin { attempt } => {
                self.enter(MonitorState::Restarting).await;
                tracing::warn!(
                    restart_count = attempt,
                    max_restarts = self.manager.config().max_restarts,
                    "Restarting xCOMET worker"
                );
                let result = self.manager.restart().await;
                self.manager.finish_restart(result.is_ok());
                match result {
                    Ok(port) => {
                        tracing::info!(port, restart_count = attempt, "xCOMET worker restarted");
                        self.enter(MonitorState::Healthy).await
                    }
                    Err(e) => {
                        tracing::error!(error = %e, restart_count = attempt, "xCOMET worker restart failed");
                        self.enter(MonitorState::Degrading).await
                    }
                }
            }
        }
    }

    async fn enter(&self, state: MonitorState) -> MonitorState {
        self.manager.set_monitor_state(state).await;
        state
    }

    /// Probe every `health_interval` until the manager is shut down.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.manager.config().health_interval;
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.tick().await;
                    }
                    _ = self.manager.stop_requested() => break,
                }
            }
            tracing::debug!("Health monitor stopped");
        })
    }
}
