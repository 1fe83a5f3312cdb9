//! WorkerManager: sole owner of the worker process and its state.
//!
//! The request proxy and the health monitor never touch [`WorkerState`]
//! directly; they go through the manager's operations. Startup is
//! single-flight: the first caller spawns a startup task, and every caller
//! that arrives while it runs awaits the same shared future and observes the
//! same outcome.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::{Mutex, watch};

use crate::client::{WorkerClient, build_http_client};
use crate::config::SupervisorConfig;
use crate::error::SupervisorError;
use crate::health::{ManagerSnapshot, MonitorState, WorkerStatus};
use crate::launcher::{ExitInfo, WorkerProcess, WorkerSpawnConfig, forward_stderr};
use crate::protocol::WorkerHealth;
use crate::readiness::{GateConfig, ReadyWorker, pass_readiness_gate};

type StartupFuture = Shared<BoxFuture<'static, Result<u16, SupervisorError>>>;

#[derive(Default)]
struct WorkerState {
    process: Option<WorkerProcess>,
    port: Option<u16>,
    ready: bool,
    /// A worker has passed the gate at least once; health probing starts here.
    ever_ready: bool,
    starting: Option<StartupFuture>,
    status: WorkerStatus,
    monitor: MonitorState,
    last_error: Option<String>,
    stopped: bool,
    /// Bumped on every launch, restart and shutdown so that exit watchers of
    /// superseded workers are ignored.
    generation: u64,
    ready_since: Option<DateTime<Utc>>,
}

/// Outcome of asking for a health-driven restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Restart may proceed; `attempt` is the new restart count.
    Begin { attempt: u32 },
    /// Another restart is already running.
    InFlight,
    /// The restart budget is spent.
    Exhausted { max_restarts: u32 },
}

pub struct WorkerManager {
    config: SupervisorConfig,
    http: reqwest::Client,
    gate: GateConfig,
    state: Mutex<WorkerState>,
    restart_count: AtomicU32,
    consecutive_failures: AtomicU32,
    spawn_count: AtomicU64,
    restarting: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl WorkerManager {
    pub fn new(config: SupervisorConfig) -> Result<Arc<Self>, SupervisorError> {
        config.validate()?;
        let http = build_http_client()?;
        let gate = GateConfig::from(&config);
        let (stop_tx, _) = watch::channel(false);
        Ok(Arc::new(Self {
            config,
            http,
            gate,
            state: Mutex::new(WorkerState::default()),
            restart_count: AtomicU32::new(0),
            consecutive_failures: AtomicU32::new(0),
            spawn_count: AtomicU64::new(0),
            restarting: AtomicBool::new(false),
            stop_tx,
        }))
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Return the port of a ready worker, starting one if needed.
    ///
    /// Concurrent callers share one startup attempt. Startup failures are
    /// returned to every caller joined on the attempt and do not trigger an
    /// automatic restart.
    pub async fn ensure_ready(self: &Arc<Self>) -> Result<u16, SupervisorError> {
        let startup = {
            let mut state = self.state.lock().await;
            if state.stopped {
                return Err(SupervisorError::Stopped);
            }
            if state.ready
                && let Some(port) = state.port
            {
                return Ok(port);
            }
            match &state.starting {
                Some(startup) => startup.clone(),
                None => self.begin_startup(&mut state, Duration::ZERO),
            }
        };
        startup.await
    }

    /// A client bound to a ready worker.
    pub async fn client(self: &Arc<Self>) -> Result<WorkerClient, SupervisorError> {
        let port = self.ensure_ready().await?;
        Ok(WorkerClient::new(self.http.clone(), port))
    }

    /// Kill the current worker, wait the restart backoff and start a new one.
    ///
    /// Joins an in-flight startup instead of starting a second one.
    pub async fn restart(self: &Arc<Self>) -> Result<u16, SupervisorError> {
        let startup = {
            let mut state = self.state.lock().await;
            if state.stopped {
                return Err(SupervisorError::Stopped);
            }
            match &state.starting {
                Some(startup) => startup.clone(),
                None => self.begin_startup(&mut state, self.config.restart_backoff),
            }
        };
        startup.await
    }

    fn begin_startup(self: &Arc<Self>, state: &mut WorkerState, backoff: Duration) -> StartupFuture {
        state.generation += 1;
        state.ready = false;
        state.port = None;
        state.status = WorkerStatus::Starting;
        let generation = state.generation;
        let previous = state.process.take();

        let task = tokio::spawn(Arc::clone(self).run_startup(generation, previous, backoff));
        let startup = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(SupervisorError::SpawnFailure(format!(
                    "startup task failed: {}",
                    e
                ))),
            }
        }
        .boxed()
        .shared();

        state.starting = Some(startup.clone());
        startup
    }

    async fn run_startup(
        self: Arc<Self>,
        generation: u64,
        previous: Option<WorkerProcess>,
        backoff: Duration,
    ) -> Result<u16, SupervisorError> {
        if let Some(mut previous) = previous {
            let pid = previous.pid();
            let exit = previous.kill().await;
            tracing::info!(pid, %exit, "Stopped previous xCOMET worker");
        }

        let started = Instant::now();
        let outcome = tokio::select! {
            outcome = async {
                tokio::time::sleep(backoff).await;
                self.launch().await
            } => outcome,
            _ = self.stop_requested() => Err(SupervisorError::Stopped),
        };

        self.finish_startup(generation, outcome, started).await
    }

    async fn launch(&self) -> Result<(WorkerProcess, ReadyWorker), SupervisorError> {
        let spawn_config = WorkerSpawnConfig::from_config(&self.config)?;
        let spawn_number = self.spawn_count.fetch_add(1, Ordering::SeqCst) + 1;
        let child = self.config.spawner.spawn(&spawn_config)?;
        let (process, output) = WorkerProcess::adopt(child)?;

        tracing::info!(
            pid = process.pid(),
            model = %self.config.model,
            spawn = spawn_number,
            "Spawned xCOMET worker"
        );
        if let Some(stderr) = output.stderr {
            forward_stderr(stderr, process.pid());
        }

        let ready = pass_readiness_gate(&process, output.stdout, &self.http, self.gate).await?;
        Ok((process, ready))
    }

    async fn finish_startup(
        self: Arc<Self>,
        generation: u64,
        outcome: Result<(WorkerProcess, ReadyWorker), SupervisorError>,
        started: Instant,
    ) -> Result<u16, SupervisorError> {
        let mut state = self.state.lock().await;
        if state.generation == generation {
            state.starting = None;
        }

        if state.stopped || state.generation != generation {
            drop(state);
            if let Ok((mut process, _)) = outcome {
                let exit = process.kill().await;
                tracing::info!(pid = process.pid(), %exit, "Discarded worker that finished starting after shutdown");
            }
            return Err(SupervisorError::Stopped);
        }

        match outcome {
            Ok((process, ready)) => {
                tracing::info!(
                    port = ready.port,
                    pid = process.pid(),
                    model_loaded = ready.health.model_loaded,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "xCOMET worker ready"
                );
                self.watch_exit(&process, generation);
                state.process = Some(process);
                state.port = Some(ready.port);
                state.ready = true;
                state.ever_ready = true;
                state.status = WorkerStatus::Ready;
                state.last_error = None;
                state.ready_since = Some(Utc::now());
                Ok(ready.port)
            }
            Err(e) => {
                tracing::error!(error = %e, kind = e.kind(), "xCOMET worker failed to start");
                state.status = WorkerStatus::Failed;
                state.last_error = Some(e.to_string());
                state.ready_since = None;
                Err(e)
            }
        }
    }

    fn watch_exit(self: &Arc<Self>, process: &WorkerProcess, generation: u64) {
        let mut exit = process.exit_watch();
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let info = exit.wait_for(|e| e.is_some()).await.ok().and_then(|e| *e);
            if let Some(manager) = manager.upgrade() {
                manager.on_worker_exit(generation, info).await;
            }
        });
    }

    /// Later health probes count as failures, so the monitor decides on a
    /// restart.
    async fn on_worker_exit(&self, generation: u64, exit: Option<ExitInfo>) {
        let mut state = self.state.lock().await;
        if state.stopped || state.generation != generation {
            return;
        }
        let exit = exit.unwrap_or(ExitInfo { code: None });
        tracing::warn!(port = state.port, %exit, "xCOMET worker exited unexpectedly");
        state.process = None;
        state.ready = false;
        state.status = WorkerStatus::Failed;
        state.last_error = Some(format!("worker exited unexpectedly ({})", exit));
        state.ready_since = None;
    }

    /// Stop the worker for good.
    ///
    /// Never starts a worker. With a known port the worker is asked to exit
    /// (short timeout, errors ignored), given a grace period, then killed.
    /// Without a process this only marks the manager stopped.
    pub async fn shutdown(&self) {
        let (process, port, startup) = {
            let mut state = self.state.lock().await;
            if state.stopped {
                return;
            }
            state.stopped = true;
            state.ready = false;
            state.status = WorkerStatus::Stopped;
            state.generation += 1;
            state.ready_since = None;
            (
                state.process.take(),
                state.port.take(),
                state.starting.take(),
            )
        };
        self.stop_tx.send_replace(true);

        if let Some(startup) = startup {
            let _ = startup.await;
        }

        let Some(mut process) = process else {
            tracing::debug!("No xCOMET worker running, nothing to stop");
            return;
        };

        if let Some(port) = port
            && process.try_exit().is_none()
        {
            let client = WorkerClient::new(self.http.clone(), port);
            if let Err(e) = client
                .notify_shutdown(self.config.shutdown_request_timeout)
                .await
            {
                tracing::debug!(port, error = %e, "Shutdown request not acknowledged");
            }
        }

        match process.wait_timeout(self.config.shutdown_grace).await {
            Some(exit) => tracing::info!(pid = process.pid(), %exit, "xCOMET worker stopped"),
            None => {
                tracing::warn!(
                    pid = process.pid(),
                    grace_ms = self.config.shutdown_grace.as_millis() as u64,
                    "xCOMET worker did not exit in time, killing"
                );
                let exit = process.kill().await;
                tracing::info!(pid = process.pid(), %exit, "xCOMET worker killed");
            }
        }
    }

    /// Resolves once `shutdown()` has been called.
    pub async fn stop_requested(&self) {
        let mut rx = self.stop_tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Probe the current worker's `/health`.
    ///
    /// `None` while there is nothing to probe: no worker has ever been ready,
    /// a startup is in flight, or the manager is stopped.
    pub async fn probe_health(&self) -> Option<Result<WorkerHealth, SupervisorError>> {
        let port = {
            let state = self.state.lock().await;
            if state.stopped || !state.ever_ready || state.starting.is_some() {
                return None;
            }
            match state.port {
                Some(port) if state.ready => port,
                _ => {
                    return Some(Err(SupervisorError::TransportFailure {
                        operation: "health",
                        message: "worker process is not running".to_string(),
                    }));
                }
            }
        };
        let client = WorkerClient::new(self.http.clone(), port);
        Some(client.health(self.config.health_timeout).await)
    }

    pub fn record_probe_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    /// Returns the new consecutive failure count.
    pub fn record_probe_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Claim the right to restart. The restart count is charged here, per
    /// attempt, so a worker that never comes back cannot loop forever.
    pub fn try_begin_restart(&self) -> RestartDecision {
        if self
            .restarting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return RestartDecision::InFlight;
        }
        let max_restarts = self.config.max_restarts;
        if self.restart_count.load(Ordering::SeqCst) >= max_restarts {
            self.restarting.store(false, Ordering::SeqCst);
            return RestartDecision::Exhausted { max_restarts };
        }
        let attempt = self.restart_count.fetch_add(1, Ordering::SeqCst) + 1;
        RestartDecision::Begin { attempt }
    }

    pub fn finish_restart(&self, succeeded: bool) {
        if succeeded {
            self.consecutive_failures.store(0, Ordering::SeqCst);
        }
        self.restarting.store(false, Ordering::SeqCst);
    }

    pub fn is_restarting(&self) -> bool {
        self.restarting.load(Ordering::SeqCst)
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count.load(Ordering::SeqCst)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Number of worker processes spawned so far.
    pub fn spawn_count(&self) -> u64 {
        self.spawn_count.load(Ordering::SeqCst)
    }

    pub async fn monitor_state(&self) -> MonitorState {
        self.state.lock().await.monitor
    }

    pub async fn set_monitor_state(&self, monitor: MonitorState) {
        self.state.lock().await.monitor = monitor;
    }

    /// Surface a failure the manager did not observe itself in `last_error`.
    pub async fn record_error(&self, error: &SupervisorError) {
        self.state.lock().await.last_error = Some(error.to_string());
    }

    pub async fn snapshot(&self) -> ManagerSnapshot {
        let state = self.state.lock().await;
        ManagerSnapshot {
            status: state.status,
            monitor: state.monitor,
            port: state.port,
            pid: state.process.as_ref().and_then(WorkerProcess::pid),
            restart_count: self.restart_count(),
            max_restarts: self.config.max_restarts,
            consecutive_failures: self.consecutive_failures(),
            spawn_count: self.spawn_count(),
            last_error: state.last_error.clone(),
            ready_since: state.ready_since.map(|t| t.to_rfc3339()),
        }
    }
}


#[cfg(all(test, unix))]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::error::StartupPhase;
    use crate::launcher::test_support::ShellSpawner;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, ResponseTemplate};

    #[tokio::test]
    async fn ensure_ready_starts_once_and_reuses_worker() {
        let worker = fake_worker().await;
        let port = worker.address().port();
        let scripts = tempfile::tempdir().unwrap();
        let spawner = Arc::new(ShellSpawner::announcing(port));
        let manager = WorkerManager::new(test_config(spawner.clone(), &scripts)).unwrap();

        assert_eq!(manager.ensure_ready().await.unwrap(), port);
        assert_eq!(manager.ensure_ready().await.unwrap(), port);

        assert_eq!(spawner.spawn_count(), 1);
        let snapshot = manager.snapshot().await;
        assert_eq!(snapshot.status, WorkerStatus::Ready);
        assert_eq!(snapshot.port, Some(port));
        assert!(snapshot.pid.is_some());
        assert!(snapshot.ready_since.is_some());
        assert_eq!(snapshot.spawn_count, 1);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_startup() {
        let worker = fake_worker().await;
        let port = worker.address().port();
        let scripts = tempfile::tempdir().unwrap();
        let spawner = Arc::new(ShellSpawner::announcing(port));
        let manager = WorkerManager::new(test_config(spawner.clone(), &scripts)).unwrap();

        let results = futures::future::join_all((0..16).map(|_| {
            let manager = Arc::clone(&manager);
            async move { manager.ensure_ready().await }
        }))
        .await;

        assert!(results.iter().all(|r| r.as_ref() == Ok(&port)), "{results:?}");
        assert_eq!(spawner.spawn_count(), 1);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_failure() {
        let scripts = tempfile::tempdir().unwrap();
        let spawner = Arc::new(ShellSpawner::new("exit 3"));
        let manager = WorkerManager::new(test_config(spawner.clone(), &scripts)).unwrap();

        let results = futures::future::join_all((0..8).map(|_| {
            let manager = Arc::clone(&manager);
            async move { manager.ensure_ready().await }
        }))
        .await;

        let expected = SupervisorError::PrematureExit {
            code: Some(3),
            phase: StartupPhase::AwaitingPort,
        };
        assert!(results.iter().all(|r| r.as_ref() == Err(&expected)), "{results:?}");
        assert_eq!(spawner.spawn_count(), 1);

        let snapshot = manager.snapshot().await;
        assert_eq!(snapshot.status, WorkerStatus::Failed);
        assert!(snapshot.last_error.unwrap().contains("exit code 3"));
    }

    #[tokio::test]
    async fn silent_worker_times_out_at_deadline() {
        let scripts = tempfile::tempdir().unwrap();
        let spawner = Arc::new(ShellSpawner::new("exec sleep 30"));
        let timeout = Duration::from_millis(400);
        let config = test_config(spawner, &scripts).with_startup_timeout(timeout);
        let manager = WorkerManager::new(config).unwrap();

        let started = Instant::now();
        let err = manager.ensure_ready().await.unwrap_err();
        let elapsed = started.elapsed();

        assert_eq!(err, SupervisorError::StartupTimeout { timeout });
        assert!(elapsed >= timeout, "returned early after {elapsed:?}");
        assert!(elapsed < timeout + Duration::from_secs(2), "returned late after {elapsed:?}");
    }

    #[tokio::test]
    async fn startup_failure_is_not_retried_automatically() {
        let scripts = tempfile::tempdir().unwrap();
        let spawner = Arc::new(ShellSpawner::new("exit 1"));
        let manager = WorkerManager::new(test_config(spawner.clone(), &scripts)).unwrap();

        assert!(manager.ensure_ready().await.is_err());
        assert!(manager.probe_health().await.is_none());
        assert_eq!(spawner.spawn_count(), 1);

        // The next caller gets a fresh attempt.
        assert!(manager.ensure_ready().await.is_err());
        assert_eq!(spawner.spawn_count(), 2);
    }

    #[tokio::test]
    async fn missing_script_is_spawn_failure() {
        let spawner = Arc::new(ShellSpawner::new("exit 0"));
        let config = SupervisorConfig::new()
            .with_script(crate::config::ScriptLocator::explicit("/no/such/server.py"))
            .with_spawner(spawner.clone());
        let manager = WorkerManager::new(config).unwrap();

        let err = manager.ensure_ready().await.unwrap_err();
        assert!(matches!(err, SupervisorError::SpawnFailure(ref m) if m.contains("/no/such/server.py")));
        assert_eq!(spawner.spawn_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_without_worker_is_a_noop() {
        let scripts = tempfile::tempdir().unwrap();
        let spawner = Arc::new(ShellSpawner::announcing(1));
        let manager = WorkerManager::new(test_config(spawner.clone(), &scripts)).unwrap();

        tokio::time::timeout(Duration::from_secs(1), manager.shutdown())
            .await
            .unwrap();

        assert_eq!(spawner.spawn_count(), 0);
        assert_eq!(manager.spawn_count(), 0);
        assert_eq!(manager.snapshot().await.status, WorkerStatus::Stopped);
    }

    #[tokio::test]
    async fn shutdown_never_starts_a_new_worker() {
        let worker = fake_worker().await;
        Mock::given(method("POST"))
            .and(path("/shutdown"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"status": "shutting_down"})),
            )
            .expect(1)
            .mount(&worker)
            .await;
        let port = worker.address().port();
        let scripts = tempfile::tempdir().unwrap();
        let spawner = Arc::new(ShellSpawner::announcing(port));
        let manager = WorkerManager::new(test_config(spawner.clone(), &scripts)).unwrap();

        manager.ensure_ready().await.unwrap();
        manager.shutdown().await;
        manager.shutdown().await;

        assert_eq!(spawner.spawn_count(), 1);
        assert_eq!(manager.ensure_ready().await, Err(SupervisorError::Stopped));
        assert_eq!(spawner.spawn_count(), 1);

        let snapshot = manager.snapshot().await;
        assert_eq!(snapshot.status, WorkerStatus::Stopped);
        assert_eq!(snapshot.pid, None);
    }

    #[tokio::test]
    async fn shutdown_during_startup_discards_the_worker() {
        let scripts = tempfile::tempdir().unwrap();
        let spawner = Arc::new(ShellSpawner::new("exec sleep 30"));
        let manager = WorkerManager::new(test_config(spawner.clone(), &scripts)).unwrap();

        let pending = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.ensure_ready().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        tokio::time::timeout(Duration::from_secs(5), manager.shutdown())
            .await
            .unwrap();

        assert_eq!(pending.await.unwrap(), Err(SupervisorError::Stopped));
        assert_eq!(spawner.spawn_count(), 1);
        assert_eq!(manager.snapshot().await.pid, None);
    }

    #[tokio::test]
    async fn unexpected_exit_marks_worker_failed() {
        let worker = fake_worker().await;
        let port = worker.address().port();
        let scripts = tempfile::tempdir().unwrap();
        let spawner = Arc::new(ShellSpawner::new(format!(
            "echo '{{\"port\": {port}}}'; sleep 0.5; exit 4"
        )));
        let manager = WorkerManager::new(test_config(spawner.clone(), &scripts)).unwrap();

        manager.ensure_ready().await.unwrap();

        let mut status = WorkerStatus::Ready;
        for _ in 0..100 {
            status = manager.snapshot().await.status;
            if status == WorkerStatus::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(status, WorkerStatus::Failed);

        let snapshot = manager.snapshot().await;
        assert_eq!(snapshot.port, Some(port));
        assert_eq!(snapshot.pid, None);
        assert!(snapshot.last_error.unwrap().contains("exit code 4"));

        // The next request brings up a replacement on demand.
        assert_eq!(manager.ensure_ready().await.unwrap(), port);
        assert_eq!(spawner.spawn_count(), 2);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn restart_replaces_the_worker() {
        let worker = fake_worker().await;
        let port = worker.address().port();
        let scripts = tempfile::tempdir().unwrap();
        let spawner = Arc::new(ShellSpawner::announcing(port));
        let manager = WorkerManager::new(test_config(spawner.clone(), &scripts)).unwrap();

        manager.ensure_ready().await.unwrap();
        let first_pid = manager.snapshot().await.pid;

        assert_eq!(manager.restart().await.unwrap(), port);

        let snapshot = manager.snapshot().await;
        assert_eq!(spawner.spawn_count(), 2);
        assert_eq!(snapshot.status, WorkerStatus::Ready);
        assert_ne!(snapshot.pid, first_pid);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn restart_budget_is_claimed_per_attempt() {
        let scripts = tempfile::tempdir().unwrap();
        let spawner = Arc::new(ShellSpawner::new("exit 0"));
        let config = test_config(spawner, &scripts).with_max_restarts(2);
        let manager = WorkerManager::new(config).unwrap();

        assert_eq!(manager.try_begin_restart(), RestartDecision::Begin { attempt: 1 });
        assert_eq!(manager.try_begin_restart(), RestartDecision::InFlight);
        manager.finish_restart(false);
        assert_eq!(manager.try_begin_restart(), RestartDecision::Begin { attempt: 2 });
        manager.finish_restart(true);
        assert_eq!(
            manager.try_begin_restart(),
            RestartDecision::Exhausted { max_restarts: 2 }
        );
        assert!(!manager.is_restarting());
        assert_eq!(manager.restart_count(), 2);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let config = SupervisorConfig::new().with_failure_threshold(0);
        assert!(matches!(
            WorkerManager::new(config),
            Err(SupervisorError::InvalidRequest(_))
        ));
    }
}
