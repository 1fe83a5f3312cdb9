//! Worker process launcher.
//!
//! A [`WorkerSpawner`] produces the child; [`WorkerProcess`] then takes
//! exclusive ownership of it. The `Child` itself lives in a watcher task
//! that reports the exit status and performs kills, so nothing else ever
//! holds it across an await.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{oneshot, watch};

use crate::config::SupervisorConfig;
use crate::error::SupervisorError;

/// Everything a spawner needs to start one worker.
#[derive(Debug, Clone)]
pub struct WorkerSpawnConfig {
    pub python: PathBuf,
    pub script: PathBuf,
    pub env: Vec<(String, String)>,
}

impl WorkerSpawnConfig {
    /// Resolve the script and build the worker's environment.
    pub fn from_config(config: &SupervisorConfig) -> Result<Self, SupervisorError> {
        let script = config.script.resolve()?;
        Ok(Self {
            python: config.python.clone(),
            script,
            env: worker_env(&config.model, config.preload),
        })
    }
}

/// Environment handed to the worker: model selection, eager preload, a
/// self-selected port, and switches that keep stdout/stderr quiet.
pub fn worker_env(model: &str, preload: bool) -> Vec<(String, String)> {
    vec![
        ("XCOMET_MODEL".to_string(), model.to_string()),
        (
            "XCOMET_PRELOAD".to_string(),
            if preload { "true" } else { "false" }.to_string(),
        ),
        ("PORT".to_string(), "0".to_string()),
        ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
        ("PYTHONWARNINGS".to_string(), "ignore".to_string()),
        ("TOKENIZERS_PARALLELISM".to_string(), "false".to_string()),
        ("TF_CPP_MIN_LOG_LEVEL".to_string(), "3".to_string()),
        ("TRANSFORMERS_VERBOSITY".to_string(), "error".to_string()),
    ]
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

impl From<SpawnError> for SupervisorError {
    fn from(e: SpawnError) -> Self {
        SupervisorError::SpawnFailure(e.to_string())
    }
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, config: &WorkerSpawnConfig) -> Result<Child, SpawnError>;
}

/// Runs `python server.py` with piped stdout/stderr.
pub struct PythonSpawner;

impl WorkerSpawner for PythonSpawner {
    fn spawn(&self, config: &WorkerSpawnConfig) -> Result<Child, SpawnError> {
        let child = Command::new(&config.python)
            .arg(&config.script)
            .envs(config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SpawnError::Other(format!(
                    "could not run {} {}: {}",
                    config.python.display(),
                    config.script.display(),
                    e
                ))
            })?;
        Ok(child)
    }
}

/// How the worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {code}"),
            None => f.write_str("terminated by signal"),
        }
    }
}

/// Exclusive handle on a running worker.
///
/// Dropping the handle kills the process.
pub struct WorkerProcess {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
}

/// Output streams detached from the child before it is handed to the watcher.
pub struct WorkerOutput {
    pub stdout: ChildStdout,
    pub stderr: Option<ChildStderr>,
}

impl WorkerProcess {
    /// Take ownership of `child`, splitting off its output streams.
    pub fn adopt(mut child: Child) -> Result<(Self, WorkerOutput), SpawnError> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Other("stdout not captured".to_string()))?;
        let stderr = child.stderr.take();
        let pid = child.id();

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = watch::channel(None);

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                // Fires on an explicit kill and when the handle is dropped.
                _ = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        tracing::debug!(error = %e, "Worker already gone when killed");
                    }
                    child.wait().await
                }
            };
            let info = match status {
                Ok(status) => ExitInfo {
                    code: status.code(),
                },
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to wait for worker process");
                    ExitInfo { code: None }
                }
            };
            let _ = exit_tx.send(Some(info));
        });

        Ok((
            Self {
                pid,
                kill_tx: Some(kill_tx),
                exit_rx,
            },
            WorkerOutput { stdout, stderr },
        ))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit status if the process has already ended.
    pub fn try_exit(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    /// Wait until the process ends.
    pub async fn exited(&self) -> ExitInfo {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(info) = *rx.borrow_and_update() {
                return info;
            }
            if rx.changed().await.is_err() {
                return (*rx.borrow()).unwrap_or(ExitInfo { code: None });
            }
        }
    }

    /// A receiver that observes the exit, independent of this handle.
    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exit_rx.clone()
    }

    /// Request termination without waiting.
    pub fn start_kill(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Terminate and wait for the exit.
    pub async fn kill(&mut self) -> ExitInfo {
        self.start_kill();
        self.exited().await
    }

    /// Wait up to `timeout` for the process to end on its own.
    pub async fn wait_timeout(&self, timeout: std::time::Duration) -> Option<ExitInfo> {
        tokio::time::timeout(timeout, self.exited()).await.ok()
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        self.start_kill();
    }
}

/// Re-emit the worker's stderr through tracing.
pub fn forward_stderr(stderr: ChildStderr, pid: Option<u32>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim_end();
                    if !line.is_empty() {
                        tracing::info!(target: "xcomet::worker", pid, "{}", line);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(target: "xcomet::worker", pid, error = %e, "stderr read failed");
                    break;
                }
            }
        }
    });
}


#[cfg(all(test, unix))]
mod tests {
    use super::test_support::*;
    use super::*;
    use std::time::Duration;

    #[test]
    fn worker_env_passes_model_and_preload() {
        let env = worker_env("Unbabel/XCOMET-XXL", true);
        let get = |k: &str| env.iter().find(|(key, _)| key == k).map(|(_, v)| v.as_str());
        assert_eq!(get("XCOMET_MODEL"), Some("Unbabel/XCOMET-XXL"));
        assert_eq!(get("XCOMET_PRELOAD"), Some("true"));
        assert_eq!(get("PORT"), Some("0"));
        assert_eq!(get("PYTHONWARNINGS"), Some("ignore"));
        assert_eq!(get("TOKENIZERS_PARALLELISM"), Some("false"));
    }

    #[tokio::test]
    async fn python_spawner_missing_interpreter_fails_fast() {
        let config = WorkerSpawnConfig {
            python: PathBuf::from("/definitely/not/a/python"),
            script: PathBuf::from("server.py"),
            env: Vec::new(),
        };
        let err = PythonSpawner.spawn(&config).unwrap_err();
        assert!(err.to_string().contains("/definitely/not/a/python"));
    }

    #[tokio::test]
    async fn exit_code_is_reported() {
        let spawner = ShellSpawner::new("exit 7");
        let child = spawner.spawn(&spawn_config()).unwrap();
        let (process, _output) = WorkerProcess::adopt(child).unwrap();

        let info = tokio::time::timeout(Duration::from_secs(5), process.exited())
            .await
            .unwrap();
        assert_eq!(info.code, Some(7));
        assert_eq!(process.try_exit(), Some(info));
    }

    #[tokio::test]
    async fn kill_terminates_a_sleeping_worker() {
        let spawner = ShellSpawner::new("exec sleep 30");
        let child = spawner.spawn(&spawn_config()).unwrap();
        let (mut process, _output) = WorkerProcess::adopt(child).unwrap();

        assert!(process.wait_timeout(Duration::from_millis(50)).await.is_none());

        let info = tokio::time::timeout(Duration::from_secs(5), process.kill())
            .await
            .unwrap();
        assert_eq!(info.code, None);
    }

    #[tokio::test]
    async fn dropping_the_handle_kills_the_worker() {
        let spawner = ShellSpawner::new("exec sleep 30");
        let child = spawner.spawn(&spawn_config()).unwrap();
        let (process, _output) = WorkerProcess::adopt(child).unwrap();
        let mut exit = process.exit_watch();

        drop(process);

        tokio::time::timeout(Duration::from_secs(5), exit.wait_for(|e| e.is_some()))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn environment_reaches_the_child() {
        let spawner = ShellSpawner::new("echo \"$XCOMET_MODEL\"");
        let child = spawner.spawn(&spawn_config()).unwrap();
        let output = child.wait_with_output().await.unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "test-model");
    }
}
