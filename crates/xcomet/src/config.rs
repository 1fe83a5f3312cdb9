//! Supervisor configuration.
//!
//! Everything the manager needs is carried by [`SupervisorConfig`], built
//! explicitly and passed in. `from_env()` layers the `XCOMET_*` variables on
//! top of the defaults.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::SupervisorError;
use crate::launcher::{PythonSpawner, WorkerSpawner};

pub const DEFAULT_MODEL: &str = "Unbabel/XCOMET-XL";
pub const DEFAULT_PYTHON: &str = "python3";
pub const SERVER_SCRIPT: &str = "server.py";

/// Per-call timeouts for requests proxied to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    /// Single evaluate / detect-errors call.
    pub request: Duration,
    pub batch_base: Duration,
    pub per_item: Duration,
    pub per_item_accelerated: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            request: Duration::from_secs(120),
            batch_base: Duration::from_secs(60),
            per_item: Duration::from_secs(10),
            per_item_accelerated: Duration::from_secs(2),
        }
    }
}

impl TimeoutPolicy {
    /// Timeout for a batch of `items` pairs.
    pub fn batch(&self, items: usize, accelerated: bool) -> Duration {
        let per_item = if accelerated {
            self.per_item_accelerated
        } else {
            self.per_item
        };
        let items = u32::try_from(items).unwrap_or(u32::MAX);
        self.batch_base.saturating_add(per_item.saturating_mul(items))
    }

    fn validate(&self) -> Result<(), String> {
        if self.per_item_accelerated >= self.per_item {
            return Err(format!(
                "accelerated per-item timeout ({:?}) must be below the default per-item timeout ({:?})",
                self.per_item_accelerated, self.per_item
            ));
        }
        Ok(())
    }
}

/// Models that cannot score without a reference translation.
///
/// Matching is a case-insensitive substring test on the model identifier.
/// That is a heuristic: a future model whose name happens to contain one of
/// these fragments will be treated as reference-required too.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferencePolicy {
    patterns: Vec<String>,
}

impl Default for ReferencePolicy {
    fn default() -> Self {
        Self::new(["wmt22-comet-da", "wmt21-comet-da", "wmt20-comet-da"])
    }
}

impl ReferencePolicy {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| p.into().to_lowercase())
                .collect(),
        }
    }

    pub fn none() -> Self {
        Self {
            patterns: Vec::new(),
        }
    }

    pub fn requires_reference(&self, model: &str) -> bool {
        let model = model.to_lowercase();
        self.patterns.iter().any(|p| model.contains(p.as_str()))
    }
}

/// Locates the worker's `server.py`.
#[derive(Debug, Clone, Default)]
pub struct ScriptLocator {
    explicit: Option<PathBuf>,
    search_roots: Vec<PathBuf>,
}

impl ScriptLocator {
    /// Conventional install-relative locations: next to the executable, one
    /// and two levels up (cargo `target/<profile>`), an installed share dir,
    /// and the working directory.
    pub fn conventional() -> Self {
        let mut roots = Vec::new();
        if let Ok(exe) = std::env::current_exe()
            && let Some(dir) = exe.parent()
        {
            roots.push(dir.join("python"));
            roots.push(dir.join("..").join("python"));
            roots.push(dir.join("..").join("..").join("python"));
            roots.push(dir.join("..").join("share").join("xcomet").join("python"));
        }
        if let Ok(cwd) = std::env::current_dir() {
            roots.push(cwd.join("python"));
        }
        Self {
            explicit: None,
            search_roots: roots,
        }
    }

    pub fn explicit(path: impl Into<PathBuf>) -> Self {
        Self {
            explicit: Some(path.into()),
            search_roots: Vec::new(),
        }
    }

    pub fn with_search_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.search_roots.push(dir.into());
        self
    }

    pub fn candidates(&self) -> Vec<PathBuf> {
        match &self.explicit {
            Some(path) => vec![path.clone()],
            None => self
                .search_roots
                .iter()
                .map(|root| root.join(SERVER_SCRIPT))
                .collect(),
        }
    }

    pub fn resolve(&self) -> Result<PathBuf, SupervisorError> {
        let candidates = self.candidates();
        if let Some(found) = candidates.iter().find(|p| p.is_file()) {
            return Ok(normalize(found));
        }
        let tried = candidates
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        Err(SupervisorError::SpawnFailure(format!(
            "worker script not found (tried: {})",
            if tried.is_empty() { "<none>" } else { tried.as_str() }
        )))
    }
}

fn normalize(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// Configuration for one worker manager.
#[derive(Clone)]
pub struct SupervisorConfig {
    pub python: PathBuf,
    pub script: ScriptLocator,
    pub model: String,
    pub preload: bool,
    pub startup_timeout: Duration,
    pub readiness_interval: Duration,
    pub readiness_attempts: u32,
    pub health_interval: Duration,
    pub health_timeout: Duration,
    pub failure_threshold: u32,
    pub max_restarts: u32,
    pub restart_backoff: Duration,
    pub shutdown_request_timeout: Duration,
    pub shutdown_grace: Duration,
    pub timeouts: TimeoutPolicy,
    pub reference_policy: ReferencePolicy,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl std::fmt::Debug for SupervisorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorConfig")
            .field("python", &self.python)
            .field("model", &self.model)
            .field("preload", &self.preload)
            .field("startup_timeout", &self.startup_timeout)
            .field("health_interval", &self.health_interval)
            .field("failure_threshold", &self.failure_threshold)
            .field("max_restarts", &self.max_restarts)
            .finish_non_exhaustive()
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            python: PathBuf::from(DEFAULT_PYTHON),
            script: ScriptLocator::conventional(),
            model: DEFAULT_MODEL.to_string(),
            preload: false,
            startup_timeout: Duration::from_secs(300),
            readiness_interval: Duration::from_millis(100),
            readiness_attempts: 50,
            health_interval: Duration::from_secs(30),
            health_timeout: Duration::from_secs(5),
            failure_threshold: 3,
            max_restarts: 3,
            restart_backoff: Duration::from_secs(1),
            shutdown_request_timeout: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(5),
            timeouts: TimeoutPolicy::default(),
            reference_policy: ReferencePolicy::default(),
            spawner: Arc::new(PythonSpawner),
        }
    }
}

impl SupervisorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `XCOMET_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(python) = lookup("XCOMET_PYTHON_PATH").filter(|s| !s.is_empty()) {
            config.python = PathBuf::from(python);
        }
        if let Some(script) = lookup("XCOMET_SERVER_SCRIPT").filter(|s| !s.is_empty()) {
            config.script = ScriptLocator::explicit(script);
        }
        if let Some(model) = lookup("XCOMET_MODEL").filter(|s| !s.is_empty()) {
            config.model = model;
        }
        if let Some(preload) = lookup("XCOMET_PRELOAD") {
            config.preload = parse_flag(&preload);
        }
        if let Some(secs) = lookup("XCOMET_STARTUP_TIMEOUT_SECS").and_then(|s| s.parse::<f64>().ok())
            && secs > 0.0
        {
            config.startup_timeout = Duration::from_secs_f64(secs);
        }
        if let Some(secs) = lookup("XCOMET_HEALTH_INTERVAL_SECS").and_then(|s| s.parse::<f64>().ok())
            && secs > 0.0
        {
            config.health_interval = Duration::from_secs_f64(secs);
        }
        if let Some(max) = lookup("XCOMET_MAX_RESTARTS").and_then(|s| s.parse::<u32>().ok()) {
            config.max_restarts = max;
        }

        config
    }

    pub fn with_python(mut self, python: impl Into<PathBuf>) -> Self {
        self.python = python.into();
        self
    }

    pub fn with_script(mut self, script: ScriptLocator) -> Self {
        self.script = script;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_preload(mut self, preload: bool) -> Self {
        self.preload = preload;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_readiness_probe(mut self, interval: Duration, attempts: u32) -> Self {
        self.readiness_interval = interval;
        self.readiness_attempts = attempts;
        self
    }

    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }

    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_max_restarts(mut self, max: u32) -> Self {
        self.max_restarts = max;
        self
    }

    pub fn with_restart_backoff(mut self, backoff: Duration) -> Self {
        self.restart_backoff = backoff;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutPolicy) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_reference_policy(mut self, policy: ReferencePolicy) -> Self {
        self.reference_policy = policy;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    /// Whether the configured model needs a reference translation.
    pub fn model_requires_reference(&self) -> bool {
        self.reference_policy.requires_reference(&self.model)
    }

    /// Reject settings the manager cannot honour.
    pub fn validate(&self) -> Result<(), SupervisorError> {
        if self.failure_threshold == 0 {
            return Err(SupervisorError::InvalidRequest(
                "failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.readiness_attempts == 0 {
            return Err(SupervisorError::InvalidRequest(
                "readiness_attempts must be at least 1".to_string(),
            ));
        }
        self.timeouts
            .validate()
            .map_err(SupervisorError::InvalidRequest)
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "true" | "1" | "yes")
}
