//! EvaluationService: transport-agnostic facade over the worker.
//!
//! Transports call this service. It rejects malformed input locally so a
//! bad request never costs a worker startup, then delegates to the request
//! proxy. It also carries the shutdown signal the HTTP server waits on.

use std::sync::Arc;

use tokio::sync::watch;

use crate::error::SupervisorError;
use crate::health::ManagerSnapshot;
use crate::manager::WorkerManager;
use crate::protocol::{
    BatchEvaluateRequest, BatchEvaluateResponse, DetectErrorsRequest, DetectErrorsResponse,
    EvaluateRequest, EvaluateResponse, WorkerHealth, WorkerStats,
};
use crate::proxy::RequestProxy;
use crate::version::VersionInfo;

pub struct EvaluationService {
    manager: Arc<WorkerManager>,
    proxy: RequestProxy,
    version: VersionInfo,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl EvaluationService {
    pub fn new(manager: Arc<WorkerManager>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let version = VersionInfo::new().with_model(manager.config().model.clone());
        Self {
            proxy: RequestProxy::new(Arc::clone(&manager)),
            manager,
            version,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn manager(&self) -> &Arc<WorkerManager> {
        &self.manager
    }

    pub fn version(&self) -> &VersionInfo {
        &self.version
    }

    pub async fn evaluate(
        &self,
        request: EvaluateRequest,
    ) -> Result<EvaluateResponse, SupervisorError> {
        self.validate_pair(
            None,
            &request.source,
            &request.translation,
            request.reference.as_deref(),
        )?;
        self.proxy.evaluate(&request).await
    }

    pub async fn detect_errors(
        &self,
        request: DetectErrorsRequest,
    ) -> Result<DetectErrorsResponse, SupervisorError> {
        self.validate_pair(
            None,
            &request.source,
            &request.translation,
            request.reference.as_deref(),
        )?;
        self.proxy.detect_errors(&request).await
    }

    /// An empty batch is answered here without starting the worker.
    pub async fn batch_evaluate(
        &self,
        request: BatchEvaluateRequest,
    ) -> Result<BatchEvaluateResponse, SupervisorError> {
        if request.batch_size == 0 {
            return Err(SupervisorError::InvalidRequest(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if request.pairs.is_empty() {
            return Ok(BatchEvaluateResponse::empty());
        }
        for (index, pair) in request.pairs.iter().enumerate() {
            self.validate_pair(
                Some(index),
                &pair.source,
                &pair.translation,
                pair.reference.as_deref(),
            )?;
        }
        self.proxy.batch_evaluate(&request).await
    }

    pub async fn stats(&self) -> Result<WorkerStats, SupervisorError> {
        self.proxy.stats().await
    }

    /// The worker's own `/health` record. Starts the worker if needed.
    pub async fn worker_health(&self) -> Result<WorkerHealth, SupervisorError> {
        self.proxy.health().await
    }

    /// Supervisor-side view; never starts the worker.
    pub async fn snapshot(&self) -> ManagerSnapshot {
        self.manager.snapshot().await
    }

    /// Ask the transport to stop serving. The worker is stopped by
    /// [`shutdown`](Self::shutdown) once the transport has drained.
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
    }

    fn validate_pair(
        &self,
        index: Option<usize>,
        source: &str,
        translation: &str,
        reference: Option<&str>,
    ) -> Result<(), SupervisorError> {
        let field = |name: &str| match index {
            Some(i) => format!("pairs[{i}].{name}"),
            None => name.to_string(),
        };
        if source.trim().is_empty() {
            return Err(SupervisorError::InvalidRequest(format!(
                "{} must not be empty",
                field("source")
            )));
        }
        if translation.trim().is_empty() {
            return Err(SupervisorError::InvalidRequest(format!(
                "{} must not be empty",
                field("translation")
            )));
        }
        let has_reference = reference.is_some_and(|r| !r.trim().is_empty());
        if !has_reference && self.manager.config().model_requires_reference() {
            return Err(SupervisorError::InvalidRequest(format!(
                "model \"{}\" requires a reference translation ({} is missing)",
                self.manager.config().model,
                field("reference")
            )));
        }
        Ok(())
    }
}
