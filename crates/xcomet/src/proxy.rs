//! RequestProxy: one typed operation against a ready worker.
//!
//! Each call makes sure a worker is up (joining an in-flight startup), then
//! issues exactly one HTTP request with its computed timeout. Failures go
//! back to the caller as they are; recovery belongs to the health monitor.

use std::sync::Arc;

use crate::error::SupervisorError;
use crate::manager::WorkerManager;
use crate::protocol::{
    BatchEvaluateRequest, BatchEvaluateResponse, DetectErrorsRequest, DetectErrorsResponse,
    EvaluateRequest, EvaluateResponse, WorkerHealth, WorkerStats,
};

#[derive(Clone)]
pub struct RequestProxy {
    manager: Arc<WorkerManager>,
}

impl RequestProxy {
    pub fn new(manager: Arc<WorkerManager>) -> Self {
        Self { manager }
    }

    pub async fn evaluate(
        &self,
        request: &EvaluateRequest,
    ) -> Result<EvaluateResponse, SupervisorError> {
        let timeout = self.manager.config().timeouts.request;
        self.manager.client().await?.evaluate(request, timeout).await
    }

    pub async fn detect_errors(
        &self,
        request: &DetectErrorsRequest,
    ) -> Result<DetectErrorsResponse, SupervisorError> {
        let timeout = self.manager.config().timeouts.request;
        self.manager
            .client()
            .await?
            .detect_errors(request, timeout)
            .await
    }

    /// The timeout grows with the batch and shrinks when `use_gpu` is set.
    pub async fn batch_evaluate(
        &self,
        request: &BatchEvaluateRequest,
    ) -> Result<BatchEvaluateResponse, SupervisorError> {
        let timeout = self
            .manager
            .config()
            .timeouts
            .batch(request.pairs.len(), request.use_gpu);
        tracing::debug!(
            pairs = request.pairs.len(),
            use_gpu = request.use_gpu,
            timeout_ms = timeout.as_millis() as u64,
            "Proxying batch evaluation"
        );
        self.manager
            .client()
            .await?
            .batch_evaluate(request, timeout)
            .await
    }

    pub async fn stats(&self) -> Result<WorkerStats, SupervisorError> {
        let timeout = self.manager.config().timeouts.request;
        self.manager.client().await?.stats(timeout).await
    }

    pub async fn health(&self) -> Result<WorkerHealth, SupervisorError> {
        let timeout = self.manager.config().health_timeout;
        self.manager.client().await?.health(timeout).await
    }
}
