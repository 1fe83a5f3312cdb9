//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::Serialize;

use crate::error::SupervisorError;
use crate::health::ManagerSnapshot;
use crate::protocol::{
    BatchEvaluateRequest, BatchEvaluateResponse, DetectErrorsRequest, DetectErrorsResponse,
    EvaluateRequest, EvaluateResponse, WorkerStats,
};
use crate::service::EvaluationService;
use crate::version::VersionInfo;

#[derive(Debug, Serialize)]
pub struct HealthCheckResponse {
    #[serde(flatten)]
    pub snapshot: ManagerSnapshot,
    pub version: VersionInfo,
}

/// A [`SupervisorError`] rendered as `{ "error", "kind" }` with a status
/// that tells apart bad input, a slow worker and a worker that is not up.
#[derive(Debug)]
pub struct ApiError(pub SupervisorError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            SupervisorError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            SupervisorError::WorkerError { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            SupervisorError::RequestTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            SupervisorError::SpawnFailure(_)
            | SupervisorError::StartupTimeout { .. }
            | SupervisorError::PrematureExit { .. }
            | SupervisorError::ReadinessTimeout { .. }
            | SupervisorError::TransportFailure { .. }
            | SupervisorError::RestartExhausted { .. }
            | SupervisorError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl From<SupervisorError> for ApiError {
    fn from(e: SupervisorError) -> Self {
        Self(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(SupervisorError::InvalidRequest(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(kind = self.0.kind(), error = %self.0, "Request failed");
        }
        let body = serde_json::json!({
            "error": self.0.to_string(),
            "kind": self.0.kind(),
        });
        (status, Json(body)).into_response()
    }
}

async fn health_check(State(service): State<Arc<EvaluationService>>) -> Json<HealthCheckResponse> {
    Json(HealthCheckResponse {
        snapshot: service.snapshot().await,
        version: service.version().clone(),
    })
}

async fn stats(
    State(service): State<Arc<EvaluationService>>,
) -> Result<Json<WorkerStats>, ApiError> {
    Ok(Json(service.stats().await?))
}

async fn evaluate(
    State(service): State<Arc<EvaluationService>>,
    body: Result<Json<EvaluateRequest>, JsonRejection>,
) -> Result<Json<EvaluateResponse>, ApiError> {
    let Json(request) = body?;
    Ok(Json(service.evaluate(request).await?))
}

async fn detect_errors(
    State(service): State<Arc<EvaluationService>>,
    body: Result<Json<DetectErrorsRequest>, JsonRejection>,
) -> Result<Json<DetectErrorsResponse>, ApiError> {
    let Json(request) = body?;
    Ok(Json(service.detect_errors(request).await?))
}

async fn batch_evaluate(
    State(service): State<Arc<EvaluationService>>,
    body: Result<Json<BatchEvaluateRequest>, JsonRejection>,
) -> Result<Json<BatchEvaluateResponse>, ApiError> {
    let Json(request) = body?;
    Ok(Json(service.batch_evaluate(request).await?))
}

async fn shutdown(State(service): State<Arc<EvaluationService>>) -> impl IntoResponse {
    tracing::info!("Shutdown requested via HTTP");
    service.trigger_shutdown();
    (StatusCode::OK, Json(serde_json::json!({})))
}

pub fn routes(service: Arc<EvaluationService>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/stats", get(stats))
        .route("/evaluate", post(evaluate))
        .route("/detect_errors", post(detect_errors))
        .route("/batch_evaluate", post(batch_evaluate))
        .route("/shutdown", post(shutdown))
        .with_state(service)
}
