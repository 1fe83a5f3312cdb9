//! HTTP client for the worker's loopback control surface.
//!
//! Every call carries its own timeout. No retries happen here: a failed call
//! is reported to its caller and the health monitor decides what to do about
//! a worker that keeps failing.

use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::SupervisorError;
use crate::protocol::{
    BatchEvaluateRequest, BatchEvaluateResponse, DetectErrorsRequest, DetectErrorsResponse,
    ErrorDetail, EvaluateRequest, EvaluateResponse, WorkerHealth, WorkerStats,
};
use crate::version::XCOMET_VERSION;

/// Build the shared HTTP client used for all worker traffic.
///
/// Proxies are disabled: the worker only ever listens on loopback.
pub fn build_http_client() -> Result<reqwest::Client, SupervisorError> {
    reqwest::Client::builder()
        .user_agent(format!("xcomet/{}", XCOMET_VERSION))
        .no_proxy()
        .build()
        .map_err(|e| SupervisorError::TransportFailure {
            operation: "client",
            message: format!("failed to create HTTP client: {}", e),
        })
}

#[derive(Debug, Clone)]
pub struct WorkerClient {
    http: reqwest::Client,
    base_url: String,
}

impl WorkerClient {
    /// Client for a worker listening on `127.0.0.1:<port>`.
    pub fn new(http: reqwest::Client, port: u16) -> Self {
        Self::with_base_url(http, format!("http://127.0.0.1:{}", port))
    }

    pub fn with_base_url(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn health(&self, timeout: Duration) -> Result<WorkerHealth, SupervisorError> {
        self.get("health", "/health", timeout).await
    }

    pub async fn stats(&self, timeout: Duration) -> Result<WorkerStats, SupervisorError> {
        self.get("stats", "/stats", timeout).await
    }

    pub async fn evaluate(
        &self,
        request: &EvaluateRequest,
        timeout: Duration,
    ) -> Result<EvaluateResponse, SupervisorError> {
        self.post("evaluate", "/evaluate", request, timeout).await
    }

    pub async fn detect_errors(
        &self,
        request: &DetectErrorsRequest,
        timeout: Duration,
    ) -> Result<DetectErrorsResponse, SupervisorError> {
        self.post("detect_errors", "/detect_errors", request, timeout)
            .await
    }

    pub async fn batch_evaluate(
        &self,
        request: &BatchEvaluateRequest,
        timeout: Duration,
    ) -> Result<BatchEvaluateResponse, SupervisorError> {
        self.post("batch_evaluate", "/batch_evaluate", request, timeout)
            .await
    }

    /// Ask the worker to terminate itself. The worker may exit before it
    /// answers, so callers treat any error as non-fatal.
    pub async fn notify_shutdown(&self, timeout: Duration) -> Result<(), SupervisorError> {
        let response = self
            .http
            .post(format!("{}/shutdown", self.base_url))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| send_error("shutdown", timeout, e))?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        Ok(())
    }

    async fn get<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        path: &str,
        timeout: Duration,
    ) -> Result<T, SupervisorError> {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| send_error(operation, timeout, e))?;
        decode(operation, timeout, response).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        operation: &'static str,
        path: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<T, SupervisorError> {
        tracing::trace!(operation, timeout_ms = timeout.as_millis() as u64, "Sending worker request");
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| send_error(operation, timeout, e))?;
        decode(operation, timeout, response).await
    }
}

async fn decode<T: DeserializeOwned>(
    operation: &'static str,
    timeout: Duration,
    response: reqwest::Response,
) -> Result<T, SupervisorError> {
    if !response.status().is_success() {
        return Err(status_error(response).await);
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|e| send_error(operation, timeout, e))?;
    serde_json::from_slice(&bytes).map_err(|e| SupervisorError::TransportFailure {
        operation,
        message: format!("invalid response body: {}", e),
    })
}

/// Worker-supplied `detail` when present, the bare status otherwise.
async fn status_error(response: reqwest::Response) -> SupervisorError {
    let status = response.status();
    let detail = match response.bytes().await {
        Ok(body) => serde_json::from_slice::<ErrorDetail>(&body)
            .ok()
            .and_then(|d| d.message()),
        Err(_) => None,
    };
    SupervisorError::WorkerError {
        status: status.as_u16(),
        detail: detail.unwrap_or_else(|| status.to_string()),
    }
}

fn send_error(operation: &'static str, timeout: Duration, error: reqwest::Error) -> SupervisorError {
    if error.is_timeout() {
        return SupervisorError::RequestTimeout { operation, timeout };
    }
    SupervisorError::TransportFailure {
        operation,
        message: error_chain(&error),
    }
}

fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Severity, TranslationPair};
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> WorkerClient {
        WorkerClient::with_base_url(build_http_client().unwrap(), server.uri())
    }

    fn evaluate_request() -> EvaluateRequest {
        EvaluateRequest {
            source: "Der Hund bellt.".to_string(),
            translation: "The dog barks.".to_string(),
            reference: None,
            use_gpu: false,
        }
    }

    #[tokio::test]
    async fn evaluate_posts_payload_and_decodes_result() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/evaluate"))
            .and(body_json(serde_json::json!({
                "source": "Der Hund bellt.",
                "translation": "The dog barks.",
                "use_gpu": false
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "score": 0.93,
                "errors": [],
                "summary": "Excellent quality (score: 0.930) with 0 error(s) detected."
            })))
            .expect(1)
            .mount(&server)
            .await;

        let result = client_for(&server)
            .evaluate(&evaluate_request(), Duration::from_secs(5))
            .await
            .unwrap();

        assert!((result.score - 0.93).abs() < f64::EPSILON);
        assert!(result.errors.is_empty());
    }

    #[tokio::test]
    async fn worker_detail_is_surfaced() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/evaluate"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "detail": "Model \"Unbabel/wmt22-comet-da\" requires a reference translation."
            })))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .evaluate(&evaluate_request(), Duration::from_secs(5))
            .await
            .unwrap_err();

        match err {
            SupervisorError::WorkerError { status, detail } => {
                assert_eq!(status, 400);
                assert!(detail.contains("requires a reference translation"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn raw_status_when_no_detail() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/detect_errors"))
            .respond_with(ResponseTemplate::new(502).set_body_string("upstream went away"))
            .mount(&server)
            .await;

        let request = DetectErrorsRequest {
            source: "a".to_string(),
            translation: "b".to_string(),
            reference: None,
            min_severity: Severity::Critical,
            use_gpu: false,
        };
        let err = client_for(&server)
            .detect_errors(&request, Duration::from_secs(5))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            SupervisorError::WorkerError {
                status: 502,
                detail: "502 Bad Gateway".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn slow_worker_times_out() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/batch_evaluate"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"average_score": 0.0, "total_pairs": 0}))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let request = BatchEvaluateRequest {
            pairs: vec![TranslationPair {
                source: "a".to_string(),
                translation: "b".to_string(),
                reference: None,
            }],
            batch_size: 8,
            use_gpu: true,
        };
        let err = client_for(&server)
            .batch_evaluate(&request, Duration::from_millis(100))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            SupervisorError::RequestTimeout {
                operation: "batch_evaluate",
                timeout: Duration::from_millis(100),
            }
        );
    }

    #[tokio::test]
    async fn connection_refused_is_transport_failure() {
        // Bind and drop to find a port nobody listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = WorkerClient::new(build_http_client().unwrap(), port);

        let err = client.health(Duration::from_secs(2)).await.unwrap_err();
        assert!(
            matches!(err, SupervisorError::TransportFailure { operation: "health", .. }),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn garbage_body_is_transport_failure() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/stats"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .stats(Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::TransportFailure { operation: "stats", .. }
        ));
    }

    #[tokio::test]
    async fn health_decodes_worker_record() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "ok",
                "model_loaded": false,
                "model_name": "Unbabel/XCOMET-XL"
            })))
            .mount(&server)
            .await;

        let health = client_for(&server)
            .health(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(health.status, "ok");
        assert!(!health.model_loaded);
        assert_eq!(health.model_name.as_deref(), Some("Unbabel/XCOMET-XL"));
    }

    #[tokio::test]
    async fn notify_shutdown_posts_once() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/shutdown"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"status": "shutting_down"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        client_for(&server)
            .notify_shutdown(Duration::from_secs(1))
            .await
            .unwrap();
    }
}
