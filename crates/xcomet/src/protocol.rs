//! Wire types for the xCOMET worker's HTTP control surface.
//!
//! Field names follow the worker's JSON exactly; requests are serialized
//! as-is into `POST /evaluate`, `/detect_errors` and `/batch_evaluate`.

use serde::{Deserialize, Serialize};

/// Startup record printed on the worker's stdout once it has a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub port: u16,
}

/// Error span severity, ordered `minor < major < critical`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Minor,
    Major,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minor => "minor",
            Self::Major => "major",
            Self::Critical => "critical",
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "minor" => Ok(Self::Minor),
            "major" => Ok(Self::Major),
            "critical" => Ok(Self::Critical),
            other => Err(format!(
                "unknown severity '{other}', expected minor, major or critical"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluateRequest {
    pub source: String,
    pub translation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default)]
    pub use_gpu: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectErrorsRequest {
    pub source: String,
    pub translation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default)]
    pub min_severity: Severity,
    #[serde(default)]
    pub use_gpu: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationPair {
    pub source: String,
    pub translation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEvaluateRequest {
    pub pairs: Vec<TranslationPair>,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default)]
    pub use_gpu: bool,
}

fn default_batch_size() -> u32 {
    8
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorSpan {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub start: usize,
    #[serde(default)]
    pub end: usize,
    #[serde(default, deserialize_with = "lenient_severity")]
    pub severity: Severity,
}

/// Spans coming back from the worker fall back to `minor` for severities
/// outside the known set, rather than failing the whole response.
fn lenient_severity<'de, D>(deserializer: D) -> Result<Severity, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(value
        .as_str()
        .and_then(|s| s.parse().ok())
        .unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluateResponse {
    pub score: f64,
    #[serde(default)]
    pub errors: Vec<ErrorSpan>,
    #[serde(default)]
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedError {
    #[serde(default)]
    pub suggestion: Option<String>,
    #[serde(flatten)]
    pub span: ErrorSpan,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    #[serde(default)]
    pub minor: u32,
    #[serde(default)]
    pub major: u32,
    #[serde(default)]
    pub critical: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectErrorsResponse {
    pub total_errors: u32,
    #[serde(default)]
    pub errors_by_severity: SeverityCounts,
    #[serde(default)]
    pub errors: Vec<DetectedError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItemResult {
    pub index: usize,
    pub score: f64,
    #[serde(default)]
    pub errors: Vec<ErrorSpan>,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default)]
    pub has_critical_errors: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEvaluateResponse {
    pub average_score: f64,
    pub total_pairs: usize,
    #[serde(default)]
    pub results: Vec<BatchItemResult>,
    #[serde(default)]
    pub summary: String,
}

impl BatchEvaluateResponse {
    /// What the worker answers for an empty batch.
    pub fn empty() -> Self {
        Self {
            average_score: 0.0,
            total_pairs: 0,
            results: Vec::new(),
            summary: "No pairs to evaluate.".to_string(),
        }
    }
}

/// `GET /health` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub status: String,
    #[serde(default)]
    pub model_loaded: bool,
    #[serde(default)]
    pub model_name: Option<String>,
}

/// `GET /stats` body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    #[serde(default)]
    pub uptime_seconds: Option<u64>,
    #[serde(default)]
    pub model_loaded: bool,
    #[serde(default)]
    pub model_load_time_ms: Option<u64>,
    #[serde(default, alias = "evaluation_count")]
    pub evaluate_api_count: u64,
    #[serde(default)]
    pub detect_errors_api_count: u64,
    #[serde(default, alias = "batch_count")]
    pub batch_api_count: u64,
    #[serde(default)]
    pub total_pairs_evaluated: u64,
    #[serde(default)]
    pub total_inference_time_ms: u64,
    #[serde(default)]
    pub avg_inference_time_ms: Option<u64>,
}

/// Error body returned by the worker on non-2xx responses.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorDetail {
    pub detail: serde_json::Value,
}

impl ErrorDetail {
    /// Flatten `detail` to text; validation errors arrive as arrays of objects.
    pub fn message(&self) -> Option<String> {
        match &self.detail {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) if s.is_empty() => None,
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Array(items) => {
                let parts: Vec<String> = items
                    .iter()
                    .map(|item| {
                        item.get("msg")
                            .and_then(|m| m.as_str())
                            .map(str::to_string)
                            .unwrap_or_else(|| item.to_string())
                    })
                    .collect();
                if parts.is_empty() {
                    None
                } else {
                    Some(parts.join("; "))
                }
            }
            other => Some(other.to_string()),
        }
    }
}
