//! Version information for the supervisor.

/// Supervisor version from Cargo.toml
pub const XCOMET_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information reported by the HTTP front.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    /// Supervisor version.
    pub xcomet: &'static str,
    /// Scoring model the worker is configured with.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            xcomet: XCOMET_VERSION,
            model: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}
