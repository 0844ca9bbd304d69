//! Health check handler

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::error::Result;
use crate::server::ExporterState;

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,

    /// Service name
    pub service: String,

    /// Version
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Audit source state: `running`, `finished` or `failed`
    pub source: String,

    /// Why the audit source failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_error: Option<String>,

    /// Number of `RuleStat` series currently exported
    pub series: usize,

    /// Messages aggregated since startup
    pub processed: u64,
}

/// Lifecycle of the audit source task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceStatus {
    /// Still producing
    Running,
    /// Reached the end of its input
    Finished,
    /// Stopped on an error
    Failed(String),
}

impl fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Finished => write!(f, "finished"),
            Self::Failed(_) => write!(f, "failed"),
        }
    }
}

/// Shared record of how the audit source task ended
#[derive(Debug, Clone, Default)]
pub struct SourceHealth {
    outcome: Arc<OnceLock<Option<String>>>,
}

impl SourceHealth {
    /// A source that is still running
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the source's final result; later calls are ignored
    pub fn finish(&self, result: &Result<()>) {
        let _ = self
            .outcome
            .set(result.as_ref().err().map(|e| e.to_string()));
    }

    /// Current source status
    pub fn status(&self) -> SourceStatus {
        match self.outcome.get() {
            None => SourceStatus::Running,
            Some(None) => SourceStatus::Finished,
            Some(Some(error)) => SourceStatus::Failed(error.clone()),
        }
    }
}

/// Liveness check
///
/// Returns 503 Service Unavailable once the audit source has failed, since
/// the exported values are then no longer updated.
pub async fn health(State(state): State<ExporterState>) -> impl IntoResponse {
    let source = state.source_health().status();
    let (code, status, source_error) = match &source {
        SourceStatus::Failed(error) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "unhealthy",
            Some(error.clone()),
        ),
        _ => (StatusCode::OK, "healthy", None),
    };

    let response = HealthResponse {
        status: status.to_string(),
        service: state.service_name().to_string(),
        version: Some(env!("CARGO_PKG_VERSION").to_string()),
        source: source.to_string(),
        source_error,
        series: state.registry().series_count(),
        processed: state.registry().processed(),
    };

    (code, Json(response))
}
