//! Error types and HTTP response conversion

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

// ============================================================================
// Structured Provisioning Errors
// ============================================================================

/// Startup step being performed when provisioning failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProvisionStep {
    /// Enabling the audit subsystem
    Enable,
    /// Registering the receiving process id
    SetPid,
    /// Setting the kernel rate limit
    SetRateLimit,
    /// Setting the kernel backlog limit
    SetBacklogLimit,
    /// Reading the rule-set file
    ReadRules,
    /// Parsing the rule-set file
    ParseRules,
    /// Removing currently installed rules
    DeleteRules,
    /// Installing the new rule set
    SetRules,
}

impl fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enable => write!(f, "set_enabled"),
            Self::SetPid => write!(f, "set_pid"),
            Self::SetRateLimit => write!(f, "set_rate_limit"),
            Self::SetBacklogLimit => write!(f, "set_backlog_limit"),
            Self::ReadRules => write!(f, "read_rules"),
            Self::ParseRules => write!(f, "parse_rules"),
            Self::DeleteRules => write!(f, "delete_all_rules"),
            Self::SetRules => write!(f, "set_rules"),
        }
    }
}

/// Structured provisioning error with the failing step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionError {
    /// The step that failed
    pub step: ProvisionStep,
    /// Human-readable error message
    pub message: String,
}

impl ProvisionError {
    /// Create a new provisioning error
    pub fn new(step: ProvisionStep, message: impl Into<String>) -> Self {
        Self {
            step,
            message: message.into(),
        }
    }
}

impl fmt::Display for ProvisionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.step, self.message)
    }
}

impl std::error::Error for ProvisionError {}

/// Result type alias using the exporter error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the exporter
///
/// Large error variants are boxed to reduce stack size
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Provisioning of the audit subsystem failed
    #[error("{0}")]
    Provision(ProvisionError),

    /// Rule-set file could not be read
    #[error("Failed to read rule file {}: {source}", .path.display())]
    RuleFile {
        /// Path that was read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Rule-set file is not valid rule JSON
    #[error("Unmarshaling rules JSON: {0}")]
    RuleParse(#[from] serde_json::Error),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(Box<prometheus::Error>),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP exporter failed to bind or serve
    #[error("HTTP exporter error: {0}")]
    Serve(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The provisioning step this error belongs to, if any
    pub fn provision_step(&self) -> Option<ProvisionStep> {
        match self {
            Error::Provision(e) => Some(e.step),
            Error::RuleFile { .. } => Some(ProvisionStep::ReadRules),
            Error::RuleParse(_) => Some(ProvisionStep::ParseRules),
            _ => None,
        }
    }
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,

    /// Optional error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// HTTP status code
    pub status: u16,
}

impl ErrorResponse {
    /// Create error response with a code
    pub fn with_code(
        status: StatusCode,
        code: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            error: error.into(),
            code: Some(code.into()),
            status: status.as_u16(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let code = match self {
            Error::Metrics(_) => "METRICS_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            _ => "INTERNAL_ERROR",
        };

        tracing::error!(code, "Request failed: {}", self);

        let status = StatusCode::INTERNAL_SERVER_ERROR;
        (status, Json(ErrorResponse::with_code(status, code, self.to_string()))).into_response()
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

impl From<prometheus::Error> for Error {
    fn from(err: prometheus::Error) -> Self {
        Error::Metrics(Box::new(err))
    }
}

impl From<ProvisionError> for Error {
    fn from(err: ProvisionError) -> Self {
        Error::Provision(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provision_error_display_names_step() {
        let err = Error::from(ProvisionError::new(ProvisionStep::SetRateLimit, "EPERM"));
        assert_eq!(err.to_string(), "set_rate_limit: EPERM");
        assert_eq!(err.provision_step(), Some(ProvisionStep::SetRateLimit));
    }

    #[test]
    fn test_rule_parse_maps_to_parse_step() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = Error::from(json_err);
        assert_eq!(err.provision_step(), Some(ProvisionStep::ParseRules));
        assert!(err.to_string().starts_with("Unmarshaling rules JSON"));
    }

    #[test]
    fn test_into_response_is_server_error() {
        let response = Error::Internal("boom".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
