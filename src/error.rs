//! Error kinds recognised by the router core.
//!
//! Load errors are retried only via the fallback chain; generation errors
//! are never retried in-process. Caller-visible failures carry a structured
//! kind plus a human string. Internal failures are logged with a correlation
//! id equal to the request id.

use std::time::Duration;

use axum::http::StatusCode;

/// All failure modes the core distinguishes.
#[derive(Debug, thiserror::Error)]
pub enum MindgateError {
    /// Startup-fatal configuration problem (bad types, unknown backend kind).
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// A backend failed to load a model. Triggers the fallback chain.
    #[error("backend load failed for '{name}': {reason}")]
    BackendLoadFailed { name: String, reason: String },

    /// Fallback chain exhausted; the request is aborted.
    #[error("no model available for '{0}' after exhausting fallbacks")]
    ModelUnavailable(String),

    /// Generation failed downstream. Transient; the caller may retry.
    #[error("generation failed: {0}")]
    GenerationFailed(String),

    /// Deadline expired. Treated like a generation failure by callers;
    /// the handle release is forced.
    #[error("deadline expired after {0:?}")]
    Timeout(Duration),

    /// Cooperative cancellation. No side effects beyond release.
    #[error("request cancelled")]
    Cancelled,

    /// The health gate tripped. The response carries the OOM ETA.
    #[error("admission rejected: projected out-of-memory in {eta_seconds:.0}s")]
    AdmissionRejected { eta_seconds: f64 },

    /// Soft signal only. Surfaced on `/health`, never raised to callers;
    /// the variant exists so internal plumbing can name the state.
    #[error("degraded")]
    Degraded,

    /// The request itself is malformed (e.g. whitespace-only text).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl MindgateError {
    /// Stable machine-readable kind string for audit records and responses.
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::ConfigInvalid(_) => "config_invalid",
            Self::BackendLoadFailed { .. } => "backend_load_failed",
            Self::ModelUnavailable(_) => "model_unavailable",
            Self::GenerationFailed(_) => "generation_failed",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::AdmissionRejected { .. } => "admission_rejected",
            Self::Degraded => "degraded",
            Self::InvalidRequest(_) => "invalid_request",
        }
    }

    /// Whether the caller may usefully retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::GenerationFailed(_) | Self::Timeout(_) | Self::AdmissionRejected { .. }
        )
    }

    /// HTTP status the surface maps this error to.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ConfigInvalid(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BackendLoadFailed { .. } | Self::ModelUnavailable(_) => StatusCode::BAD_GATEWAY,
            Self::GenerationFailed(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Cancelled => StatusCode::REQUEST_TIMEOUT,
            Self::AdmissionRejected { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Degraded => StatusCode::OK,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

/// Shorthand used throughout the crate.
pub type Result<T> = std::result::Result<T, MindgateError>;
