// Error types for the OCR autopilot core.

use thiserror::Error;

/// Crate-wide result type.
pub type AutopilotResult<T> = Result<T, AutopilotError>;

/// Errors surfaced by the autopilot core.
///
/// Variants map onto the error kinds in the error-handling design:
/// configuration errors fail fast, transient/persistent backend errors
/// drive retry and failover, and subprocess errors are non-fatal unless
/// no fallback remains.
#[derive(Debug, Error, Clone)]
pub enum AutopilotError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("empty candidate list")]
    EmptyCandidates,

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("http {status}: {body}")]
    Http { status: u16, body: String },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("circuit breaker open for backend {0}")]
    CircuitOpen(String),

    #[error("local service unavailable: {0}")]
    LocalServiceUnavailable(String),

    #[error("failed to spawn local service: {0}")]
    SpawnFailed(String),

    #[error("retries exhausted after {attempts} attempts: {cause}")]
    RetriesExhausted { attempts: u32, cause: String },

    #[error("all backends failed; last error: {0}")]
    AllBackendsFailed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AutopilotError {
    /// Transient errors (timeouts, 5xx, connection resets): retried within
    /// a batch before triggering failover.
    pub fn is_retryable(&self) -> bool {
        match self {
            AutopilotError::Network(_) | AutopilotError::Timeout(_) => true,
            AutopilotError::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Persistent errors (repeated 4xx other than 429, malformed bodies):
    /// skip further in-batch retry and go straight to failover.
    pub fn is_persistent(&self) -> bool {
        match self {
            AutopilotError::Http { status, .. } => *status != 429 && *status < 500,
            AutopilotError::MalformedResponse(_) => true,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for AutopilotError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AutopilotError::Timeout(err.to_string())
        } else {
            AutopilotError::Network(err.to_string())
        }
    }
}

impl From<url::ParseError> for AutopilotError {
    fn from(err: url::ParseError) -> Self {
        AutopilotError::Config(format!("invalid url: {err}"))
    }
}
