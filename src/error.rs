// Error handling module
// Defines the probe error taxonomy and status/transport classification

use serde::Serialize;
use thiserror::Error;

/// Errors a probe can terminate with.
///
/// Probe-level errors are always recovered into an outcome bucket; they never
/// escape the orchestrator's batch loop.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ProbeError {
    /// Credential rejected by the endpoint (HTTP 401)
    #[error("authentication failed")]
    AuthFailure,

    /// Endpoint does not know the requested model (HTTP 404)
    #[error("model not found")]
    ModelNotFound,

    /// Upstream server error (HTTP 500)
    #[error("server error")]
    ServerError,

    /// Upstream temporarily unavailable (HTTP 503)
    #[error("service unavailable")]
    ServiceUnavailable,

    /// Probe exceeded its effective timeout (or HTTP 524)
    #[error("request timeout")]
    Timeout,

    /// Could not reach the endpoint at all
    #[error("network error")]
    NetworkError,

    /// Connection dropped mid-response
    #[error("connection interrupted")]
    ConnectionInterrupted,

    /// Response body could not be decoded
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// A probe task failed outside its own recovery path
    #[error("orchestration error: {0}")]
    OrchestrationError(String),

    /// Transport failure with no more specific classification
    #[error("unknown error: {0}")]
    Unknown(String),

    /// Non-2xx status with no dedicated classification
    #[error("HTTP {0}")]
    Http(u16),
}

impl ProbeError {
    /// Classify a non-2xx HTTP status code.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => ProbeError::AuthFailure,
            404 => ProbeError::ModelNotFound,
            500 => ProbeError::ServerError,
            503 => ProbeError::ServiceUnavailable,
            524 => ProbeError::Timeout,
            code => ProbeError::Http(code),
        }
    }

    /// Classify a reqwest transport error by inspecting its identity,
    /// never by echoing the raw error string to the user.
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return ProbeError::Timeout;
        }
        if err.is_connect() {
            return ProbeError::NetworkError;
        }
        if err.is_body() || err.is_decode() {
            return ProbeError::ConnectionInterrupted;
        }
        let text = err.to_string();
        if text.contains("IncompleteRead") || text.contains("Connection broken") {
            return ProbeError::ConnectionInterrupted;
        }
        if text.contains("timed out") || text.contains("timeout") {
            return ProbeError::Timeout;
        }
        ProbeError::Unknown(text)
    }

    /// Human-readable advice attached to progress messages.
    pub fn describe(&self) -> String {
        match self {
            ProbeError::AuthFailure => "authentication failed, check the API key".to_string(),
            ProbeError::ModelNotFound => "the endpoint does not serve this model".to_string(),
            ProbeError::ServerError => "the endpoint returned an internal error".to_string(),
            ProbeError::ServiceUnavailable => {
                "the endpoint is temporarily unavailable".to_string()
            }
            ProbeError::Timeout => {
                "request timed out, raise the timeout or check connectivity".to_string()
            }
            ProbeError::NetworkError => {
                "network connection failed, check connectivity or the endpoint URL".to_string()
            }
            ProbeError::ConnectionInterrupted => {
                "connection interrupted, likely a server or network problem".to_string()
            }
            other => other.to_string(),
        }
    }
}

/// Result type alias for probe operations
pub type Result<T> = std::result::Result<T, ProbeError>;
