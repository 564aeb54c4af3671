//! Error types for provider calls, routing, and the fallback chain.
//!
//! `ProviderError` covers everything a single upstream call can fail with;
//! adapters never retry internally, so every variant surfaces exactly one
//! observed failure. `RouteError` and `ChainError` are produced by the
//! routing and failover layers respectively and map onto the gateway's HTTP
//! error taxonomy.

use thiserror::Error;

/// Failure of a single upstream provider call.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// The call exceeded its deadline.
    #[error("request timed out")]
    Timeout,

    /// Connection, DNS, or TLS level failure.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// The provider throttled us (HTTP 429).
    #[error("rate limited by provider")]
    RateLimited,

    /// The provider returned a 5xx.
    #[error("provider server error {status}: {message}")]
    Server { status: u16, message: String },

    /// The response body could not be understood.
    #[error("malformed provider response: {message}")]
    BadResponse { message: String },

    /// Missing or rejected credentials (HTTP 401/403).
    #[error("provider rejected credentials")]
    Auth,

    /// Mid-stream failure after the response started.
    #[error("stream error: {message}")]
    Stream { message: String },
}

impl ProviderError {
    /// Short machine-readable kind label, used in metrics and attempt logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Timeout => "timeout",
            ProviderError::Transport { .. } => "transport",
            ProviderError::RateLimited => "rate_limited",
            ProviderError::Server { .. } => "server_5xx",
            ProviderError::BadResponse { .. } => "bad_response",
            ProviderError::Auth => "auth",
            ProviderError::Stream { .. } => "stream_error",
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else if err.is_decode() {
            ProviderError::BadResponse {
                message: err.to_string(),
            }
        } else {
            ProviderError::Transport {
                message: err.to_string(),
            }
        }
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::BadResponse {
            message: err.to_string(),
        }
    }
}

/// Failure to pick a provider for a request.
#[derive(Error, Debug)]
pub enum RouteError {
    /// No registered provider is currently healthy.
    #[error("no healthy providers available")]
    NoProviders,

    /// A concrete model was requested but no healthy adapter serves it.
    #[error("no available provider for model {model}")]
    ModelNotFound { model: String },
}

/// One recorded try against a provider during failover.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Attempt {
    pub provider_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub latency_ms: u64,
}

/// Failure of the whole fallback chain.
#[derive(Error, Debug)]
pub enum ChainError {
    /// Primary and every admitted fallback failed.
    #[error("all providers failed: {summary}")]
    AllProvidersFailed {
        summary: String,
        attempts: Vec<Attempt>,
    },

    /// The primary provider id is not registered.
    #[error("unknown provider: {provider}")]
    UnknownProvider { provider: String },
}
