//! Gateway error taxonomy and its HTTP mapping.
//!
//! Every error body is `{"error": {"message", "type", "details"?}}`. Rate
//! limit denials additionally carry `Retry-After` and `X-RateLimit-*`
//! headers so clients can back off precisely.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use switchboard_providers::error::{Attempt, ChainError, ProviderError, RouteError};

#[derive(Error, Debug)]
pub enum GatewayError {
    /// Request body failed schema validation.
    #[error("invalid request: {message}")]
    InvalidRequest {
        message: String,
        details: Option<serde_json::Value>,
    },

    /// Unknown or disabled API key.
    #[error("authentication failed: {message}")]
    Authentication { message: String },

    /// Per-key or global budget exhausted.
    #[error("budget exceeded: {message}")]
    BudgetExceeded { message: String },

    /// RPM or TPM ceiling hit.
    #[error("rate limit exceeded: {message}")]
    RateLimited {
        message: String,
        retry_after_ms: u64,
        limit: u32,
        remaining: u32,
    },

    /// Single upstream call failed with no fallback attempted.
    #[error("provider unavailable: {message}")]
    ProviderUnavailable { message: String },

    /// Primary and every fallback failed.
    #[error("all providers failed")]
    AllProvidersFailed {
        summary: String,
        attempts: Vec<Attempt>,
    },

    /// Requested concrete model has no healthy adapter.
    #[error("model not found: {model}")]
    ModelNotFound { model: String },

    /// No providers healthy or a required collaborator is not configured.
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String },

    /// Unexpected internal failure.
    #[error("internal error: {message}")]
    Internal { message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GatewayError {
    /// Wire-level `type` value from the error taxonomy.
    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest { .. } => "invalid_request_error",
            GatewayError::Authentication { .. } => "authentication_error",
            GatewayError::BudgetExceeded { .. } => "budget_exceeded",
            GatewayError::RateLimited { .. } => "rate_limit_error",
            GatewayError::ProviderUnavailable { .. } => "provider_unavailable",
            GatewayError::AllProvidersFailed { .. } => "all_providers_failed",
            GatewayError::ModelNotFound { .. } => "model_not_found",
            GatewayError::ServiceUnavailable { .. } => "service_unavailable",
            GatewayError::Internal { .. } | GatewayError::Serialization(_) => "server_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            GatewayError::Authentication { .. } => StatusCode::UNAUTHORIZED,
            GatewayError::BudgetExceeded { .. } | GatewayError::RateLimited { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            GatewayError::ProviderUnavailable { .. } | GatewayError::AllProvidersFailed { .. } => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::ModelNotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Internal { .. } | GatewayError::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// The error envelope body.
    pub fn envelope(&self) -> serde_json::Value {
        let details = match self {
            GatewayError::InvalidRequest { details, .. } => details.clone(),
            GatewayError::AllProvidersFailed { attempts, .. } => {
                Some(json!({ "attempts": attempts }))
            }
            _ => None,
        };

        let mut error = json!({
            "message": self.to_string(),
            "type": self.error_type(),
        });
        if let Some(details) = details {
            error["details"] = details;
        }
        json!({ "error": error })
    }
}

impl From<RouteError> for GatewayError {
    fn from(err: RouteError) -> Self {
        match err {
            RouteError::NoProviders => GatewayError::ServiceUnavailable {
                message: "no healthy providers available".to_string(),
            },
            RouteError::ModelNotFound { model } => GatewayError::ModelNotFound { model },
        }
    }
}

impl From<ChainError> for GatewayError {
    fn from(err: ChainError) -> Self {
        match err {
            ChainError::AllProvidersFailed { summary, attempts } => {
                GatewayError::AllProvidersFailed { summary, attempts }
            }
            ChainError::UnknownProvider { provider } => GatewayError::Internal {
                message: format!("routing chose unknown provider {provider}"),
            },
        }
    }
}

impl From<ProviderError> for GatewayError {
    fn from(err: ProviderError) -> Self {
        GatewayError::ProviderUnavailable {
            message: err.to_string(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(self.envelope());
        let mut response = (status, body).into_response();

        if let GatewayError::RateLimited {
            retry_after_ms,
            limit,
            remaining,
            ..
        } = &self
        {
            let retry_after_secs = retry_after_ms.div_ceil(1000);
            let reset_epoch_ms = chrono::Utc::now().timestamp_millis() as u64 + retry_after_ms;
            let headers = response.headers_mut();
            headers.insert(
                "Retry-After",
                HeaderValue::from_str(&retry_after_secs.to_string()).unwrap(),
            );
            headers.insert(
                "X-RateLimit-Limit",
                HeaderValue::from_str(&limit.to_string()).unwrap(),
            );
            headers.insert(
                "X-RateLimit-Remaining",
                HeaderValue::from_str(&remaining.to_string()).unwrap(),
            );
            headers.insert(
                "X-RateLimit-Reset",
                HeaderValue::from_str(&reset_epoch_ms.to_string()).unwrap(),
            );
        }

        response
    }
}
