//! Failover execution across an ordered provider chain.
//!
//! The chain tries the routed primary first, then walks the configured
//! fallback list, skipping providers whose breaker is not admitting or whose
//! last probe was unhealthy. Every try is recorded as an [`Attempt`] so the
//! error surface and the request log can show exactly what happened.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::circuit_breaker::CircuitBreakerManager;
use crate::error::{Attempt, ChainError, ProviderError};
use crate::models::{ChatRequest, ChatResult};
use crate::registry::ProviderRegistry;

/// Upper bound on total tries: primary plus `max_retries` fallbacks.
pub const DEFAULT_MAX_RETRIES: usize = 3;

/// Completion deadline for one provider call. Local inference is given far
/// more room than the hosted APIs; Groq is the strictest because it is the
/// fastest.
pub fn completion_timeout(provider_id: &str) -> Duration {
    match provider_id {
        "ollama" => Duration::from_secs(120),
        "groq" => Duration::from_secs(30),
        "openai" | "anthropic" | "together" => Duration::from_secs(60),
        _ => Duration::from_secs(60),
    }
}

/// Successful outcome of a chain execution.
#[derive(Debug)]
pub struct ChainOutcome {
    pub result: ChatResult,
    pub provider_id: String,
    pub attempts: Vec<Attempt>,
    pub fallback_used: bool,
}

pub struct FallbackChain {
    registry: Arc<ProviderRegistry>,
    breakers: Arc<CircuitBreakerManager>,
    max_retries: usize,
}

impl FallbackChain {
    pub fn new(registry: Arc<ProviderRegistry>, breakers: Arc<CircuitBreakerManager>) -> Self {
        Self {
            registry,
            breakers,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Executes `request` against `primary`, then the fallback list.
    ///
    /// `primary_model` pins the routed model for the primary attempt;
    /// fallback providers see the original request so virtual model names
    /// re-resolve against their own tables.
    pub async fn execute(
        &self,
        request: &ChatRequest,
        primary: &str,
        primary_model: Option<&str>,
        fallback_ids: &[String],
    ) -> Result<ChainOutcome, ChainError> {
        let mut attempts = Vec::new();

        let primary_request = match primary_model {
            Some(model) if model != request.model => {
                let mut pinned = request.clone();
                pinned.model = model.to_string();
                std::borrow::Cow::Owned(pinned)
            }
            _ => std::borrow::Cow::Borrowed(request),
        };

        if self.admit(primary, &mut attempts) {
            if let Some(result) = self
                .try_provider(&primary_request, primary, &mut attempts)
                .await
            {
                return Ok(ChainOutcome {
                    result,
                    provider_id: primary.to_string(),
                    attempts,
                    fallback_used: false,
                });
            }
        }

        for provider_id in fallback_ids.iter().filter(|id| id.as_str() != primary) {
            if attempts.len() >= self.max_retries + 1 {
                break;
            }

            // Duplicate ids in the configured tail would double-bill a
            // provider's breaker; skip repeats.
            if attempts.iter().any(|a| &a.provider_id == provider_id) {
                continue;
            }

            // Breaker admission comes first and always leaves a recorded
            // attempt when it blocks, even for providers that would also be
            // skipped as unknown or unhealthy.
            if !self.admit(provider_id, &mut attempts) {
                continue;
            }
            if self.registry.get(provider_id).is_none() {
                tracing::debug!(provider = %provider_id, "fallback provider not registered");
                continue;
            }
            if !self.registry.is_healthy(provider_id) {
                tracing::debug!(provider = %provider_id, "fallback provider unhealthy, skipping");
                continue;
            }

            if let Some(result) = self.try_provider(request, provider_id, &mut attempts).await {
                tracing::info!(
                    primary = %primary,
                    fallback = %provider_id,
                    "request served by fallback provider"
                );
                return Ok(ChainOutcome {
                    result,
                    provider_id: provider_id.clone(),
                    attempts,
                    fallback_used: true,
                });
            }
        }

        let summary = attempts
            .iter()
            .map(|a| {
                format!(
                    "{}: {}",
                    a.provider_id,
                    a.error_message.as_deref().unwrap_or("unknown error")
                )
            })
            .collect::<Vec<_>>()
            .join("; ");

        Err(ChainError::AllProvidersFailed { summary, attempts })
    }

    /// Breaker admission for one provider. A blocked provider gets a
    /// synthetic attempt record; it never reached an adapter, so its
    /// latency is zero.
    fn admit(&self, provider_id: &str, attempts: &mut Vec<Attempt>) -> bool {
        if self.breakers.breaker(provider_id).allow_request() {
            return true;
        }
        attempts.push(Attempt {
            provider_id: provider_id.to_string(),
            success: false,
            error_message: Some("Circuit breaker open".to_string()),
            latency_ms: 0,
        });
        false
    }

    /// One admitted try against one provider: bounded call plus outcome
    /// recording on the breaker. Returns the result on success, `None` on
    /// failure (the failure is captured in `attempts`).
    async fn try_provider(
        &self,
        request: &ChatRequest,
        provider_id: &str,
        attempts: &mut Vec<Attempt>,
    ) -> Option<ChatResult> {
        let breaker = self.breakers.breaker(provider_id);

        let Some(adapter) = self.registry.get(provider_id) else {
            attempts.push(Attempt {
                provider_id: provider_id.to_string(),
                success: false,
                error_message: Some("provider not registered".to_string()),
                latency_ms: 0,
            });
            return None;
        };

        let start = Instant::now();
        let outcome = tokio::time::timeout(
            completion_timeout(provider_id),
            adapter.chat(request),
        )
        .await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(result)) => {
                breaker.record_success();
                attempts.push(Attempt {
                    provider_id: provider_id.to_string(),
                    success: true,
                    error_message: None,
                    latency_ms,
                });
                Some(result)
            }
            Ok(Err(e)) => {
                breaker.record_failure();
                tracing::warn!(provider = %provider_id, error = %e, "provider call failed");
                attempts.push(Attempt {
                    provider_id: provider_id.to_string(),
                    success: false,
                    error_message: Some(e.to_string()),
                    latency_ms,
                });
                None
            }
            Err(_) => {
                breaker.record_failure();
                let e = ProviderError::Timeout;
                tracing::warn!(provider = %provider_id, "provider call timed out");
                attempts.push(Attempt {
                    provider_id: provider_id.to_string(),
                    success: false,
                    error_message: Some(e.to_string()),
                    latency_ms,
                });
                None
            }
        }
    }
}
