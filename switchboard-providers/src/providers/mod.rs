//! Provider adapter layer.
//!
//! One adapter per upstream vendor, all behind the [`ProviderAdapter`] trait:
//! unary chat, streaming chat, model listing, health probing, and cost
//! estimation. Adapters are stateless apart from their immutable credentials
//! and endpoint, never retry internally, and translate the OpenAI-shape
//! message list into whatever the vendor expects.

use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::models::{ChatRequest, ChatResult, CostEstimate, HealthReport, ModelInfo, StreamDelta};

pub mod anthropic;
pub mod http_client;
pub mod ollama;
pub mod openai;

pub use anthropic::AnthropicAdapter;
pub use ollama::OllamaAdapter;
pub use openai::{OpenAiAdapter, OpenAiCompatible};

/// Streaming chat output: a finite sequence of deltas, terminated by an
/// element carrying a finish reason.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<StreamDelta, ProviderError>> + Send>>;

/// Deadline applied to every health probe.
pub const HEALTH_CHECK_DEADLINE: Duration = Duration::from_secs(5);

/// Uniform interface over one upstream model vendor.
#[async_trait::async_trait]
pub trait ProviderAdapter: Send + Sync + std::fmt::Debug {
    /// Registry id, e.g. `"openai"`.
    fn id(&self) -> &str;

    /// Human-readable vendor name.
    fn name(&self) -> &str;

    /// Static catalogue of models this adapter can serve, used to seed the
    /// registry before the first live probe.
    fn supported_models(&self) -> Vec<String>;

    /// Resolves the virtual model symbols (`auto`, `fast`, `cheap`,
    /// `quality`) to a concrete model id; concrete ids pass through.
    fn resolve_model(&self, model: &str) -> String;

    /// One unary completion call. Never retries.
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResult, ProviderError>;

    /// Streaming completion call. Mid-stream transport failures surface as
    /// [`ProviderError::Stream`] items.
    async fn chat_stream(&self, request: &ChatRequest) -> Result<ChatStream, ProviderError>;

    /// Live model listing from the vendor.
    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError>;

    /// Probes the vendor with a bounded deadline. An absent API key is
    /// reported unhealthy without any network I/O.
    async fn health_check(&self) -> HealthReport;

    /// Pre-flight cost estimate: chars/4 for inputs, `max_tokens` (or the
    /// vendor default) for outputs.
    fn estimate_cost(&self, request: &ChatRequest) -> CostEstimate;
}

/// Configuration for a single adapter instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Provider id this config is for.
    pub provider: String,
    /// API key; empty means the adapter reports itself unhealthy.
    #[serde(default)]
    pub api_key: String,
    /// Override of the vendor default endpoint.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Per-call HTTP timeout.
    #[serde(default = "default_timeout", with = "crate::common::duration_serde")]
    pub timeout: Duration,
    /// Extra headers sent on every request.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Whether this adapter is registered at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_enabled() -> bool {
    true
}

impl AdapterConfig {
    pub fn new(provider: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            api_key: api_key.into(),
            base_url: None,
            timeout: default_timeout(),
            headers: HashMap::new(),
            enabled: true,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Builds the adapter for `config.provider`.
///
/// `openai`, `groq`, and `together` share the OpenAI wire dialect and differ
/// only in endpoint, pricing, and model tables.
pub fn create_adapter(
    config: AdapterConfig,
) -> Result<std::sync::Arc<dyn ProviderAdapter>, ProviderError> {
    use std::sync::Arc;

    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiAdapter::new(
            config,
            OpenAiCompatible::openai(),
        )?)),
        "groq" => Ok(Arc::new(OpenAiAdapter::new(
            config,
            OpenAiCompatible::groq(),
        )?)),
        "together" => Ok(Arc::new(OpenAiAdapter::new(
            config,
            OpenAiCompatible::together(),
        )?)),
        "anthropic" => Ok(Arc::new(AnthropicAdapter::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaAdapter::new(config)?)),
        other => Err(ProviderError::BadResponse {
            message: format!("unsupported provider: {other}"),
        }),
    }
}

/// Shared chars/4 cost estimator used by every adapter.
pub(crate) fn estimate_cost_heuristic(
    request: &ChatRequest,
    default_max_tokens: u32,
    cost_per_1k_input: f64,
    cost_per_1k_output: f64,
) -> CostEstimate {
    let input_chars: usize = request.messages.iter().map(|m| m.content.len()).sum();
    let estimated_input_tokens = input_chars.div_ceil(4) as u32;
    let estimated_output_tokens = request.max_tokens.unwrap_or(default_max_tokens);

    let estimated_cost_usd = (estimated_input_tokens as f64 / 1000.0) * cost_per_1k_input
        + (estimated_output_tokens as f64 / 1000.0) * cost_per_1k_output;

    CostEstimate {
        estimated_input_tokens,
        estimated_output_tokens,
        estimated_cost_usd,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;

    #[test]
    fn cost_heuristic_uses_max_tokens_when_present() {
        let request = ChatRequest {
            model: "auto".to_string(),
            messages: vec![Message::user("abcdefgh")], // 8 chars -> 2 tokens
            max_tokens: Some(100),
            ..Default::default()
        };
        let estimate = estimate_cost_heuristic(&request, 1024, 0.01, 0.03);
        assert_eq!(estimate.estimated_input_tokens, 2);
        assert_eq!(estimate.estimated_output_tokens, 100);
        let expected = (2.0 / 1000.0) * 0.01 + (100.0 / 1000.0) * 0.03;
        assert!((estimate.estimated_cost_usd - expected).abs() < 1e-12);
    }

    #[test]
    fn factory_rejects_unknown_provider() {
        let err = create_adapter(AdapterConfig::new("nope", "k")).unwrap_err();
        assert!(matches!(err, ProviderError::BadResponse { .. }));
    }

    #[test]
    fn factory_builds_all_supported_providers() {
        for provider in ["openai", "groq", "together", "anthropic", "ollama"] {
            let adapter = create_adapter(AdapterConfig::new(provider, "key")).unwrap();
            assert_eq!(adapter.id(), provider);
            assert!(!adapter.supported_models().is_empty());
        }
    }
}
