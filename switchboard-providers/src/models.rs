//! Wire types shared by the gateway and the provider adapters.
//!
//! The request/response shapes follow the OpenAI chat-completions API so that
//! clients can point an existing SDK at the gateway without payload changes.
//! Gateway-specific request extensions ride along in the body under `x-`
//! prefixed fields, and every successful response carries an `x-gateway`
//! metadata block describing how the request was served.

use serde::{Deserialize, Serialize};

use crate::router::RoutingStrategy;

/// Virtual model names resolved per-adapter to a concrete model id.
pub const VIRTUAL_MODELS: [&str; 4] = ["auto", "fast", "cheap", "quality"];

/// Returns true when `name` is one of the request-time virtual model symbols.
pub fn is_virtual_model(name: &str) -> bool {
    VIRTUAL_MODELS.contains(&name)
}

/// Chat completion request in OpenAI shape, plus gateway extensions.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatRequest {
    /// Concrete model id, alias, or one of the virtual models.
    pub model: String,
    /// Ordered conversation. Must be non-empty.
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopSequence>,
    /// Number of completions; the gateway only supports 1.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
    /// Per-request routing strategy override.
    #[serde(
        rename = "x-routing-strategy",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub routing_strategy: Option<RoutingStrategy>,
    /// Restrict candidate scoring to a single provider.
    #[serde(
        rename = "x-prefer-provider",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub prefer_provider: Option<String>,
    /// Whether the semantic cache may serve or store this request.
    #[serde(rename = "x-cache", default = "default_true")]
    pub cache: bool,
    /// Budget key override; falls back to the Authorization key.
    #[serde(
        rename = "x-budget-key",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub budget_key: Option<String>,
}

fn default_true() -> bool {
    true
}

impl ChatRequest {
    /// Concatenated message contents, used by the classifier and the
    /// semantic cache key.
    pub fn joined_content(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Stop sequences accept either a single string or a list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopSequence {
    One(String),
    Many(Vec<String>),
}

impl StopSequence {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            StopSequence::One(s) => vec![s],
            StopSequence::Many(v) => v,
        }
    }
}

/// A single conversation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
}

impl FinishReason {
    /// Maps vendor finish/stop reason strings onto the common set.
    pub fn from_vendor(reason: &str) -> Option<Self> {
        match reason {
            "stop" | "end_turn" | "stop_sequence" | "eos" => Some(FinishReason::Stop),
            "length" | "max_tokens" => Some(FinishReason::Length),
            "content_filter" => Some(FinishReason::ContentFilter),
            _ => None,
        }
    }
}

/// Token accounting for one completion.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// The provider-agnostic result of one upstream chat call.
///
/// Adapters translate their vendor response into this; the gateway wraps it
/// into a [`ChatResponse`] for the wire.
#[derive(Debug, Clone)]
pub struct ChatResult {
    pub content: String,
    pub finish_reason: Option<FinishReason>,
    pub usage: Usage,
    /// Concrete model that produced the completion.
    pub model: String,
}

/// One element of an adapter's streaming sequence.
///
/// A non-`None` `finish_reason` marks the terminating element.
#[derive(Debug, Clone)]
pub struct StreamDelta {
    pub content: String,
    pub finish_reason: Option<FinishReason>,
}

/// Chat completion response on the wire (OpenAI shape plus `x-gateway`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
    #[serde(rename = "x-gateway", skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayMetadata>,
}

impl ChatResponse {
    /// Wraps an upstream result into the wire shape with a gateway-minted id.
    pub fn from_result(id: String, result: ChatResult, gateway: GatewayMetadata) -> Self {
        Self {
            id,
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: result.model.clone(),
            choices: vec![Choice {
                index: 0,
                message: Message::assistant(result.content),
                finish_reason: result.finish_reason,
            }],
            usage: result.usage,
            gateway: Some(gateway),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: Message,
    pub finish_reason: Option<FinishReason>,
}

/// Gateway metadata attached to every successful chat response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayMetadata {
    pub provider: String,
    pub routing_decision: String,
    pub latency_ms: u64,
    pub cost_usd: f64,
    pub cache_hit: bool,
    pub fallback_used: bool,
}

/// Model catalogue entry reported by an adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub owned_by: String,
}

/// Cost estimate for a request before it is sent upstream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CostEstimate {
    pub estimated_input_tokens: u32,
    pub estimated_output_tokens: u32,
    pub estimated_cost_usd: f64,
}

/// Health probe outcome for one adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HealthReport {
    pub fn healthy(latency_ms: u64) -> Self {
        Self {
            healthy: true,
            latency_ms,
            message: None,
        }
    }

    pub fn unhealthy(latency_ms: u64, message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            latency_ms,
            message: Some(message.into()),
        }
    }
}

/// Estimates tokens from text with the chars/4 heuristic used throughout
/// the gateway for admission checks and stream accounting.
pub fn estimate_tokens(text: &str) -> u32 {
    text.len().div_ceil(4) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_extensions_deserialize_from_wire_names() {
        let body = serde_json::json!({
            "model": "auto",
            "messages": [{"role": "user", "content": "Hi"}],
            "x-routing-strategy": "cost",
            "x-prefer-provider": "groq",
            "x-cache": false,
            "x-budget-key": "team-a"
        });
        let request: ChatRequest = serde_json::from_value(body).unwrap();
        assert_eq!(request.routing_strategy, Some(RoutingStrategy::Cost));
        assert_eq!(request.prefer_provider.as_deref(), Some("groq"));
        assert!(!request.cache);
        assert_eq!(request.budget_key.as_deref(), Some("team-a"));
    }

    #[test]
    fn cache_extension_defaults_to_enabled() {
        let body = serde_json::json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "Hi"}]
        });
        let request: ChatRequest = serde_json::from_value(body).unwrap();
        assert!(request.cache);
        assert!(!request.stream);
    }

    #[test]
    fn stop_accepts_string_or_array() {
        let one: ChatRequest = serde_json::from_value(serde_json::json!({
            "model": "auto", "messages": [{"role": "user", "content": "x"}], "stop": "END"
        }))
        .unwrap();
        let many: ChatRequest = serde_json::from_value(serde_json::json!({
            "model": "auto", "messages": [{"role": "user", "content": "x"}], "stop": ["a", "b"]
        }))
        .unwrap();
        assert_eq!(one.stop.unwrap().into_vec(), vec!["END"]);
        assert_eq!(many.stop.unwrap().into_vec(), vec!["a", "b"]);
    }

    #[test]
    fn usage_totals_are_consistent() {
        let usage = Usage::new(120, 30);
        assert_eq!(usage.total_tokens, 150);
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
