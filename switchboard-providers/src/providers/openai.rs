//! Adapter for OpenAI and the OpenAI-compatible vendors (Groq, Together).
//!
//! The three share the same wire dialect; a small [`OpenAiCompatible`]
//! profile carries what differs: endpoint, pricing, model catalogue, and the
//! virtual-model table.

use async_stream::stream;
use serde::{Deserialize, Serialize};

use super::http_client::VendorClient;
use super::{
    estimate_cost_heuristic, AdapterConfig, ChatStream, ProviderAdapter, HEALTH_CHECK_DEADLINE,
};
use crate::error::ProviderError;
use crate::models::{
    estimate_tokens, ChatRequest, ChatResult, CostEstimate, FinishReason, HealthReport, ModelInfo,
    StreamDelta, Usage,
};

/// Vendor profile for the OpenAI wire dialect.
#[derive(Debug)]
pub struct OpenAiCompatible {
    id: &'static str,
    name: &'static str,
    default_base: &'static str,
    default_max_tokens: u32,
    cost_per_1k_input: f64,
    cost_per_1k_output: f64,
    virtual_models: [(&'static str, &'static str); 4],
    models: &'static [&'static str],
}

impl OpenAiCompatible {
    pub fn openai() -> Self {
        Self {
            id: "openai",
            name: "OpenAI",
            default_base: "https://api.openai.com/v1",
            default_max_tokens: 1024,
            cost_per_1k_input: 0.0025,
            cost_per_1k_output: 0.01,
            virtual_models: [
                ("auto", "gpt-4o"),
                ("fast", "gpt-4o-mini"),
                ("cheap", "gpt-4o-mini"),
                ("quality", "gpt-4o"),
            ],
            models: &["gpt-4o", "gpt-4o-mini", "gpt-4-turbo", "gpt-3.5-turbo"],
        }
    }

    pub fn groq() -> Self {
        Self {
            id: "groq",
            name: "Groq",
            default_base: "https://api.groq.com/openai/v1",
            default_max_tokens: 1024,
            cost_per_1k_input: 0.00059,
            cost_per_1k_output: 0.00079,
            virtual_models: [
                ("auto", "llama3-70b-8192"),
                ("fast", "llama3-8b-8192"),
                ("cheap", "llama3-8b-8192"),
                ("quality", "llama3-70b-8192"),
            ],
            models: &[
                "llama3-70b-8192",
                "llama3-8b-8192",
                "mixtral-8x7b-32768",
                "gemma-7b-it",
            ],
        }
    }

    pub fn together() -> Self {
        Self {
            id: "together",
            name: "Together AI",
            default_base: "https://api.together.xyz/v1",
            default_max_tokens: 1024,
            cost_per_1k_input: 0.0009,
            cost_per_1k_output: 0.0009,
            virtual_models: [
                ("auto", "meta-llama/Llama-3-70b-chat-hf"),
                ("fast", "meta-llama/Llama-3-8b-chat-hf"),
                ("cheap", "meta-llama/Llama-3-8b-chat-hf"),
                ("quality", "meta-llama/Llama-3-70b-chat-hf"),
            ],
            models: &[
                "meta-llama/Llama-3-70b-chat-hf",
                "meta-llama/Llama-3-8b-chat-hf",
                "mistralai/Mixtral-8x7B-Instruct-v0.1",
            ],
        }
    }
}

#[derive(Debug)]
pub struct OpenAiAdapter {
    http: VendorClient,
    profile: OpenAiCompatible,
    has_api_key: bool,
}

#[derive(Debug, Serialize)]
struct UpstreamChatBody {
    model: String,
    messages: Vec<UpstreamMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Serialize)]
struct UpstreamMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct UpstreamChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<UpstreamChoice>,
    #[serde(default)]
    usage: Option<UpstreamUsage>,
}

#[derive(Debug, Deserialize)]
struct UpstreamChoice {
    message: UpstreamChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpstreamChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpstreamUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct UpstreamChunk {
    choices: Vec<UpstreamStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct UpstreamStreamChoice {
    delta: UpstreamStreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpstreamStreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpstreamModelList {
    data: Vec<UpstreamModel>,
}

#[derive(Debug, Deserialize)]
struct UpstreamModel {
    id: String,
    #[serde(default)]
    owned_by: Option<String>,
}

impl OpenAiAdapter {
    pub fn new(config: AdapterConfig, profile: OpenAiCompatible) -> Result<Self, ProviderError> {
        let has_api_key = !config.api_key.is_empty();
        let http = VendorClient::from_config(&config, profile.default_base, None)?;

        Ok(Self {
            http,
            profile,
            has_api_key,
        })
    }

    fn build_body(&self, request: &ChatRequest, stream: bool) -> UpstreamChatBody {
        UpstreamChatBody {
            model: self.resolve_model(&request.model),
            messages: request
                .messages
                .iter()
                .map(|m| UpstreamMessage {
                    role: match m.role {
                        crate::models::Role::System => "system",
                        crate::models::Role::User => "user",
                        crate::models::Role::Assistant => "assistant",
                    },
                    content: m.content.clone(),
                })
                .collect(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            stop: request.stop.clone().map(|s| s.into_vec()),
            stream: stream.then_some(true),
        }
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn id(&self) -> &str {
        self.profile.id
    }

    fn name(&self) -> &str {
        self.profile.name
    }

    fn supported_models(&self) -> Vec<String> {
        self.profile.models.iter().map(|m| m.to_string()).collect()
    }

    fn resolve_model(&self, model: &str) -> String {
        self.profile
            .virtual_models
            .iter()
            .find(|(alias, _)| *alias == model)
            .map(|(_, concrete)| concrete.to_string())
            .unwrap_or_else(|| model.to_string())
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResult, ProviderError> {
        let body = self.build_body(request, false);
        let model = body.model.clone();
        let response: UpstreamChatResponse = self.http.post("/chat/completions", &body).await?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::BadResponse {
                message: "response contained no choices".to_string(),
            })?;
        let content = choice.message.content.unwrap_or_default();

        let usage = match response.usage {
            Some(u) => Usage::new(u.prompt_tokens, u.completion_tokens),
            None => Usage::new(
                estimate_tokens(&request.joined_content()),
                estimate_tokens(&content),
            ),
        };

        Ok(ChatResult {
            content,
            finish_reason: choice
                .finish_reason
                .as_deref()
                .and_then(FinishReason::from_vendor),
            usage,
            model: response.model.unwrap_or(model),
        })
    }

    async fn chat_stream(&self, request: &ChatRequest) -> Result<ChatStream, ProviderError> {
        let body = self.build_body(request, true);
        let response = self.http.post_streaming("/chat/completions", &body).await?;

        let stream = Box::pin(stream! {
            let mut bytes_stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk_result) = futures::StreamExt::next(&mut bytes_stream).await {
                match chunk_result {
                    Ok(chunk) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk));

                        while let Some(line_end) = buffer.find('\n') {
                            let line = buffer[..line_end].trim().to_string();
                            buffer = buffer[line_end + 1..].to_string();

                            if let Some(json_str) = line.strip_prefix("data: ") {
                                if json_str == "[DONE]" {
                                    return;
                                }

                                match serde_json::from_str::<UpstreamChunk>(json_str) {
                                    Ok(chunk) => {
                                        if let Some(choice) = chunk.choices.into_iter().next() {
                                            yield Ok(StreamDelta {
                                                content: choice.delta.content.unwrap_or_default(),
                                                finish_reason: choice
                                                    .finish_reason
                                                    .as_deref()
                                                    .and_then(FinishReason::from_vendor),
                                            });
                                        }
                                    }
                                    Err(e) => yield Err(ProviderError::Stream {
                                        message: format!("bad stream frame: {e}"),
                                    }),
                                }
                            }
                        }
                    }
                    Err(e) => yield Err(ProviderError::Stream {
                        message: e.to_string(),
                    }),
                }
            }
        });

        Ok(stream)
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
        let list: UpstreamModelList = self.http.get("/models").await?;
        Ok(list
            .data
            .into_iter()
            .map(|m| ModelInfo {
                id: m.id,
                owned_by: m.owned_by.unwrap_or_else(|| self.profile.id.to_string()),
            })
            .collect())
    }

    async fn health_check(&self) -> HealthReport {
        if !self.has_api_key {
            return HealthReport::unhealthy(0, "API key not configured");
        }

        let start = std::time::Instant::now();
        let probe = tokio::time::timeout(
            HEALTH_CHECK_DEADLINE,
            self.http.get::<serde_json::Value>("/models"),
        )
        .await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match probe {
            Ok(Ok(_)) => HealthReport::healthy(latency_ms),
            Ok(Err(e)) => HealthReport::unhealthy(latency_ms, e.to_string()),
            Err(_) => HealthReport::unhealthy(latency_ms, "health probe timed out"),
        }
    }

    fn estimate_cost(&self, request: &ChatRequest) -> CostEstimate {
        estimate_cost_heuristic(
            request,
            self.profile.default_max_tokens,
            self.profile.cost_per_1k_input,
            self.profile.cost_per_1k_output,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(base: &str) -> OpenAiAdapter {
        let config = AdapterConfig::new("openai", "sk-test").with_base_url(base);
        OpenAiAdapter::new(config, OpenAiCompatible::openai()).unwrap()
    }

    #[test]
    fn virtual_models_resolve_per_vendor_table() {
        let openai = OpenAiAdapter::new(
            AdapterConfig::new("openai", "k"),
            OpenAiCompatible::openai(),
        )
        .unwrap();
        assert_eq!(openai.resolve_model("auto"), "gpt-4o");
        assert_eq!(openai.resolve_model("cheap"), "gpt-4o-mini");
        assert_eq!(openai.resolve_model("gpt-4-turbo"), "gpt-4-turbo");

        let groq =
            OpenAiAdapter::new(AdapterConfig::new("groq", "k"), OpenAiCompatible::groq()).unwrap();
        assert_eq!(groq.resolve_model("fast"), "llama3-8b-8192");
    }

    #[tokio::test]
    async fn chat_maps_response_and_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(serde_json::json!({"model": "gpt-4o"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "chatcmpl-1",
                "model": "gpt-4o",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "Hello there"},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 9, "completion_tokens": 3, "total_tokens": 12}
            })))
            .mount(&server)
            .await;

        let result = adapter(&server.uri())
            .chat(&ChatRequest {
                model: "auto".to_string(),
                messages: vec![Message::user("Hi")],
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(result.content, "Hello there");
        assert_eq!(result.finish_reason, Some(FinishReason::Stop));
        assert_eq!(result.usage.prompt_tokens, 9);
        assert_eq!(result.usage.total_tokens, 12);
        assert_eq!(result.model, "gpt-4o");
    }

    #[tokio::test]
    async fn missing_api_key_is_unhealthy_without_network() {
        let config = AdapterConfig::new("openai", "");
        let adapter = OpenAiAdapter::new(config, OpenAiCompatible::openai()).unwrap();
        let report = adapter.health_check().await;
        assert!(!report.healthy);
        assert_eq!(report.message.as_deref(), Some("API key not configured"));
    }

    #[tokio::test]
    async fn upstream_5xx_maps_to_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = adapter(&server.uri())
            .chat(&ChatRequest {
                model: "gpt-4o".to_string(),
                messages: vec![Message::user("Hi")],
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Server { status: 500, .. }));
    }
}
