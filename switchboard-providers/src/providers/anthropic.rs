use async_stream::stream;
use serde::{Deserialize, Serialize};

use super::http_client::VendorClient;
use super::{
    estimate_cost_heuristic, AdapterConfig, ChatStream, ProviderAdapter, HEALTH_CHECK_DEADLINE,
};
use crate::error::ProviderError;
use crate::models::{
    ChatRequest, ChatResult, CostEstimate, FinishReason, HealthReport, ModelInfo, Role,
    StreamDelta, Usage,
};

const DEFAULT_MAX_TOKENS: u32 = 4096;
const COST_PER_1K_INPUT: f64 = 0.003;
const COST_PER_1K_OUTPUT: f64 = 0.015;

const MODELS: &[&str] = &[
    "claude-3-5-sonnet-20241022",
    "claude-3-5-haiku-20241022",
    "claude-opus-4-20250514",
    "claude-sonnet-4-20250514",
];

#[derive(Debug)]
pub struct AnthropicAdapter {
    http: VendorClient,
    has_api_key: bool,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
    model: String,
    #[serde(default)]
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

impl AnthropicAdapter {
    pub fn new(mut config: AdapterConfig) -> Result<Self, ProviderError> {
        let has_api_key = !config.api_key.is_empty();
        config
            .headers
            .insert("anthropic-version".to_string(), "2023-06-01".to_string());

        let http =
            VendorClient::from_config(&config, "https://api.anthropic.com", Some("x-api-key"))?;

        Ok(Self { http, has_api_key })
    }

    /// Collapses all system messages into one leading system prompt; the
    /// messages API rejects interleaved system turns.
    fn build_request(&self, request: &ChatRequest, stream: bool) -> AnthropicRequest {
        let mut system = String::new();
        let mut messages = Vec::new();

        for msg in &request.messages {
            match msg.role {
                Role::System => {
                    if !msg.content.is_empty() {
                        if !system.is_empty() {
                            system.push('\n');
                        }
                        system.push_str(&msg.content);
                    }
                }
                Role::User => messages.push(AnthropicMessage {
                    role: "user",
                    content: msg.content.clone(),
                }),
                Role::Assistant => messages.push(AnthropicMessage {
                    role: "assistant",
                    content: msg.content.clone(),
                }),
            }
        }

        AnthropicRequest {
            model: self.resolve_model(&request.model),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages,
            system: (!system.is_empty()).then_some(system),
            temperature: request.temperature,
            top_p: request.top_p,
            stop_sequences: request.stop.clone().map(|s| s.into_vec()),
            stream: stream.then_some(true),
        }
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn id(&self) -> &str {
        "anthropic"
    }

    fn name(&self) -> &str {
        "Anthropic"
    }

    fn supported_models(&self) -> Vec<String> {
        MODELS.iter().map(|m| m.to_string()).collect()
    }

    fn resolve_model(&self, model: &str) -> String {
        match model {
            "auto" => "claude-3-5-sonnet-20241022".to_string(),
            "fast" | "cheap" => "claude-3-5-haiku-20241022".to_string(),
            "quality" => "claude-opus-4-20250514".to_string(),
            other => other.to_string(),
        }
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResult, ProviderError> {
        let body = self.build_request(request, false);
        let response: AnthropicResponse = self.http.post("/v1/messages", &body).await?;

        let content = response
            .content
            .into_iter()
            .filter_map(|c| c.text)
            .collect::<Vec<_>>()
            .join("");

        Ok(ChatResult {
            content,
            finish_reason: response
                .stop_reason
                .as_deref()
                .and_then(FinishReason::from_vendor),
            usage: Usage::new(response.usage.input_tokens, response.usage.output_tokens),
            model: response.model,
        })
    }

    async fn chat_stream(&self, request: &ChatRequest) -> Result<ChatStream, ProviderError> {
        let body = self.build_request(request, true);
        let response = self.http.post_streaming("/v1/messages", &body).await?;

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

                            let Some(json_str) = line.strip_prefix("data: ") else {
                                continue;
                            };

                            let Ok(event) = serde_json::from_str::<serde_json::Value>(json_str)
                            else {
                                continue;
                            };

                            match event.get("type").and_then(|t| t.as_str()) {
                                Some("content_block_delta") => {
                                    if let Some(text) = event
                                        .get("delta")
                                        .and_then(|d| d.get("text"))
                                        .and_then(|t| t.as_str())
                                    {
                                        yield Ok(StreamDelta {
                                            content: text.to_string(),
                                            finish_reason: None,
                                        });
                                    }
                                }
                                Some("message_delta") => {
                                    let reason = event
                                        .get("delta")
                                        .and_then(|d| d.get("stop_reason"))
                                        .and_then(|r| r.as_str())
                                        .and_then(FinishReason::from_vendor)
                                        .unwrap_or(FinishReason::Stop);
                                    yield Ok(StreamDelta {
                                        content: String::new(),
                                        finish_reason: Some(reason),
                                    });
                                }
                                Some("message_stop") => return,
                                Some("error") => {
                                    let message = event
                                        .get("error")
                                        .and_then(|e| e.get("message"))
                                        .and_then(|m| m.as_str())
                                        .unwrap_or("upstream stream error")
                                        .to_string();
                                    yield Err(ProviderError::Stream { message });
                                    return;
                                }
                                _ => {}
                            }
                        }
                    }
                    Err(e) => {
                        yield Err(ProviderError::Stream { message: e.to_string() });
                        return;
                    }
                }
            }
        });

        Ok(stream)
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
        // No public models endpoint; report the static catalogue.
        Ok(MODELS
            .iter()
            .map(|m| ModelInfo {
                id: m.to_string(),
                owned_by: "anthropic".to_string(),
            })
            .collect())
    }

    async fn health_check(&self) -> HealthReport {
        if !self.has_api_key {
            return HealthReport::unhealthy(0, "API key not configured");
        }

        // Minimal one-token completion; there is no dedicated probe endpoint.
        let probe_body = AnthropicRequest {
            model: "claude-3-5-haiku-20241022".to_string(),
            max_tokens: 1,
            messages: vec![AnthropicMessage {
                role: "user",
                content: "Hi".to_string(),
            }],
            system: None,
            temperature: Some(0.0),
            top_p: None,
            stop_sequences: None,
            stream: Some(false),
        };

        let start = std::time::Instant::now();
        let probe = tokio::time::timeout(
            HEALTH_CHECK_DEADLINE,
            self.http
                .post::<AnthropicRequest, serde_json::Value>("/v1/messages", &probe_body),
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
            DEFAULT_MAX_TOKENS,
            COST_PER_1K_INPUT,
            COST_PER_1K_OUTPUT,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn system_messages_collapse_into_one_prompt() {
        let adapter = AnthropicAdapter::new(AdapterConfig::new("anthropic", "k")).unwrap();
        let request = ChatRequest {
            model: "auto".to_string(),
            messages: vec![
                Message::system("Be terse."),
                Message::user("Hi"),
                Message::system("Answer in French."),
                Message::assistant("Bonjour"),
            ],
            ..Default::default()
        };

        let body = adapter.build_request(&request, false);
        assert_eq!(body.system.as_deref(), Some("Be terse.\nAnswer in French."));
        assert_eq!(body.messages.len(), 2);
        assert_eq!(body.messages[0].role, "user");
        assert_eq!(body.messages[1].role, "assistant");
    }

    #[tokio::test]
    async fn chat_translates_messages_api_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("anthropic-version", "2023-06-01"))
            .and(body_partial_json(
                serde_json::json!({"model": "claude-3-5-sonnet-20241022"}),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "msg_1",
                "type": "message",
                "role": "assistant",
                "model": "claude-3-5-sonnet-20241022",
                "content": [{"type": "text", "text": "Bonjour!"}],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 12, "output_tokens": 4}
            })))
            .mount(&server)
            .await;

        let adapter = AnthropicAdapter::new(
            AdapterConfig::new("anthropic", "key").with_base_url(server.uri()),
        )
        .unwrap();

        let result = adapter
            .chat(&ChatRequest {
                model: "auto".to_string(),
                messages: vec![Message::user("Hello")],
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(result.content, "Bonjour!");
        assert_eq!(result.finish_reason, Some(FinishReason::Stop));
        assert_eq!(result.usage.total_tokens, 16);
    }

    #[test]
    fn quality_virtual_maps_to_opus() {
        let adapter = AnthropicAdapter::new(AdapterConfig::new("anthropic", "k")).unwrap();
        assert_eq!(adapter.resolve_model("quality"), "claude-opus-4-20250514");
        assert_eq!(adapter.resolve_model("fast"), "claude-3-5-haiku-20241022");
    }
}
