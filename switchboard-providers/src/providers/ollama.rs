use async_stream::stream;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::http_client::VendorClient;
use super::{
    estimate_cost_heuristic, AdapterConfig, ChatStream, ProviderAdapter, HEALTH_CHECK_DEADLINE,
};
use crate::error::ProviderError;
use crate::models::{
    estimate_tokens, ChatRequest, ChatResult, CostEstimate, FinishReason, HealthReport, ModelInfo,
    Role, StreamDelta, Usage,
};

const DEFAULT_MAX_TOKENS: u32 = 1024;

const MODELS: &[&str] = &["llama3", "llama3:70b", "mistral", "codellama"];

/// Local Ollama daemon. Free to run, so every cost estimate is zero.
#[derive(Debug)]
pub struct OllamaAdapter {
    http: VendorClient,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: OllamaMessage,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

impl OllamaAdapter {
    pub fn new(config: AdapterConfig) -> Result<Self, ProviderError> {
        // The local daemon is unauthenticated; with no API key configured
        // no credential header is sent at all.
        let http = VendorClient::from_config(&config, "http://localhost:11434", None)?;
        Ok(Self { http })
    }

    fn build_body(&self, request: &ChatRequest, stream: bool) -> serde_json::Value {
        let messages: Vec<WireMessage> = request
            .messages
            .iter()
            .map(|m| WireMessage {
                role: match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                },
                content: m.content.clone(),
            })
            .collect();

        json!({
            "model": self.resolve_model(&request.model),
            "messages": messages,
            "stream": stream,
            "options": {
                "temperature": request.temperature.unwrap_or(0.7),
                "num_predict": request.max_tokens,
            }
        })
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for OllamaAdapter {
    fn id(&self) -> &str {
        "ollama"
    }

    fn name(&self) -> &str {
        "Ollama"
    }

    fn supported_models(&self) -> Vec<String> {
        MODELS.iter().map(|m| m.to_string()).collect()
    }

    fn resolve_model(&self, model: &str) -> String {
        match model {
            "auto" | "fast" | "cheap" => "llama3".to_string(),
            "quality" => "llama3:70b".to_string(),
            other => other.to_string(),
        }
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResult, ProviderError> {
        let model = self.resolve_model(&request.model);
        let body = self.build_body(request, false);
        let response: OllamaChatResponse = self.http.post("/api/chat", &body).await?;

        let prompt_tokens = response
            .prompt_eval_count
            .map(|n| n as u32)
            .unwrap_or_else(|| estimate_tokens(&request.joined_content()));
        let completion_tokens = response
            .eval_count
            .map(|n| n as u32)
            .unwrap_or_else(|| estimate_tokens(&response.message.content));

        Ok(ChatResult {
            content: response.message.content,
            finish_reason: Some(FinishReason::Stop),
            usage: Usage::new(prompt_tokens, completion_tokens),
            model,
        })
    }

    async fn chat_stream(&self, request: &ChatRequest) -> Result<ChatStream, ProviderError> {
        let body = self.build_body(request, true);
        let response = self.http.post_streaming("/api/chat", &body).await?;

        // Ollama streams newline-delimited JSON objects, not SSE.
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

                            if line.is_empty() {
                                continue;
                            }

                            match serde_json::from_str::<serde_json::Value>(&line) {
                                Ok(frame) => {
                                    let content = frame
                                        .get("message")
                                        .and_then(|m| m.get("content"))
                                        .and_then(|c| c.as_str())
                                        .unwrap_or_default()
                                        .to_string();
                                    let done =
                                        frame.get("done").and_then(|d| d.as_bool()).unwrap_or(false);

                                    yield Ok(StreamDelta {
                                        content,
                                        finish_reason: done.then_some(FinishReason::Stop),
                                    });
                                    if done {
                                        return;
                                    }
                                }
                                Err(e) => {
                                    yield Err(ProviderError::Stream {
                                        message: format!("bad stream frame: {e}"),
                                    });
                                }
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
        let tags: serde_json::Value = self.http.get("/api/tags").await?;
        let models = tags
            .get("models")
            .and_then(|m| m.as_array())
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|e| e.get("name").and_then(|n| n.as_str()))
                    .map(|name| ModelInfo {
                        id: name.to_string(),
                        owned_by: "ollama".to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(models)
    }

    async fn health_check(&self) -> HealthReport {
        let start = std::time::Instant::now();
        let probe = tokio::time::timeout(
            HEALTH_CHECK_DEADLINE,
            self.http.get::<serde_json::Value>("/api/tags"),
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
        estimate_cost_heuristic(request, DEFAULT_MAX_TOKENS, 0.0, 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn chat_translates_ndjson_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "llama3",
                "message": {"role": "assistant", "content": "Hi from local"},
                "done": true,
                "prompt_eval_count": 7,
                "eval_count": 4
            })))
            .mount(&server)
            .await;

        let adapter =
            OllamaAdapter::new(AdapterConfig::new("ollama", "").with_base_url(server.uri()))
                .unwrap();

        let result = adapter
            .chat(&ChatRequest {
                model: "auto".to_string(),
                messages: vec![Message::user("Hello")],
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(result.content, "Hi from local");
        assert_eq!(result.usage.prompt_tokens, 7);
        assert_eq!(result.usage.completion_tokens, 4);
        assert_eq!(result.model, "llama3");
    }

    #[test]
    fn local_models_are_free() {
        let adapter = OllamaAdapter::new(AdapterConfig::new("ollama", "")).unwrap();
        let estimate = adapter.estimate_cost(&ChatRequest {
            model: "auto".to_string(),
            messages: vec![Message::user("some long prompt here")],
            max_tokens: Some(4096),
            ..Default::default()
        });
        assert_eq!(estimate.estimated_cost_usd, 0.0);
    }
}
