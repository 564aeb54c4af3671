use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::AdapterConfig;
use crate::error::ProviderError;

/// HTTP transport for one vendor endpoint.
///
/// Built directly from the adapter's [`AdapterConfig`]: the credential, the
/// extra headers, and the endpoint override all come from there. Every
/// response is status-checked here, so adapters only ever see decoded
/// bodies or a [`ProviderError`].
#[derive(Debug)]
pub struct VendorClient {
    http: Client,
    /// Base URL with no trailing slash.
    base: String,
    headers: HeaderMap,
}

impl VendorClient {
    /// `auth_header` names the vendor's credential header; `None` means the
    /// key travels as a standard bearer token. An empty API key sends no
    /// credential at all.
    pub fn from_config(
        config: &AdapterConfig,
        default_base: &str,
        auth_header: Option<&str>,
    ) -> Result<Self, ProviderError> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::Transport {
                message: format!("failed to build HTTP client: {e}"),
            })?;

        let mut headers = HeaderMap::new();
        if !config.api_key.is_empty() {
            let (name, value) = match auth_header {
                Some(name) => (name.to_string(), config.api_key.clone()),
                None => (
                    "authorization".to_string(),
                    format!("Bearer {}", config.api_key),
                ),
            };
            insert_header(&mut headers, &name, &value);
        }
        for (name, value) in &config.headers {
            insert_header(&mut headers, name, value);
        }

        let base = config
            .base_url
            .as_deref()
            .unwrap_or(default_base)
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            http,
            base,
            headers,
        })
    }

    /// One request against the vendor; non-2xx responses become errors.
    async fn send<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Response, ProviderError> {
        let url = format!("{}/{}", self.base, path.trim_start_matches('/'));
        let mut request = self.http.request(method, url).headers(self.headers.clone());
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(error_from_response(response).await)
        }
    }

    pub async fn post<B: Serialize, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, ProviderError> {
        Ok(self.send(Method::POST, path, Some(body)).await?.json().await?)
    }

    /// POST whose body stays unconsumed for the caller to stream.
    pub async fn post_streaming<B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Response, ProviderError> {
        self.send(Method::POST, path, Some(body)).await
    }

    pub async fn get<R: DeserializeOwned>(&self, path: &str) -> Result<R, ProviderError> {
        Ok(self.send::<()>(Method::GET, path, None).await?.json().await?)
    }
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) {
    match (name.parse::<HeaderName>(), value.parse::<HeaderValue>()) {
        (Ok(name), Ok(value)) => {
            headers.insert(name, value);
        }
        _ => tracing::warn!(header = %name, "ignoring malformed header in provider config"),
    }
}

/// Maps a non-success HTTP response onto the provider error taxonomy.
async fn error_from_response(response: Response) -> ProviderError {
    let status = response.status();
    let message = match response.text().await {
        Ok(body) => {
            // Pull a message out of the common {"error": {"message": ...}}
            // and {"error": "..."} shapes before falling back to the body.
            serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v.get("error").cloned())
                .and_then(|e| {
                    e.get("message")
                        .and_then(|m| m.as_str().map(str::to_string))
                        .or_else(|| e.as_str().map(str::to_string))
                })
                .unwrap_or(body)
        }
        Err(_) => "failed to read error response".to_string(),
    };

    match status.as_u16() {
        401 | 403 => ProviderError::Auth,
        429 => ProviderError::RateLimited,
        code if code >= 500 => ProviderError::Server {
            status: code,
            message,
        },
        code => ProviderError::BadResponse {
            message: format!("unexpected status {code}: {message}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(base: &str) -> VendorClient {
        let config = AdapterConfig::new("openai", "test-key").with_base_url(base);
        VendorClient::from_config(&config, "http://unused", None).unwrap()
    }

    #[tokio::test]
    async fn bearer_credential_rides_on_every_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        client(&server.uri())
            .get::<serde_json::Value>("/models")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn empty_api_key_sends_no_credential() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let config = AdapterConfig::new("ollama", "").with_base_url(server.uri());
        let client = VendorClient::from_config(&config, "http://unused", None).unwrap();
        client.get::<serde_json::Value>("/api/tags").await.unwrap();

        let requests = server.received_requests().await.unwrap();
        assert!(requests[0].headers.get("authorization").is_none());
    }

    #[tokio::test]
    async fn named_auth_header_replaces_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/probe"))
            .and(header("x-api-key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let config = AdapterConfig::new("anthropic", "test-key").with_base_url(server.uri());
        let client = VendorClient::from_config(&config, "http://unused", Some("x-api-key")).unwrap();
        client.get::<serde_json::Value>("/probe").await.unwrap();
    }

    #[tokio::test]
    async fn unauthorized_maps_to_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = client(&server.uri())
            .get::<serde_json::Value>("/models")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Auth));
    }

    #[tokio::test]
    async fn throttling_maps_to_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let err = client(&server.uri())
            .get::<serde_json::Value>("/models")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::RateLimited));
    }

    #[tokio::test]
    async fn server_error_keeps_status_and_message() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(503).set_body_json(serde_json::json!({
                "error": {"message": "overloaded"}
            })))
            .mount(&server)
            .await;

        let err = client(&server.uri())
            .get::<serde_json::Value>("/models")
            .await
            .unwrap_err();
        match err {
            ProviderError::Server { status, message } => {
                assert_eq!(status, 503);
                assert_eq!(message, "overloaded");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn streaming_post_surfaces_upstream_errors_before_the_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = client(&server.uri())
            .post_streaming("/chat/completions", &serde_json::json!({"model": "m"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Server { status: 500, .. }));
    }
}
