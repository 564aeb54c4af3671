//! End-to-end tests over the HTTP surface with mocked upstream providers.

use axum_test::TestServer;
use chrono::Utc;
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use switchboard_gateway::auth::ApiKeyRecord;
use switchboard_gateway::config::Config;
use switchboard_gateway::server::{build_router, build_state, AppState};
use switchboard_providers::providers::AdapterConfig;

fn config_with_providers(providers: Vec<(&str, &str)>) -> Config {
    let mut config = Config::default();
    for (name, base_url) in providers {
        config.providers.insert(
            name.to_string(),
            AdapterConfig::new(name, "test-key").with_base_url(base_url),
        );
    }
    config
}

fn server_for(state: AppState) -> TestServer {
    TestServer::new(build_router(state)).expect("failed to build test server")
}

fn chat_body(model: &str, content: &str) -> Value {
    json!({
        "model": model,
        "messages": [{"role": "user", "content": content}]
    })
}

fn completion_response(model: &str, content: &str) -> Value {
    json!({
        "id": "chatcmpl-upstream",
        "object": "chat.completion",
        "created": 1700000000,
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 8, "completion_tokens": 4, "total_tokens": 12}
    })
}

#[tokio::test]
async fn direct_model_happy_path_returns_gateway_metadata() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(completion_response("gpt-4o", "Hello!")),
        )
        .mount(&upstream)
        .await;

    let state = build_state(config_with_providers(vec![("openai", &upstream.uri())])).unwrap();
    let server = server_for(state);

    let response = server
        .post("/v1/chat/completions")
        .json(&chat_body("gpt-4o", "Hi"))
        .await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["model"], "gpt-4o");
    assert_eq!(body["choices"][0]["message"]["content"], "Hello!");
    assert_eq!(body["usage"]["total_tokens"], 12);

    let gateway = &body["x-gateway"];
    assert_eq!(gateway["provider"], "openai");
    assert_eq!(gateway["fallback_used"], false);
    assert_eq!(gateway["cache_hit"], false);
    assert_eq!(gateway["routing_decision"], "Direct model request");

    assert!(response.headers().contains_key("X-Request-Id"));
    assert!(response.headers().contains_key("X-Response-Time"));
    assert_eq!(response.headers()["X-Powered-By"], "llm-gateway");

    // usage arithmetic invariant
    let usage = &body["usage"];
    assert_eq!(
        usage["prompt_tokens"].as_u64().unwrap() + usage["completion_tokens"].as_u64().unwrap(),
        usage["total_tokens"].as_u64().unwrap()
    );
}

#[tokio::test]
async fn failing_primary_falls_back_to_secondary_provider() {
    let openai = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&openai)
        .await;

    let groq = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_response(
            "llama3-70b-8192",
            "Served by backup",
        )))
        .mount(&groq)
        .await;

    let mut config = config_with_providers(vec![("openai", &openai.uri()), ("groq", &groq.uri())]);
    config.routing.config.fallback_chain = vec!["openai".to_string(), "groq".to_string()];
    let state = build_state(config).unwrap();
    let server = server_for(state.clone());

    let mut body = chat_body("auto", "Hi there");
    body["x-prefer-provider"] = json!("openai");
    let response = server.post("/v1/chat/completions").json(&body).await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["x-gateway"]["provider"], "groq");
    assert_eq!(body["x-gateway"]["fallback_used"], true);
    assert_eq!(body["choices"][0]["message"]["content"], "Served by backup");

    // The primary's breaker saw exactly one failure.
    let snapshots = state.breakers.snapshots();
    assert_eq!(snapshots["openai"].failure_count, 1);
}

#[tokio::test]
async fn exhausted_budget_denies_before_any_upstream_call() {
    let upstream = MockServer::start().await;
    // No mock mounted: an upstream call would 404 and fail the request
    // differently; the budget check must fire first.
    let state = build_state(config_with_providers(vec![("openai", &upstream.uri())])).unwrap();

    state.key_store.insert_record(ApiKeyRecord {
        id: "gw-test-spent".to_string(),
        key: "sb-spent".to_string(),
        name: "spent".to_string(),
        enabled: true,
        monthly_token_budget: Some(100),
        monthly_cost_budget_usd: None,
        rate_limit_rpm: None,
        rate_limit_tpm: None,
        tokens_used_this_month: 100,
        cost_used_this_month_usd: 0.0,
        last_reset_at: Utc::now(),
        created_at: Utc::now(),
    });

    let server = server_for(state);
    let response = server
        .post("/v1/chat/completions")
        .authorization_bearer("sb-spent")
        .json(&chat_body("gpt-4o", "Hi"))
        .await;

    response.assert_status(axum::http::StatusCode::TOO_MANY_REQUESTS);
    let body: Value = response.json();
    assert_eq!(body["error"]["type"], "budget_exceeded");
    assert_eq!(upstream.received_requests().await.unwrap().len(), 0);
}

#[tokio::test]
async fn unknown_api_key_is_unauthorized() {
    let upstream = MockServer::start().await;
    let state = build_state(config_with_providers(vec![("openai", &upstream.uri())])).unwrap();
    state.key_store.insert_record(ApiKeyRecord {
        id: "gw-test-known".to_string(),
        key: "sb-known".to_string(),
        name: "known".to_string(),
        enabled: true,
        monthly_token_budget: None,
        monthly_cost_budget_usd: None,
        rate_limit_rpm: None,
        rate_limit_tpm: None,
        tokens_used_this_month: 0,
        cost_used_this_month_usd: 0.0,
        last_reset_at: Utc::now(),
        created_at: Utc::now(),
    });

    let server = server_for(state);
    let response = server
        .post("/v1/chat/completions")
        .authorization_bearer("sb-wrong")
        .json(&chat_body("gpt-4o", "Hi"))
        .await;

    response.assert_status(axum::http::StatusCode::UNAUTHORIZED);
    let body: Value = response.json();
    assert_eq!(body["error"]["type"], "authentication_error");
}

#[tokio::test]
async fn invalid_body_reports_field_errors() {
    let state = build_state(Config::default()).unwrap();
    let server = server_for(state);

    let response = server
        .post("/v1/chat/completions")
        .json(&json!({ "messages": [] }))
        .await;

    response.assert_status(axum::http::StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["error"]["type"], "invalid_request_error");
    assert!(body["error"]["details"]["field_errors"].is_array());
}

#[tokio::test]
async fn streaming_produces_sse_frames_and_done_terminator() {
    let upstream = MockServer::start().await;
    let sse_body = concat!(
        "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"He\"},\"finish_reason\":null}]}\n\n",
        "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"llo\"},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse_body, "text/event-stream"))
        .mount(&upstream)
        .await;

    let state = build_state(config_with_providers(vec![("openai", &upstream.uri())])).unwrap();
    let server = server_for(state);

    let mut body = chat_body("gpt-4o", "Hi");
    body["stream"] = json!(true);
    let response = server.post("/v1/chat/completions").json(&body).await;

    response.assert_status_ok();
    assert_eq!(response.headers()["content-type"], "text/event-stream");

    let text = response.text();
    assert!(text.contains("\"delta\":{\"content\":\"He\"}"));
    assert!(text.contains("chat.completion.chunk"));
    assert!(text.ends_with("data: [DONE]\n\n"));
}

#[tokio::test]
async fn health_reflects_provider_availability() {
    // No providers at all: unavailable.
    let state = build_state(Config::default()).unwrap();
    let server = server_for(state);
    let response = server.get("/health").await;
    response.assert_status(axum::http::StatusCode::SERVICE_UNAVAILABLE);

    // One optimistically-healthy provider: ok.
    let upstream = MockServer::start().await;
    let state = build_state(config_with_providers(vec![("groq", &upstream.uri())])).unwrap();
    let server = server_for(state);
    let response = server.get("/health").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["providers"]["healthy"], 1);
    assert_eq!(body["providers"]["total"], 1);
    assert!(body["active_requests"].is_number());
}

#[tokio::test]
async fn models_endpoint_lists_provider_catalogues() {
    let upstream = MockServer::start().await;
    let state = build_state(config_with_providers(vec![("groq", &upstream.uri())])).unwrap();
    let server = server_for(state);

    let response = server.get("/v1/models").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["object"], "list");
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&"llama3-70b-8192"));
    assert_eq!(body["data"][0]["object"], "model");
}

#[tokio::test]
async fn metrics_endpoint_renders_prometheus_text() {
    let state = build_state(Config::default()).unwrap();
    let server = server_for(state);

    let response = server.get("/metrics").await;
    response.assert_status_ok();
    let text = response.text();
    assert!(text.contains("# TYPE gateway_requests_total counter"));
    assert!(text.contains("gateway_request_duration_seconds_bucket{le=\"+Inf\"}"));
}

#[tokio::test]
async fn admin_api_requires_the_admin_key() {
    let mut config = Config::default();
    config.auth.admin_key = Some("admin-secret".to_string());
    let state = build_state(config).unwrap();
    let server = server_for(state);

    // Missing key.
    let response = server.get("/api/admin/keys").await;
    response.assert_status(axum::http::StatusCode::UNAUTHORIZED);

    // Correct key: create then list.
    let response = server
        .post("/api/admin/keys")
        .authorization_bearer("admin-secret")
        .json(&json!({ "name": "team-a", "monthly_token_budget": 50000 }))
        .await;
    response.assert_status_ok();
    let created: Value = response.json();
    assert!(created["id"].as_str().unwrap().starts_with("gw-dev-"));
    assert_eq!(created["monthly_token_budget"], 50000);

    let response = server
        .get("/api/admin/keys")
        .authorization_bearer("admin-secret")
        .await;
    response.assert_status_ok();
    let listed: Value = response.json();
    assert_eq!(listed["keys"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn admin_routing_round_trips() {
    let upstream = MockServer::start().await;
    let mut config = config_with_providers(vec![("groq", &upstream.uri())]);
    config.auth.admin_key = Some("admin-secret".to_string());
    let state = build_state(config).unwrap();
    let server = server_for(state);

    let response = server
        .put("/api/admin/routing")
        .authorization_bearer("admin-secret")
        .json(&json!({
            "default_strategy": "cost",
            "fallback_chain": ["groq"],
            "constraints": { "prefer_local": false }
        }))
        .await;
    response.assert_status_ok();

    let response = server
        .get("/api/admin/routing")
        .authorization_bearer("admin-secret")
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["default_strategy"], "cost");
    assert_eq!(body["fallback_chain"][0], "groq");

    // Unknown provider in the chain is rejected.
    let response = server
        .put("/api/admin/routing")
        .authorization_bearer("admin-secret")
        .json(&json!({ "fallback_chain": ["nonexistent"] }))
        .await;
    response.assert_status(axum::http::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn circuit_breaker_and_analytics_endpoints_respond() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(completion_response("gpt-4o", "ok")),
        )
        .mount(&upstream)
        .await;

    let state = build_state(config_with_providers(vec![("openai", &upstream.uri())])).unwrap();
    let server = server_for(state);

    server
        .post("/v1/chat/completions")
        .json(&chat_body("gpt-4o", "Hi"))
        .await
        .assert_status_ok();

    let breakers: Value = server.get("/api/circuit-breakers").await.json();
    assert_eq!(breakers["breakers"]["openai"]["state"], "closed");

    let analytics: Value = server.get("/api/analytics").await.json();
    assert_eq!(analytics["total_requests"], 1);
    assert_eq!(analytics["requests_by_provider"]["openai"], 1);
}
