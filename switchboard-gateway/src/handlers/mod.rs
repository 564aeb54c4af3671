//! HTTP handlers: the chat completion pipeline, the OpenAI-compatible
//! surface, and the gateway status APIs.
//!
//! The chat pipeline runs the stages in a fixed order: parse → auth →
//! budget → rate limit → cache lookup → route → execute → record. Budget
//! and rate-limit checks always happen before any upstream call; cache,
//! metrics, and log writes after the response are best-effort and never
//! fail the request.

pub mod admin;

use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, Response, StatusCode};
use axum::response::IntoResponse;
use axum::{Extension, Json};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};

use switchboard_providers::models::{
    estimate_tokens, ChatRequest, ChatResponse, ChatResult, GatewayMetadata,
};
use switchboard_providers::router::RoutingDecision;

use crate::auth::ApiKeyRecord;
use crate::gateway_error::GatewayError;
use crate::metrics::{CompletedRequest, MetricEvent};
use crate::middleware::{bearer_token, RequestId};
use crate::request_log::RequestLogRecord;
use crate::server::AppState;

/// `POST /v1/chat/completions`: the pipeline entry point.
pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response<Body>, GatewayError> {
    let started = Instant::now();
    let request = parse_and_validate(&body)?;

    // Authentication. Anonymous requests pass when no keys are provisioned;
    // a presented key must resolve once the store has any.
    let api_key = bearer_token(&headers);
    let auth_record = match &api_key {
        Some(key) if !state.key_store.is_empty() => match state.key_store.validate(key) {
            Some(record) => Some(record),
            None => {
                return Err(GatewayError::Authentication {
                    message: "unknown or disabled API key".to_string(),
                })
            }
        },
        _ => None,
    };

    // Budget charging can be redirected with x-budget-key; it falls back to
    // the authenticated key.
    let budget_record = request
        .budget_key
        .as_deref()
        .and_then(|key| state.key_store.validate(key))
        .or_else(|| auth_record.clone());

    let budget_check = state.budget.check_budget(budget_record.as_ref());
    if !budget_check.allowed {
        return Err(GatewayError::BudgetExceeded {
            message: budget_check
                .reason
                .unwrap_or_else(|| "budget exhausted".to_string()),
        });
    }
    if let Some(threshold) = budget_check.alert_threshold {
        tracing::warn!(
            threshold,
            token_pct = budget_check.token_usage_percent,
            cost_pct = budget_check.cost_usage_percent,
            "budget alert threshold crossed"
        );
    }

    // Rate limits, before anything upstream.
    if let Some(record) = &auth_record {
        if let Some(rpm) = record.rate_limit_rpm {
            let decision = state.rate_limiter.check_rpm(&record.id, rpm).await;
            if !decision.allowed {
                return Err(GatewayError::RateLimited {
                    message: format!("request rate limit of {rpm}/min exceeded"),
                    retry_after_ms: decision.retry_after_ms,
                    limit: decision.limit,
                    remaining: decision.remaining,
                });
            }
        }
        if let Some(tpm) = record.rate_limit_tpm {
            let estimated = estimate_tokens(&request.joined_content());
            let decision = state.rate_limiter.check_tpm(&record.id, tpm, estimated).await;
            if !decision.allowed {
                return Err(GatewayError::RateLimited {
                    message: format!("token rate limit of {tpm}/min exceeded"),
                    retry_after_ms: decision.retry_after_ms,
                    limit: decision.limit,
                    remaining: decision.remaining,
                });
            }
        }
    }

    // Cache lookup: unary requests only, and only when the client allows it.
    let cache_text = request.joined_content();
    if request.cache && !request.stream && state.cache.is_active() {
        if let Some(mut cached) = state.cache.lookup(&cache_text, &request.model).await {
            let latency_ms = started.elapsed().as_millis() as u64;
            let savings = cached
                .gateway
                .as_ref()
                .map(|g| g.cost_usd)
                .unwrap_or(0.0);
            state.cache_stats.record_hit(&cached.model, savings);

            cached.id = request_id.clone();
            let provider = match cached.gateway.as_mut() {
                Some(meta) => {
                    meta.cache_hit = true;
                    meta.cost_usd = 0.0;
                    meta.latency_ms = latency_ms;
                    meta.fallback_used = false;
                    meta.provider.clone()
                }
                None => "cache".to_string(),
            };

            state.metrics.record(&MetricEvent {
                provider: provider.clone(),
                model: cached.model.clone(),
                status: 200,
                strategy: "cache".to_string(),
                latency: started.elapsed(),
                input_tokens: cached.usage.prompt_tokens,
                output_tokens: cached.usage.completion_tokens,
                cost_usd: 0.0,
            });
            state.tracker.push(CompletedRequest {
                provider: provider.clone(),
                model: cached.model.clone(),
                status: 200,
                latency_ms,
                cost_usd: 0.0,
                cache_hit: true,
                finished_at: chrono::Utc::now(),
            });
            state
                .request_log
                .enqueue(RequestLogRecord {
                    request_id: request_id.clone(),
                    model_requested: request.model.clone(),
                    model_used: cached.model.clone(),
                    provider,
                    routing_strategy: "cache".to_string(),
                    routing_decision: "Semantic cache hit".to_string(),
                    prompt_tokens: cached.usage.prompt_tokens,
                    completion_tokens: cached.usage.completion_tokens,
                    total_tokens: cached.usage.total_tokens,
                    latency_ms,
                    cost_usd: 0.0,
                    cache_hit: true,
                    fallback_used: false,
                    status_code: 200,
                    error_message: None,
                    created_at: chrono::Utc::now(),
                })
                .await;

            tracing::debug!(request_id = %request_id, "served from semantic cache");
            return Ok(Json(cached).into_response());
        }
        state.cache_stats.record_miss(&request.model);
    }

    // Routing.
    let routing_config = state.routing.read().unwrap().clone();
    let decision = state.router.route(&request, &routing_config)?;
    tracing::debug!(
        request_id = %request_id,
        provider = %decision.provider,
        model = %decision.model_id,
        score = decision.score,
        "routed"
    );

    if request.stream {
        return handle_streaming(state, request_id, request, decision, auth_record).await;
    }

    // Execution with failover.
    let upstream_started = Instant::now();
    let outcome = state
        .chain
        .execute(
            &request,
            &decision.provider,
            Some(&decision.model_id),
            &routing_config.fallback_chain,
        )
        .await?;
    let latency_ms = upstream_started.elapsed().as_millis() as u64;

    let (cost_usd, routing_note) =
        compute_cost(&state, &outcome.provider_id, &outcome.result, &request, &decision);

    let total_tokens = outcome.result.usage.total_tokens;
    let response = ChatResponse::from_result(
        request_id.clone(),
        outcome.result.clone(),
        GatewayMetadata {
            provider: outcome.provider_id.clone(),
            routing_decision: routing_note.clone(),
            latency_ms,
            cost_usd,
            cache_hit: false,
            fallback_used: outcome.fallback_used,
        },
    );

    // Post-response bookkeeping. Cache store and usage recording may lag
    // the response but always reflect its actual values.
    if request.cache && state.cache.is_active() {
        let cache = state.cache.clone();
        let model = response.model.clone();
        let stored = response.clone();
        tokio::spawn(async move {
            cache.store(&cache_text, &model, &stored).await;
        });
    }
    if let Some(record) = budget_record.as_ref() {
        state
            .key_store
            .record_usage(&record.key, total_tokens as u64, cost_usd);
    }
    state.budget.record_global_usage(total_tokens as u64, cost_usd);
    state.metrics.record(&MetricEvent {
        provider: outcome.provider_id.clone(),
        model: response.model.clone(),
        status: 200,
        strategy: decision.strategy.as_str().to_string(),
        latency: upstream_started.elapsed(),
        input_tokens: outcome.result.usage.prompt_tokens,
        output_tokens: outcome.result.usage.completion_tokens,
        cost_usd,
    });
    state
        .capabilities
        .update_latency(&outcome.provider_id, &response.model, latency_ms as f64);
    state.tracker.push(CompletedRequest {
        provider: outcome.provider_id.clone(),
        model: response.model.clone(),
        status: 200,
        latency_ms,
        cost_usd,
        cache_hit: false,
        finished_at: chrono::Utc::now(),
    });
    state
        .request_log
        .enqueue(RequestLogRecord {
            request_id: request_id.clone(),
            model_requested: request.model.clone(),
            model_used: response.model.clone(),
            provider: outcome.provider_id.clone(),
            routing_strategy: decision.strategy.as_str().to_string(),
            routing_decision: routing_note,
            prompt_tokens: outcome.result.usage.prompt_tokens,
            completion_tokens: outcome.result.usage.completion_tokens,
            total_tokens,
            latency_ms,
            cost_usd,
            cache_hit: false,
            fallback_used: outcome.fallback_used,
            status_code: 200,
            error_message: None,
            created_at: chrono::Utc::now(),
        })
        .await;

    Ok(Json(response).into_response())
}

/// Streaming branch: server-sent events, no cache, no mid-stream fallback.
async fn handle_streaming(
    state: AppState,
    request_id: String,
    request: ChatRequest,
    decision: RoutingDecision,
    auth_record: Option<ApiKeyRecord>,
) -> Result<Response<Body>, GatewayError> {
    let adapter =
        state
            .registry
            .get(&decision.provider)
            .ok_or_else(|| GatewayError::ServiceUnavailable {
                message: format!("provider {} is not registered", decision.provider),
            })?;

    let model = adapter.resolve_model(&request.model);
    let prompt_tokens = adapter.estimate_cost(&request).estimated_input_tokens;
    let upstream_started = Instant::now();

    let mut stream = match adapter.chat_stream(&request).await {
        Ok(stream) => stream,
        Err(e) => {
            state.breakers.breaker(&decision.provider).record_failure();
            return Err(GatewayError::from(e));
        }
    };

    let (tx, rx) = tokio::sync::mpsc::channel::<String>(64);
    let created = chrono::Utc::now().timestamp();

    {
        let state = state.clone();
        let request_id = request_id.clone();
        let request_model = request.model.clone();
        let model = model.clone();
        let provider = decision.provider.clone();
        let strategy = decision.strategy;
        let routing_note = format!("{} (stream, tokens estimated)", decision.reasoning);
        let breaker = state.breakers.breaker(&decision.provider);

        tokio::spawn(async move {
            let mut content_len = 0usize;
            let mut errored = false;

            while let Some(item) = stream.next().await {
                match item {
                    Ok(delta) => {
                        content_len += delta.content.len();
                        let finished = delta.finish_reason.is_some();
                        let chunk = json!({
                            "id": request_id,
                            "object": "chat.completion.chunk",
                            "created": created,
                            "model": model,
                            "choices": [{
                                "index": 0,
                                "delta": { "content": delta.content },
                                "finish_reason": delta.finish_reason,
                            }],
                        });
                        if tx.send(format!("data: {chunk}\n\n")).await.is_err() {
                            // Client went away; stop producing.
                            return;
                        }
                        if finished {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(provider = %provider, "stream failed: {e}");
                        errored = true;
                        let envelope = json!({
                            "error": { "message": e.to_string(), "type": "stream_error" }
                        });
                        let _ = tx.send(format!("data: {envelope}\n\n")).await;
                        break;
                    }
                }
            }

            if errored {
                breaker.record_failure();
            } else {
                breaker.record_success();
                let _ = tx.send("data: [DONE]\n\n".to_string()).await;
            }
            drop(tx);

            // Stream accounting works from the chars/4 estimate; real token
            // counts are not surfaced on this path.
            let latency_ms = upstream_started.elapsed().as_millis() as u64;
            let completion_tokens = content_len.div_ceil(4) as u32;
            let status = if errored { 502 } else { 200 };
            let cost_usd = state
                .capabilities
                .get_profile(&provider, &model)
                .map(|p| {
                    (prompt_tokens as f64 / 1000.0) * p.cost_per_1k_input
                        + (completion_tokens as f64 / 1000.0) * p.cost_per_1k_output
                })
                .unwrap_or(0.0);

            if let Some(record) = &auth_record {
                state.key_store.record_usage(
                    &record.key,
                    (prompt_tokens + completion_tokens) as u64,
                    cost_usd,
                );
            }
            state
                .budget
                .record_global_usage((prompt_tokens + completion_tokens) as u64, cost_usd);
            state.metrics.record(&MetricEvent {
                provider: provider.clone(),
                model: model.clone(),
                status,
                strategy: strategy.as_str().to_string(),
                latency: upstream_started.elapsed(),
                input_tokens: prompt_tokens,
                output_tokens: completion_tokens,
                cost_usd,
            });
            state
                .capabilities
                .update_latency(&provider, &model, latency_ms as f64);
            state.tracker.push(CompletedRequest {
                provider: provider.clone(),
                model: model.clone(),
                status,
                latency_ms,
                cost_usd,
                cache_hit: false,
                finished_at: chrono::Utc::now(),
            });
            state
                .request_log
                .enqueue(RequestLogRecord {
                    request_id,
                    model_requested: request_model,
                    model_used: model,
                    provider,
                    routing_strategy: strategy.as_str().to_string(),
                    routing_decision: routing_note,
                    prompt_tokens,
                    completion_tokens,
                    total_tokens: prompt_tokens + completion_tokens,
                    latency_ms,
                    cost_usd,
                    cache_hit: false,
                    fallback_used: false,
                    status_code: status,
                    error_message: errored.then(|| "mid-stream upstream failure".to_string()),
                    created_at: chrono::Utc::now(),
                })
                .await;
        });
    }

    let body = Body::from_stream(
        tokio_stream::wrappers::ReceiverStream::new(rx)
            .map(|frame| Ok::<Bytes, std::io::Error>(frame.into())),
    );

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        .body(body)
        .unwrap())
}

/// Cost from the capability profile, or the adapter's halved estimate when
/// no profile covers the chosen model. The estimate case is flagged in the
/// routing note so downstream consumers can tell it apart.
fn compute_cost(
    state: &AppState,
    provider_id: &str,
    result: &ChatResult,
    request: &ChatRequest,
    decision: &RoutingDecision,
) -> (f64, String) {
    match state.capabilities.get_profile(provider_id, &result.model) {
        Some(profile) => {
            let cost = (result.usage.prompt_tokens as f64 / 1000.0) * profile.cost_per_1k_input
                + (result.usage.completion_tokens as f64 / 1000.0) * profile.cost_per_1k_output;
            (cost, decision.reasoning.clone())
        }
        None => {
            let estimate = state
                .registry
                .get(provider_id)
                .map(|a| a.estimate_cost(request).estimated_cost_usd)
                .unwrap_or(0.0);
            tracing::debug!(
                provider = %provider_id,
                model = %result.model,
                "no capability profile; cost is a halved pre-flight estimate"
            );
            (
                estimate / 2.0,
                format!("{} (cost estimated)", decision.reasoning),
            )
        }
    }
}

/// Parses the body and validates it against the request schema, collecting
/// field-level errors.
fn parse_and_validate(body: &Bytes) -> Result<ChatRequest, GatewayError> {
    let value: Value = serde_json::from_slice(body).map_err(|e| GatewayError::InvalidRequest {
        message: "request body is not valid JSON".to_string(),
        details: Some(json!({ "parse_error": e.to_string() })),
    })?;

    let mut field_errors: Vec<Value> = Vec::new();

    match value.get("model") {
        Some(Value::String(model)) if !model.is_empty() => {}
        Some(Value::String(_)) => {
            field_errors.push(json!({ "field": "model", "message": "must not be empty" }))
        }
        Some(_) => field_errors.push(json!({ "field": "model", "message": "must be a string" })),
        None => field_errors.push(json!({ "field": "model", "message": "is required" })),
    }

    match value.get("messages") {
        Some(Value::Array(messages)) if !messages.is_empty() => {
            for (i, message) in messages.iter().enumerate() {
                match message.get("role").and_then(|r| r.as_str()) {
                    Some("system" | "user" | "assistant") => {}
                    Some(other) => field_errors.push(json!({
                        "field": format!("messages[{i}].role"),
                        "message": format!("unknown role {other:?}"),
                    })),
                    None => field_errors.push(json!({
                        "field": format!("messages[{i}].role"),
                        "message": "is required",
                    })),
                }
                if message.get("content").and_then(|c| c.as_str()).is_none() {
                    field_errors.push(json!({
                        "field": format!("messages[{i}].content"),
                        "message": "must be a string",
                    }));
                }
            }
        }
        Some(Value::Array(_)) => field_errors.push(json!({
            "field": "messages",
            "message": "must not be empty",
        })),
        Some(_) => field_errors.push(json!({
            "field": "messages",
            "message": "must be an array",
        })),
        None => field_errors.push(json!({ "field": "messages", "message": "is required" })),
    }

    if let Some(n) = value.get("n") {
        if n.as_u64() != Some(1) {
            field_errors.push(json!({ "field": "n", "message": "only n=1 is supported" }));
        }
    }
    if let Some(temperature) = value.get("temperature").and_then(|t| t.as_f64()) {
        if !(0.0..=2.0).contains(&temperature) {
            field_errors.push(json!({
                "field": "temperature",
                "message": "must be within [0, 2]",
            }));
        }
    }

    if !field_errors.is_empty() {
        return Err(GatewayError::InvalidRequest {
            message: "request failed validation".to_string(),
            details: Some(json!({ "field_errors": field_errors })),
        });
    }

    serde_json::from_value(value).map_err(|e| GatewayError::InvalidRequest {
        message: "request does not match the chat completion schema".to_string(),
        details: Some(json!({ "parse_error": e.to_string() })),
    })
}

/// `POST /v1/embeddings`.
#[derive(Debug, Deserialize)]
pub struct EmbeddingsBody {
    pub model: String,
    pub input: EmbeddingsInput,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingsInput {
    One(String),
    Many(Vec<String>),
}

pub async fn embeddings(
    State(state): State<AppState>,
    Json(body): Json<EmbeddingsBody>,
) -> Result<Json<Value>, GatewayError> {
    let inputs = match body.input {
        EmbeddingsInput::One(s) => vec![s],
        EmbeddingsInput::Many(v) => v,
    };
    if inputs.is_empty() {
        return Err(GatewayError::InvalidRequest {
            message: "input must not be empty".to_string(),
            details: None,
        });
    }

    let mut data = Vec::with_capacity(inputs.len());
    let mut prompt_tokens = 0u32;
    for (index, input) in inputs.iter().enumerate() {
        prompt_tokens += estimate_tokens(input);
        let embedding = state.embedder.embed(input).await;
        data.push(json!({
            "object": "embedding",
            "embedding": embedding,
            "index": index,
        }));
    }

    Ok(Json(json!({
        "object": "list",
        "data": data,
        "model": body.model,
        "usage": { "prompt_tokens": prompt_tokens, "total_tokens": prompt_tokens },
    })))
}

/// `GET /v1/models`.
pub async fn list_models(State(state): State<AppState>) -> Json<Value> {
    let created = chrono::Utc::now().timestamp();
    let data: Vec<Value> = state
        .registry
        .get_all_models()
        .into_iter()
        .map(|(provider, model)| {
            json!({
                "id": model.id,
                "object": "model",
                "created": created,
                "owned_by": provider,
                "permission": [],
                "root": model.id,
                "parent": null,
            })
        })
        .collect();

    Json(json!({ "object": "list", "data": data }))
}

/// `GET /health`.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let statuses = state.registry.get_providers_status();
    let healthy = statuses.values().filter(|s| s.healthy).count();
    let total = statuses.len();

    let details: serde_json::Map<String, Value> = statuses
        .iter()
        .map(|(id, status)| {
            (
                id.clone(),
                json!({
                    "healthy": status.healthy,
                    "latency_ms": status.latency_ms,
                    "message": status.message,
                }),
            )
        })
        .collect();

    let body = json!({
        "status": if healthy > 0 { "ok" } else { "unavailable" },
        "providers": { "healthy": healthy, "total": total, "details": details },
        "infrastructure": {
            "cache": state.cache.is_active(),
            "persistence": state.config.logging.request_log_file.is_some(),
        },
        "uptime": state.tracker.uptime_seconds(),
        "active_requests": state.tracker.active_count(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });

    let status = if healthy > 0 {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

/// `GET /metrics`: Prometheus text exposition.
pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let text = state
        .metrics
        .render(&state.cache_stats, &state.breakers.snapshots());
    (
        [(
            "Content-Type",
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        text,
    )
}

/// `GET /api/providers`.
pub async fn providers_status(State(state): State<AppState>) -> Json<Value> {
    let statuses = state.registry.get_providers_status();
    Json(json!({ "providers": statuses }))
}

/// `GET /api/cache/stats`.
pub async fn cache_stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "cache": state.cache.stats().await,
        "requests": state.cache_stats.snapshot(),
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct InvalidateBody {
    #[serde(default)]
    pub pattern: Option<String>,
}

/// `POST /api/cache/invalidate`.
pub async fn cache_invalidate(
    State(state): State<AppState>,
    body: Option<Json<InvalidateBody>>,
) -> Json<Value> {
    let pattern = body.and_then(|Json(b)| b.pattern);
    let invalidated = state.cache.invalidate(pattern.as_deref()).await;
    Json(json!({ "invalidated": invalidated }))
}

/// `GET /api/circuit-breakers`.
pub async fn circuit_breakers(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "breakers": state.breakers.snapshots() }))
}

/// `GET /api/budget`.
pub async fn budget_status(State(state): State<AppState>) -> Json<Value> {
    let (tokens_used, cost_used) = state.budget.global_usage();
    let (token_budget, cost_budget) = state.budget.global_budgets();

    let keys: Vec<Value> = state
        .key_store
        .list()
        .into_iter()
        .map(|record| {
            json!({
                "id": record.id,
                "name": record.name,
                "enabled": record.enabled,
                "tokens_used_this_month": record.tokens_used_this_month,
                "cost_used_this_month_usd": record.cost_used_this_month_usd,
                "monthly_token_budget": record.monthly_token_budget,
                "monthly_cost_budget_usd": record.monthly_cost_budget_usd,
            })
        })
        .collect();

    Json(json!({
        "global": {
            "tokens_used": tokens_used,
            "cost_used_usd": cost_used,
            "monthly_token_budget": token_budget,
            "monthly_cost_budget_usd": cost_budget,
        },
        "keys": keys,
    }))
}

/// `GET /api/analytics`.
pub async fn analytics(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::to_value(state.tracker.analytics()).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(value: Value) -> Bytes {
        Bytes::from(serde_json::to_vec(&value).unwrap())
    }

    #[test]
    fn valid_request_parses() {
        let request = parse_and_validate(&body(json!({
            "model": "auto",
            "messages": [
                {"role": "system", "content": "Be brief."},
                {"role": "user", "content": "Hi"}
            ],
            "max_tokens": 64
        })))
        .unwrap();
        assert_eq!(request.model, "auto");
        assert_eq!(request.messages.len(), 2);
        assert_eq!(
            request.messages[1].role,
            switchboard_providers::models::Role::User
        );
    }

    #[test]
    fn missing_model_and_messages_report_field_errors() {
        let err = parse_and_validate(&body(json!({}))).unwrap_err();
        let envelope = err.envelope();
        assert_eq!(envelope["error"]["type"], "invalid_request_error");
        let fields: Vec<&str> = envelope["error"]["details"]["field_errors"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["field"].as_str().unwrap())
            .collect();
        assert!(fields.contains(&"model"));
        assert!(fields.contains(&"messages"));
    }

    #[test]
    fn empty_messages_are_rejected() {
        let err = parse_and_validate(&body(json!({
            "model": "auto",
            "messages": []
        })))
        .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest { .. }));
    }

    #[test]
    fn unknown_role_is_rejected() {
        let err = parse_and_validate(&body(json!({
            "model": "auto",
            "messages": [{"role": "robot", "content": "beep"}]
        })))
        .unwrap_err();
        let envelope = err.envelope();
        let detail = envelope["error"]["details"]["field_errors"][0]["field"]
            .as_str()
            .unwrap();
        assert_eq!(detail, "messages[0].role");
    }

    #[test]
    fn multi_completion_requests_are_rejected() {
        let err = parse_and_validate(&body(json!({
            "model": "auto",
            "messages": [{"role": "user", "content": "Hi"}],
            "n": 3
        })))
        .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest { .. }));
    }

    #[test]
    fn non_json_body_is_a_parse_error() {
        let err = parse_and_validate(&Bytes::from_static(b"not json")).unwrap_err();
        let envelope = err.envelope();
        assert!(envelope["error"]["details"]["parse_error"].is_string());
    }
}
