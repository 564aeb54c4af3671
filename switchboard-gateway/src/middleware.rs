//! HTTP middleware: per-request metadata headers and admin authentication.

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderValue, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::time::Instant;

use crate::gateway_error::GatewayError;
use crate::server::AppState;

/// Request id minted by the gateway, available to handlers via extensions.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Mints the request id, tracks the active-request count, and stamps the
/// `X-Request-Id` / `X-Response-Time` / `X-Powered-By` headers on every
/// response.
pub async fn request_metadata_middleware(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().simple());
    req.extensions_mut().insert(RequestId(request_id.clone()));

    let start = Instant::now();
    state.tracker.begin(&request_id);
    let mut response = next.run(req).await;
    state.tracker.end(&request_id);

    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert("X-Request-Id", value);
    }
    if let Ok(value) = HeaderValue::from_str(&format!("{elapsed_ms:.2}")) {
        headers.insert("X-Response-Time", value);
    }
    headers.insert("X-Powered-By", HeaderValue::from_static("llm-gateway"));

    response
}

/// Guards `/api/admin/*`: requires `Authorization: Bearer {admin_key}`.
pub async fn admin_auth_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(admin_key) = state.config.auth.admin_key.as_deref() else {
        return GatewayError::ServiceUnavailable {
            message: "admin API is not configured".to_string(),
        }
        .into_response();
    };

    let presented = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    match presented {
        Some(key) if key == admin_key => next.run(req).await,
        _ => GatewayError::Authentication {
            message: "admin key required".to_string(),
        }
        .into_response(),
    }
}

/// Pulls the client API key out of the `Authorization` header.
pub fn bearer_token(headers: &axum::http::HeaderMap) -> Option<String> {
    headers
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}
