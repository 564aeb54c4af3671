//! Admin API: key management and runtime routing configuration.
//!
//! Every route here sits behind the admin bearer key middleware.

use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};
use switchboard_providers::router::RoutingConfig;

use crate::auth::CreateKeyOptions;
use crate::gateway_error::GatewayError;
use crate::server::AppState;

/// `POST /api/admin/keys`. The response is the only place the bearer
/// secret is ever returned.
pub async fn create_key(
    State(state): State<AppState>,
    Json(options): Json<CreateKeyOptions>,
) -> Result<Json<Value>, GatewayError> {
    if options.name.trim().is_empty() {
        return Err(GatewayError::InvalidRequest {
            message: "key name must not be empty".to_string(),
            details: None,
        });
    }

    let record = state.key_store.create(options);
    tracing::info!(key_id = %record.id, name = %record.name, "API key created");
    Ok(Json(serde_json::to_value(record)?))
}

/// `GET /api/admin/keys`.
pub async fn list_keys(State(state): State<AppState>) -> Result<Json<Value>, GatewayError> {
    let keys = state.key_store.list();
    Ok(Json(json!({ "keys": keys })))
}

/// `DELETE /api/admin/keys/{key}`.
pub async fn revoke_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<Value>, GatewayError> {
    if !state.key_store.revoke(&key) {
        return Err(GatewayError::InvalidRequest {
            message: "unknown API key".to_string(),
            details: None,
        });
    }
    tracing::info!("API key revoked");
    Ok(Json(json!({ "revoked": true })))
}

/// `GET /api/admin/routing`.
pub async fn get_routing(State(state): State<AppState>) -> Result<Json<Value>, GatewayError> {
    let config = state.routing.read().unwrap().clone();
    Ok(Json(serde_json::to_value(config)?))
}

/// `PUT /api/admin/routing`: replaces the live routing configuration.
pub async fn put_routing(
    State(state): State<AppState>,
    Json(config): Json<RoutingConfig>,
) -> Result<Json<Value>, GatewayError> {
    for provider in &config.fallback_chain {
        if state.registry.get(provider).is_none() {
            return Err(GatewayError::InvalidRequest {
                message: format!("fallback chain references unknown provider {provider}"),
                details: None,
            });
        }
    }

    *state.routing.write().unwrap() = config.clone();
    tracing::info!(
        strategy = config.default_strategy.as_str(),
        "routing configuration updated"
    );
    Ok(Json(serde_json::to_value(config)?))
}
