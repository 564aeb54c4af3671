//! Server assembly: application state, route table, middleware stack, and
//! graceful shutdown.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::middleware::from_fn_with_state;
use axum::routing::{delete, get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use switchboard_providers::capability::CapabilityMap;
use switchboard_providers::circuit_breaker::CircuitBreakerManager;
use switchboard_providers::fallback::FallbackChain;
use switchboard_providers::providers::{create_adapter, ProviderAdapter};
use switchboard_providers::registry::ProviderRegistry;
use switchboard_providers::router::{ModelRouter, RoutingConfig};

use crate::auth::{ApiKeyStore, BudgetEnforcer, RateLimiter};
use crate::config::Config;
use crate::handlers;
use crate::metrics::{CacheStats, MetricsRegistry, RequestTracker};
use crate::middleware::{admin_auth_middleware, request_metadata_middleware};
use crate::request_log::{JsonlSink, LogSink, RequestLogger, TracingSink};
use crate::semantic_cache::{EmbeddingService, SemanticCache, SemanticCacheConfig};

/// Canonical registration order; determines routing tie-breaks and the
/// "first healthy" degradation path.
const PROVIDER_ORDER: [&str; 5] = ["openai", "anthropic", "groq", "together", "ollama"];

/// Everything the handlers need, shared by reference. The handler owns none
/// of it; each component has a single home here.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<ProviderRegistry>,
    pub capabilities: Arc<CapabilityMap>,
    pub router: Arc<ModelRouter>,
    pub breakers: Arc<CircuitBreakerManager>,
    pub chain: Arc<FallbackChain>,
    /// Runtime-mutable routing configuration (admin API).
    pub routing: Arc<RwLock<RoutingConfig>>,
    pub cache: Arc<SemanticCache>,
    pub cache_stats: Arc<CacheStats>,
    pub embedder: Arc<EmbeddingService>,
    pub key_store: Arc<ApiKeyStore>,
    pub budget: Arc<BudgetEnforcer>,
    pub rate_limiter: Arc<RateLimiter>,
    pub metrics: Arc<MetricsRegistry>,
    pub tracker: Arc<RequestTracker>,
    pub request_log: Arc<RequestLogger>,
}

/// Builds every component from configuration. Does not start background
/// tasks; see [`start_background_tasks`].
pub fn build_state(config: Config) -> anyhow::Result<AppState> {
    let mut adapters: Vec<Arc<dyn ProviderAdapter>> = Vec::new();
    let mut names: Vec<&String> = config.providers.keys().collect();
    names.sort_by_key(|name| {
        PROVIDER_ORDER
            .iter()
            .position(|p| *p == name.as_str())
            .unwrap_or(PROVIDER_ORDER.len())
    });

    for name in names {
        let adapter_config = &config.providers[name];
        if !adapter_config.enabled {
            continue;
        }
        // Hosted vendors need credentials; the local provider does not.
        if adapter_config.api_key.is_empty() && name != "ollama" {
            tracing::info!(provider = %name, "no API key configured, provider not registered");
            continue;
        }
        match create_adapter(adapter_config.clone()) {
            Ok(adapter) => adapters.push(adapter),
            Err(e) => tracing::error!(provider = %name, "failed to create adapter: {e}"),
        }
    }

    if adapters.is_empty() {
        tracing::warn!("no providers configured; every request will fail until one is added");
    }

    let registry = Arc::new(ProviderRegistry::new(adapters));
    let capabilities = Arc::new(CapabilityMap::with_default_profiles());
    let router = Arc::new(ModelRouter::new(registry.clone(), capabilities.clone()));
    let breakers = Arc::new(CircuitBreakerManager::new(config.circuit_breaker.clone()));
    let chain = Arc::new(FallbackChain::new(registry.clone(), breakers.clone()));

    let redis_url = config.cache.redis_url.as_deref();
    let cache = Arc::new(SemanticCache::new(
        SemanticCacheConfig {
            enabled: config.cache.enabled,
            similarity_threshold: config.cache.similarity_threshold,
            ttl_seconds: config.cache.ttl_seconds,
            max_entries: config.cache.max_entries,
        },
        EmbeddingService::new(&config.cache.embedding.url, &config.cache.embedding.model),
        redis_url,
    ));
    let embedder = Arc::new(EmbeddingService::new(
        &config.cache.embedding.url,
        &config.cache.embedding.model,
    ));

    let key_store = Arc::new(ApiKeyStore::new(&config.auth.environment));
    let budget = Arc::new(BudgetEnforcer::new(
        config.auth.global_monthly_token_budget,
        config.auth.global_monthly_cost_budget_usd,
    ));
    let rate_limiter = Arc::new(RateLimiter::new(redis_url));

    let sink: Arc<dyn LogSink> = match &config.logging.request_log_file {
        Some(path) => Arc::new(JsonlSink::new(path)),
        None => Arc::new(TracingSink),
    };
    let request_log = RequestLogger::new(sink);

    Ok(AppState {
        routing: Arc::new(RwLock::new(config.routing.config.clone())),
        config: Arc::new(config),
        registry,
        capabilities,
        router,
        breakers,
        chain,
        cache,
        cache_stats: Arc::new(CacheStats::new()),
        embedder,
        key_store,
        budget,
        rate_limiter,
        metrics: Arc::new(MetricsRegistry::new()),
        tracker: Arc::new(RequestTracker::new()),
        request_log,
    })
}

/// Starts the health probe loop and the request-log flusher.
pub async fn start_background_tasks(state: &AppState) {
    state
        .registry
        .clone()
        .start_health_check_loop(state.config.routing.health_check_interval)
        .await;
    state
        .request_log
        .clone()
        .start_flusher(state.config.logging.flush_interval)
        .await;
}

/// The full route table plus middleware.
pub fn build_router(state: AppState) -> Router {
    let admin = Router::new()
        .route(
            "/api/admin/keys",
            post(handlers::admin::create_key).get(handlers::admin::list_keys),
        )
        .route("/api/admin/keys/{key}", delete(handlers::admin::revoke_key))
        .route(
            "/api/admin/routing",
            get(handlers::admin::get_routing).put(handlers::admin::put_routing),
        )
        .layer(from_fn_with_state(state.clone(), admin_auth_middleware));

    Router::new()
        // OpenAI-compatible surface
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/embeddings", post(handlers::embeddings))
        .route("/v1/models", get(handlers::list_models))
        // Gateway surface
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::prometheus_metrics))
        .route("/api/providers", get(handlers::providers_status))
        .route("/api/cache/stats", get(handlers::cache_stats))
        .route("/api/cache/invalidate", post(handlers::cache_invalidate))
        .route("/api/circuit-breakers", get(handlers::circuit_breakers))
        .route("/api/budget", get(handlers::budget_status))
        .route("/api/analytics", get(handlers::analytics))
        .merge(admin)
        .layer(
            ServiceBuilder::new()
                .layer(from_fn_with_state(state.clone(), request_metadata_middleware))
                .layer(TimeoutLayer::new(state.config.server.timeout))
                .layer(DefaultBodyLimit::max(state.config.server.max_body_size)),
        )
        .with_state(state)
}

/// Convenience: state + router in one call.
pub async fn create_server(config: Config) -> anyhow::Result<(AppState, Router)> {
    let state = build_state(config)?;
    start_background_tasks(&state).await;
    Ok((state.clone(), build_router(state)))
}

/// Stops accepting work and drains: waits up to 10 s for active requests,
/// then stops the probe loop and flushes the request log.
pub async fn shutdown(state: &AppState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while state.tracker.active_count() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    if state.tracker.active_count() > 0 {
        tracing::warn!(
            active = state.tracker.active_count(),
            "drain deadline reached with requests still in flight"
        );
    }

    state.registry.stop_health_check_loop().await;
    state.request_log.shutdown().await;
}
