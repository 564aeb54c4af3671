//! Gateway configuration.
//!
//! Settings load from a TOML file, then environment variables override the
//! file, then the result is validated. Providers are registered only when
//! credentials exist: a missing API key means the adapter simply is not
//! added, and a missing Redis URL disables the semantic cache and rate
//! limiter while requests keep flowing.
//!
//! Environment variables:
//!
//! - `GATEWAY_HOST` / `GATEWAY_PORT` - listener address
//! - `GATEWAY_ADMIN_KEY` - bearer key for the admin API
//! - `GATEWAY_DEFAULT_STRATEGY` - cost | quality | latency | balanced
//! - `GATEWAY_GLOBAL_TOKEN_BUDGET` / `GATEWAY_GLOBAL_COST_BUDGET` - process-wide caps
//! - `OPENAI_API_KEY`, `ANTHROPIC_API_KEY`, `GROQ_API_KEY`, `TOGETHER_API_KEY`
//!   - register the corresponding provider
//! - `OLLAMA_URL` - register the local provider at this endpoint
//! - `REDIS_URL` - shared key-value store for cache and rate limits

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use switchboard_providers::circuit_breaker::CircuitBreakerConfig;
use switchboard_providers::common::duration_serde;
use switchboard_providers::providers::AdapterConfig;
use switchboard_providers::router::{RoutingConfig, RoutingStrategy};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    /// Adapter configurations keyed by provider id.
    #[serde(default)]
    pub providers: HashMap<String, AdapterConfig>,
    #[serde(default)]
    pub routing: RoutingSettings,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub auth: AuthSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Whole-request timeout at the HTTP layer.
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            timeout: Duration::from_secs(180),
            max_body_size: 2 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingSettings {
    #[serde(flatten)]
    pub config: RoutingConfig,
    #[serde(
        default = "default_health_check_interval",
        with = "duration_serde"
    )]
    pub health_check_interval: Duration,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            config: RoutingConfig::default(),
            health_check_interval: default_health_check_interval(),
        }
    }
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(30)
}

/// Semantic cache and embedding endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    pub enabled: bool,
    /// Cosine similarity required for a hit.
    pub similarity_threshold: f32,
    pub ttl_seconds: u64,
    pub max_entries: usize,
    /// Shared key-value store; cache and rate limits disable without it.
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default)]
    pub embedding: EmbeddingSettings,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            similarity_threshold: 0.95,
            ttl_seconds: 3600,
            max_entries: 10_000,
            redis_url: None,
            embedding: EmbeddingSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingSettings {
    pub url: String,
    pub model: String,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:11434".to_string(),
            model: "nomic-embed-text".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSettings {
    /// Bearer key protecting `/api/admin/*`. Admin API is disabled when
    /// absent.
    #[serde(default)]
    pub admin_key: Option<String>,
    /// Environment tag baked into minted key ids (`gw-{env}-...`).
    pub environment: String,
    #[serde(default)]
    pub global_monthly_token_budget: Option<u64>,
    #[serde(default)]
    pub global_monthly_cost_budget_usd: Option<f64>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            admin_key: None,
            environment: "dev".to_string(),
            global_monthly_token_budget: None,
            global_monthly_cost_budget_usd: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
    /// Request-log sink file (JSON lines); logs go to tracing when absent.
    #[serde(default)]
    pub request_log_file: Option<String>,
    #[serde(
        default = "default_flush_interval",
        with = "duration_serde"
    )]
    pub flush_interval: Duration,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            request_log_file: None,
            flush_interval: default_flush_interval(),
        }
    }
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(5)
}

impl Config {
    /// Loads from `path` when it exists, otherwise starts from defaults;
    /// then applies environment overrides and validates.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let mut config = if std::path::Path::new(path).exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            tracing::info!("config file {path} not found, using defaults + environment");
            Config::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Ok(host) = env::var("GATEWAY_HOST") {
            if !host.is_empty() {
                self.server.host = host;
            }
        }
        if let Ok(port_str) = env::var("GATEWAY_PORT") {
            let port: u16 = port_str
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid GATEWAY_PORT: {port_str}"))?;
            self.server.port = port;
        }

        if let Ok(key) = env::var("GATEWAY_ADMIN_KEY") {
            if !key.is_empty() {
                self.auth.admin_key = Some(key);
            }
        }
        if let Ok(strategy) = env::var("GATEWAY_DEFAULT_STRATEGY") {
            self.routing.config.default_strategy = match strategy.as_str() {
                "cost" => RoutingStrategy::Cost,
                "quality" => RoutingStrategy::Quality,
                "latency" => RoutingStrategy::Latency,
                "balanced" => RoutingStrategy::Balanced,
                other => {
                    return Err(anyhow::anyhow!("invalid GATEWAY_DEFAULT_STRATEGY: {other}"))
                }
            };
        }
        if let Ok(budget) = env::var("GATEWAY_GLOBAL_TOKEN_BUDGET") {
            self.auth.global_monthly_token_budget = Some(
                budget
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid GATEWAY_GLOBAL_TOKEN_BUDGET"))?,
            );
        }
        if let Ok(budget) = env::var("GATEWAY_GLOBAL_COST_BUDGET") {
            self.auth.global_monthly_cost_budget_usd = Some(
                budget
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid GATEWAY_GLOBAL_COST_BUDGET"))?,
            );
        }

        if let Ok(url) = env::var("REDIS_URL") {
            if !url.is_empty() {
                self.cache.redis_url = Some(url);
            }
        }

        // A provider joins the registry iff credentials exist for it.
        for provider in ["openai", "anthropic", "groq", "together"] {
            let env_key = format!("{}_API_KEY", provider.to_uppercase());
            if let Ok(api_key) = env::var(&env_key) {
                if !api_key.is_empty() {
                    self.providers
                        .entry(provider.to_string())
                        .or_insert_with(|| AdapterConfig::new(provider, ""))
                        .api_key = api_key;
                }
            }
        }
        if let Ok(url) = env::var("OLLAMA_URL") {
            if !url.is_empty() {
                self.providers
                    .entry("ollama".to_string())
                    .or_insert_with(|| AdapterConfig::new("ollama", ""))
                    .base_url = Some(url.clone());
                self.cache.embedding.url = url;
            }
        }

        // Keep each adapter's provider field in sync with its map key.
        for (name, provider) in self.providers.iter_mut() {
            provider.provider = name.clone();
        }

        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.host.is_empty() {
            return Err(anyhow::anyhow!("server host cannot be empty"));
        }
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("server port must be between 1 and 65535"));
        }

        for (name, provider) in &self.providers {
            if let Some(base_url) = &provider.base_url {
                if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
                    return Err(anyhow::anyhow!(
                        "invalid base URL for provider {name}: {base_url}"
                    ));
                }
            }
            if provider.timeout.as_secs() == 0 {
                return Err(anyhow::anyhow!("provider {name} timeout cannot be 0"));
            }
        }

        if self.routing.health_check_interval.as_secs() == 0 {
            return Err(anyhow::anyhow!("health check interval cannot be 0"));
        }

        if self.cache.enabled {
            if !(0.0..=1.0).contains(&self.cache.similarity_threshold) {
                return Err(anyhow::anyhow!(
                    "cache similarity threshold must be within [0, 1]"
                ));
            }
            if self.cache.ttl_seconds == 0 {
                return Err(anyhow::anyhow!("cache TTL cannot be 0 when cache is enabled"));
            }
            if self.cache.max_entries == 0 {
                return Err(anyhow::anyhow!(
                    "cache max entries cannot be 0 when cache is enabled"
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn toml_round_trip_with_routing_section() {
        let toml_src = r#"
            [server]
            host = "0.0.0.0"
            port = 8080
            timeout = "60s"
            max_body_size = 1048576

            [routing]
            default_strategy = "cost"
            fallback_chain = ["openai", "groq"]
            health_check_interval = "15s"

            [routing.constraints]
            prefer_local = true

            [cache]
            enabled = true
            similarity_threshold = 0.9
            ttl_seconds = 600
            max_entries = 100

            [providers.groq]
            provider = "groq"
            api_key = "gk-test"
        "#;
        let config: Config = toml::from_str(toml_src).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(
            config.routing.config.default_strategy,
            RoutingStrategy::Cost
        );
        assert_eq!(config.routing.config.fallback_chain, vec!["openai", "groq"]);
        assert!(config.routing.config.constraints.prefer_local);
        assert_eq!(
            config.routing.health_check_interval,
            Duration::from_secs(15)
        );
        assert_eq!(config.cache.similarity_threshold, 0.9);
        assert_eq!(config.providers["groq"].api_key, "gk-test");
        config.validate().unwrap();
    }

    #[test]
    fn bad_similarity_threshold_is_rejected() {
        let mut config = Config::default();
        config.cache.similarity_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_provider_url_is_rejected() {
        let mut config = Config::default();
        config.providers.insert(
            "openai".to_string(),
            AdapterConfig::new("openai", "k").with_base_url("ftp://wrong"),
        );
        assert!(config.validate().is_err());
    }
}
