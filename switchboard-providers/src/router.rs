//! Strategy-weighted model routing.
//!
//! The router turns a request into a [`RoutingDecision`] by combining the
//! prompt classification, the capability map, and the registry's health
//! snapshot. Each strategy is a fixed weighting over cost, quality, and
//! latency; candidates are profiles of healthy providers that cover the
//! required capabilities and satisfy the configured constraints.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::capability::{Capability, CapabilityMap, ModelProfile};
use crate::classifier::{classify, Complexity};
use crate::error::RouteError;
use crate::models::{is_virtual_model, ChatRequest};
use crate::registry::ProviderRegistry;

/// Cost above which the cost score bottoms out, $/1k tokens.
const COST_CEILING_PER_1K: f64 = 0.10;

/// Latency above which the latency score bottoms out.
const LATENCY_CEILING_MS: f64 = 5000.0;

/// Local candidates win if they reach this fraction of the best score.
const LOCAL_FIRST_RATIO: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingStrategy {
    Cost,
    Quality,
    Latency,
    #[default]
    Balanced,
}

/// Weighting over the three scoring factors; each preset sums to 1.
#[derive(Debug, Clone, Copy)]
pub struct StrategyWeights {
    pub cost: f64,
    pub quality: f64,
    pub latency: f64,
}

impl RoutingStrategy {
    pub fn weights(&self) -> StrategyWeights {
        match self {
            RoutingStrategy::Balanced => StrategyWeights {
                cost: 0.40,
                quality: 0.35,
                latency: 0.25,
            },
            RoutingStrategy::Cost => StrategyWeights {
                cost: 0.80,
                quality: 0.10,
                latency: 0.10,
            },
            RoutingStrategy::Quality => StrategyWeights {
                cost: 0.05,
                quality: 0.85,
                latency: 0.10,
            },
            RoutingStrategy::Latency => StrategyWeights {
                cost: 0.10,
                quality: 0.10,
                latency: 0.80,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingStrategy::Cost => "cost",
            RoutingStrategy::Quality => "quality",
            RoutingStrategy::Latency => "latency",
            RoutingStrategy::Balanced => "balanced",
        }
    }
}

/// Hard limits applied before scoring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConstraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost_per_1k: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_latency_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_capabilities: Option<Vec<Capability>>,
    /// Bias towards the local provider when it scores close enough.
    #[serde(default)]
    pub prefer_local: bool,
}

/// Routing configuration; runtime-mutable through the admin API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub default_strategy: RoutingStrategy,
    #[serde(default)]
    pub constraints: RoutingConstraints,
    /// Providers tried, in order, after the primary fails.
    #[serde(default)]
    pub fallback_chain: Vec<String>,
}

/// The router's answer for one request.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    pub provider: String,
    pub model_id: String,
    pub strategy: RoutingStrategy,
    pub score: f64,
    pub reasoning: String,
}

pub struct ModelRouter {
    registry: Arc<ProviderRegistry>,
    capabilities: Arc<CapabilityMap>,
}

struct ScoredCandidate {
    profile: ModelProfile,
    score: f64,
}

impl ModelRouter {
    pub fn new(registry: Arc<ProviderRegistry>, capabilities: Arc<CapabilityMap>) -> Self {
        Self {
            registry,
            capabilities,
        }
    }

    pub fn route(
        &self,
        request: &ChatRequest,
        config: &RoutingConfig,
    ) -> Result<RoutingDecision, RouteError> {
        let strategy = request.routing_strategy.unwrap_or(config.default_strategy);
        let weights = strategy.weights();

        // Health is snapshotted once so a flip mid-decision cannot produce
        // a decision that is immediately stale.
        let healthy = self.registry.healthy_ids();
        if healthy.is_empty() {
            return Err(RouteError::NoProviders);
        }

        let requested_model = self.capabilities.resolve_alias(&request.model);

        // Direct requests for a concrete model bypass scoring entirely. A
        // model no provider catalogues at all is a hard miss; a known model
        // whose provider is unhealthy falls through to scoring instead.
        if !is_virtual_model(&requested_model) {
            match self.registry.find_provider_for_model(&requested_model) {
                Some(provider) if healthy.contains(&provider) => {
                    return Ok(RoutingDecision {
                        provider,
                        model_id: requested_model,
                        strategy,
                        score: 1.0,
                        reasoning: "Direct model request".to_string(),
                    });
                }
                Some(_) => {}
                None => {
                    return Err(RouteError::ModelNotFound {
                        model: requested_model,
                    })
                }
            }
        }

        let classification = classify(&request.messages);
        let mut required = classification.required_capabilities.clone();
        if let Some(extra) = &config.constraints.required_capabilities {
            for cap in extra {
                if !required.contains(cap) {
                    required.push(*cap);
                }
            }
        }

        let mut candidates: Vec<ScoredCandidate> = self
            .capabilities
            .all_profiles()
            .into_iter()
            .filter(|p| healthy.contains(&p.provider))
            .filter(|p| p.has_capabilities(&required))
            .filter(|p| {
                config
                    .constraints
                    .max_cost_per_1k
                    .map(|max| p.avg_cost_per_1k() <= max)
                    .unwrap_or(true)
            })
            .filter(|p| {
                config
                    .constraints
                    .max_latency_ms
                    .map(|max| p.avg_latency_ms <= max)
                    .unwrap_or(true)
            })
            .map(|profile| {
                let score = score_profile(&profile, &weights, classification.complexity);
                ScoredCandidate { profile, score }
            })
            .collect();

        if candidates.is_empty() {
            // Nothing satisfies the requirements; degrade to the first
            // healthy provider rather than failing the request.
            let provider = healthy[0].clone();
            let model_id = self
                .registry
                .get(&provider)
                .map(|a| a.resolve_model(&request.model))
                .unwrap_or_else(|| request.model.clone());
            return Ok(RoutingDecision {
                provider,
                model_id,
                strategy,
                score: 0.0,
                reasoning: format!(
                    "No candidate satisfied requirements ({}); using first healthy provider",
                    classification.reasoning
                ),
            });
        }

        if let Some(preferred) = &request.prefer_provider {
            let preferred_candidates: Vec<&ScoredCandidate> = candidates
                .iter()
                .filter(|c| &c.profile.provider == preferred)
                .collect();
            if !preferred_candidates.is_empty() && healthy.contains(preferred) {
                let best = preferred_candidates
                    .iter()
                    .max_by(|a, b| a.score.partial_cmp(&b.score).unwrap())
                    .unwrap();
                return Ok(RoutingDecision {
                    provider: best.profile.provider.clone(),
                    model_id: best.profile.model.clone(),
                    strategy,
                    score: best.score,
                    reasoning: format!(
                        "Preferred provider {preferred}; {}",
                        classification.reasoning
                    ),
                });
            }
        }

        // Stable sort keeps capability-map insertion order as the tie-break.
        candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
        let best_score = candidates[0].score;

        if config.constraints.prefer_local {
            if let Some(local) = candidates
                .iter()
                .find(|c| c.profile.provider == "ollama" && c.score >= LOCAL_FIRST_RATIO * best_score)
            {
                return Ok(RoutingDecision {
                    provider: local.profile.provider.clone(),
                    model_id: local.profile.model.clone(),
                    strategy,
                    score: local.score,
                    reasoning: format!(
                        "Local-first: {} scored {:.3} (best {:.3}); {}",
                        local.profile.model, local.score, best_score, classification.reasoning
                    ),
                });
            }
        }

        let winner = &candidates[0];
        Ok(RoutingDecision {
            provider: winner.profile.provider.clone(),
            model_id: winner.profile.model.clone(),
            strategy,
            score: winner.score,
            reasoning: format!(
                "Best {} score {:.3} among {} candidates; {}",
                strategy.as_str(),
                winner.score,
                candidates.len(),
                classification.reasoning
            ),
        })
    }
}

fn score_profile(
    profile: &ModelProfile,
    weights: &StrategyWeights,
    complexity: Complexity,
) -> f64 {
    let cost_score = (1.0 - profile.avg_cost_per_1k() / COST_CEILING_PER_1K).max(0.0);

    let mut quality_score = profile.quality_score / 100.0;
    if complexity == Complexity::Complex {
        // Flatten the quality curve so strong models separate less near
        // the top and weak models are penalized harder.
        quality_score = quality_score.powf(0.8);
    }

    let latency_score = (1.0 - profile.avg_latency_ms / LATENCY_CEILING_MS).max(0.0);

    weights.cost * cost_score + weights.quality * quality_score + weights.latency * latency_score
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{create_adapter, AdapterConfig};

    fn router_with(providers: &[&str]) -> (ModelRouter, Arc<ProviderRegistry>) {
        let adapters = providers
            .iter()
            .map(|p| create_adapter(AdapterConfig::new(*p, "test-key")).unwrap())
            .collect();
        let registry = Arc::new(ProviderRegistry::new(adapters));
        let capabilities = Arc::new(CapabilityMap::with_default_profiles());
        (
            ModelRouter::new(registry.clone(), capabilities),
            registry,
        )
    }

    fn request(model: &str, content: &str) -> ChatRequest {
        ChatRequest {
            model: model.to_string(),
            messages: vec![crate::models::Message::user(content)],
            ..Default::default()
        }
    }

    #[test]
    fn preset_weights_sum_to_one() {
        for strategy in [
            RoutingStrategy::Cost,
            RoutingStrategy::Quality,
            RoutingStrategy::Latency,
            RoutingStrategy::Balanced,
        ] {
            let w = strategy.weights();
            assert!((w.cost + w.quality + w.latency - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn direct_concrete_model_bypasses_scoring() {
        let (router, _) = router_with(&["openai", "groq"]);
        let decision = router
            .route(&request("gpt-4o", "Hi"), &RoutingConfig::default())
            .unwrap();
        assert_eq!(decision.provider, "openai");
        assert_eq!(decision.model_id, "gpt-4o");
        assert_eq!(decision.score, 1.0);
        assert_eq!(decision.reasoning, "Direct model request");
    }

    #[test]
    fn unhealthy_provider_is_never_chosen_directly() {
        let (router, registry) = router_with(&["openai", "groq"]);
        registry.set_health("openai", false);
        let decision = router
            .route(&request("gpt-4o", "Hi"), &RoutingConfig::default())
            .unwrap();
        // Direct bypass is skipped; scoring lands on a groq profile.
        assert_eq!(decision.provider, "groq");
    }

    #[test]
    fn uncatalogued_concrete_model_is_not_found() {
        let (router, _) = router_with(&["openai", "groq"]);
        let err = router
            .route(&request("no-such-model-v9", "Hi"), &RoutingConfig::default())
            .unwrap_err();
        assert!(matches!(err, RouteError::ModelNotFound { .. }));
    }

    #[test]
    fn no_healthy_providers_is_an_error() {
        let (router, registry) = router_with(&["groq"]);
        registry.set_health("groq", false);
        let err = router
            .route(&request("auto", "Hi"), &RoutingConfig::default())
            .unwrap_err();
        assert!(matches!(err, RouteError::NoProviders));
    }

    #[test]
    fn scores_stay_in_unit_interval() {
        let (router, _) = router_with(&["openai", "anthropic", "groq", "together", "ollama"]);
        for strategy in [
            RoutingStrategy::Cost,
            RoutingStrategy::Quality,
            RoutingStrategy::Latency,
            RoutingStrategy::Balanced,
        ] {
            let mut req = request("auto", "Explain the borrow checker");
            req.routing_strategy = Some(strategy);
            let decision = router.route(&req, &RoutingConfig::default()).unwrap();
            assert!(decision.score >= 0.0 && decision.score <= 1.0);
        }
    }

    #[test]
    fn local_first_bias_picks_ollama_within_ratio() {
        let (router, _) = router_with(&["groq", "ollama"]);
        let config = RoutingConfig {
            constraints: RoutingConstraints {
                prefer_local: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let decision = router.route(&request("auto", "Hello"), &config).unwrap();
        assert_eq!(decision.provider, "ollama");
        assert!(decision.reasoning.contains("Local-first"));
    }

    #[test]
    fn candidates_must_cover_required_capabilities() {
        let (router, _) = router_with(&["groq"]);
        // Code-flavoured prompt: groq's 8b profile lacks the code tag, so
        // only the 70b profile qualifies.
        let decision = router
            .route(
                &request("auto", "Please debug this ```rust fn main() {}``` and refactor it"),
                &RoutingConfig::default(),
            )
            .unwrap();
        assert_eq!(decision.model_id, "llama3-70b-8192");
    }

    #[test]
    fn prefer_provider_restricts_candidates() {
        let (router, _) = router_with(&["openai", "groq"]);
        let mut req = request("auto", "Hello");
        req.prefer_provider = Some("openai".to_string());
        let decision = router.route(&req, &RoutingConfig::default()).unwrap();
        assert_eq!(decision.provider, "openai");
        assert!(decision.reasoning.contains("Preferred provider"));
    }

    #[test]
    fn impossible_constraints_fall_back_to_first_healthy() {
        let (router, _) = router_with(&["groq", "ollama"]);
        let config = RoutingConfig {
            constraints: RoutingConstraints {
                max_latency_ms: Some(1.0),
                ..Default::default()
            },
            ..Default::default()
        };
        let decision = router.route(&request("auto", "Hello"), &config).unwrap();
        assert_eq!(decision.provider, "groq");
        assert_eq!(decision.score, 0.0);
    }

    #[test]
    fn alias_resolves_before_direct_match() {
        let adapters = vec![create_adapter(AdapterConfig::new("openai", "k")).unwrap()];
        let registry = Arc::new(ProviderRegistry::new(adapters));
        let capabilities = Arc::new(CapabilityMap::with_default_profiles());
        capabilities.add_alias("gpt4", "gpt-4o");
        let router = ModelRouter::new(registry, capabilities);

        let decision = router
            .route(&request("gpt4", "Hi"), &RoutingConfig::default())
            .unwrap();
        assert_eq!(decision.model_id, "gpt-4o");
        assert_eq!(decision.score, 1.0);
    }
}
