//! Static catalogue of model profiles plus runtime latency tracking.
//!
//! Each profile records what a `(provider, model)` pair is good at, what it
//! costs, and how fast it has been recently. The router scores candidates
//! from this table; the request handler feeds observed latencies back in.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// Smoothing factor for the latency EMA: `new = 0.8*old + 0.2*observed`.
const LATENCY_EMA_ALPHA: f64 = 0.2;

/// Bounded per-profile latency history used for percentile reporting.
const LATENCY_HISTORY_CAP: usize = 100;

/// What a model can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    General,
    Code,
    Math,
    Creative,
    InstructionFollowing,
    Multilingual,
    Vision,
}

/// Profile of one `(provider, model)` pair.
#[derive(Debug, Clone, Serialize)]
pub struct ModelProfile {
    pub provider: String,
    pub model: String,
    pub capabilities: Vec<Capability>,
    /// 0..=100, higher is better.
    pub quality_score: f64,
    pub context_window: u32,
    pub cost_per_1k_input: f64,
    pub cost_per_1k_output: f64,
    /// EMA of observed completion latency.
    pub avg_latency_ms: f64,
    #[serde(skip)]
    latency_history: VecDeque<f64>,
}

impl ModelProfile {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: &str,
        model: &str,
        capabilities: &[Capability],
        quality_score: f64,
        context_window: u32,
        cost_per_1k_input: f64,
        cost_per_1k_output: f64,
        avg_latency_ms: f64,
    ) -> Self {
        Self {
            provider: provider.to_string(),
            model: model.to_string(),
            capabilities: capabilities.to_vec(),
            quality_score,
            context_window,
            cost_per_1k_input,
            cost_per_1k_output,
            avg_latency_ms,
            latency_history: VecDeque::new(),
        }
    }

    /// Mean of input and output $/1k, used by constraints and cost scoring.
    pub fn avg_cost_per_1k(&self) -> f64 {
        (self.cost_per_1k_input + self.cost_per_1k_output) / 2.0
    }

    pub fn has_capabilities(&self, required: &[Capability]) -> bool {
        required.iter().all(|c| self.capabilities.contains(c))
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct LatencyPercentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// The capability table. Profiles keep their insertion order, which doubles
/// as the router's tie-break order.
pub struct CapabilityMap {
    profiles: RwLock<Vec<ModelProfile>>,
    aliases: RwLock<HashMap<String, String>>,
}

impl Default for CapabilityMap {
    fn default() -> Self {
        Self::with_default_profiles()
    }
}

impl CapabilityMap {
    pub fn empty() -> Self {
        Self {
            profiles: RwLock::new(Vec::new()),
            aliases: RwLock::new(HashMap::new()),
        }
    }

    /// Seeds profiles for every supported provider.
    pub fn with_default_profiles() -> Self {
        use Capability::*;

        let all = [
            General,
            Code,
            Math,
            Creative,
            InstructionFollowing,
            Multilingual,
            Vision,
        ];
        let profiles = vec![
            ModelProfile::new("openai", "gpt-4o", &all, 93.0, 128_000, 0.0025, 0.01, 1200.0),
            ModelProfile::new(
                "openai",
                "gpt-4o-mini",
                &[General, Code, Math, InstructionFollowing, Multilingual],
                82.0,
                128_000,
                0.00015,
                0.0006,
                800.0,
            ),
            ModelProfile::new(
                "anthropic",
                "claude-opus-4-20250514",
                &all,
                96.0,
                200_000,
                0.015,
                0.075,
                2500.0,
            ),
            ModelProfile::new(
                "anthropic",
                "claude-3-5-sonnet-20241022",
                &all,
                92.0,
                200_000,
                0.003,
                0.015,
                1400.0,
            ),
            ModelProfile::new(
                "anthropic",
                "claude-3-5-haiku-20241022",
                &[General, Code, InstructionFollowing, Multilingual],
                84.0,
                200_000,
                0.0008,
                0.004,
                700.0,
            ),
            ModelProfile::new(
                "groq",
                "llama3-70b-8192",
                &[General, Code, Math, InstructionFollowing],
                85.0,
                8_192,
                0.00059,
                0.00079,
                400.0,
            ),
            ModelProfile::new(
                "groq",
                "llama3-8b-8192",
                &[General, InstructionFollowing],
                74.0,
                8_192,
                0.00005,
                0.00008,
                250.0,
            ),
            ModelProfile::new(
                "together",
                "meta-llama/Llama-3-70b-chat-hf",
                &[General, Code, Math, InstructionFollowing],
                85.0,
                8_192,
                0.0009,
                0.0009,
                900.0,
            ),
            ModelProfile::new(
                "together",
                "meta-llama/Llama-3-8b-chat-hf",
                &[General, InstructionFollowing],
                73.0,
                8_192,
                0.0002,
                0.0002,
                500.0,
            ),
            ModelProfile::new(
                "ollama",
                "llama3",
                &[General, Code, InstructionFollowing],
                72.0,
                8_192,
                0.0,
                0.0,
                1800.0,
            ),
            ModelProfile::new(
                "ollama",
                "llama3:70b",
                &[General, Code, Math, InstructionFollowing],
                83.0,
                8_192,
                0.0,
                0.0,
                4000.0,
            ),
        ];

        Self {
            profiles: RwLock::new(profiles),
            aliases: RwLock::new(HashMap::new()),
        }
    }

    /// Registers an additional profile at the end of the table.
    pub fn insert_profile(&self, profile: ModelProfile) {
        self.profiles.write().unwrap().push(profile);
    }

    pub fn get_profile(&self, provider: &str, model: &str) -> Option<ModelProfile> {
        self.profiles
            .read()
            .unwrap()
            .iter()
            .find(|p| p.provider == provider && p.model == model)
            .cloned()
    }

    pub fn all_profiles(&self) -> Vec<ModelProfile> {
        self.profiles.read().unwrap().clone()
    }

    pub fn profiles_by_capability(&self, capability: Capability) -> Vec<ModelProfile> {
        self.profiles
            .read()
            .unwrap()
            .iter()
            .filter(|p| p.capabilities.contains(&capability))
            .cloned()
            .collect()
    }

    pub fn profiles_by_provider(&self, provider: &str) -> Vec<ModelProfile> {
        self.profiles
            .read()
            .unwrap()
            .iter()
            .filter(|p| p.provider == provider)
            .cloned()
            .collect()
    }

    /// Folds an observed completion latency into the profile's EMA and
    /// bounded history.
    pub fn update_latency(&self, provider: &str, model: &str, observed_ms: f64) {
        let mut profiles = self.profiles.write().unwrap();
        if let Some(profile) = profiles
            .iter_mut()
            .find(|p| p.provider == provider && p.model == model)
        {
            profile.avg_latency_ms =
                (1.0 - LATENCY_EMA_ALPHA) * profile.avg_latency_ms + LATENCY_EMA_ALPHA * observed_ms;
            profile.latency_history.push_back(observed_ms);
            while profile.latency_history.len() > LATENCY_HISTORY_CAP {
                profile.latency_history.pop_front();
            }
        }
    }

    /// Nearest-rank percentiles over the stored history; `None` until at
    /// least one observation exists.
    pub fn latency_percentiles(&self, provider: &str, model: &str) -> Option<LatencyPercentiles> {
        let profiles = self.profiles.read().unwrap();
        let profile = profiles
            .iter()
            .find(|p| p.provider == provider && p.model == model)?;
        if profile.latency_history.is_empty() {
            return None;
        }

        let mut sorted: Vec<f64> = profile.latency_history.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());

        let rank = |p: f64| -> f64 {
            let n = sorted.len();
            let idx = ((p / 100.0) * n as f64).ceil() as usize;
            sorted[idx.clamp(1, n) - 1]
        };

        Some(LatencyPercentiles {
            p50: rank(50.0),
            p95: rank(95.0),
            p99: rank(99.0),
        })
    }

    pub fn add_alias(&self, alias: impl Into<String>, model: impl Into<String>) {
        self.aliases
            .write()
            .unwrap()
            .insert(alias.into(), model.into());
    }

    /// Resolves a model alias one hop; unknown names pass through.
    pub fn resolve_alias(&self, name: &str) -> String {
        self.aliases
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_blends_observation_in() {
        let map = CapabilityMap::with_default_profiles();
        let before = map.get_profile("groq", "llama3-70b-8192").unwrap();
        map.update_latency("groq", "llama3-70b-8192", 1000.0);
        let after = map.get_profile("groq", "llama3-70b-8192").unwrap();

        let expected = 0.8 * before.avg_latency_ms + 0.2 * 1000.0;
        assert!((after.avg_latency_ms - expected).abs() < 1e-9);
    }

    #[test]
    fn latency_history_is_bounded() {
        let map = CapabilityMap::with_default_profiles();
        for i in 0..250 {
            map.update_latency("openai", "gpt-4o", i as f64);
        }
        let pct = map.latency_percentiles("openai", "gpt-4o").unwrap();
        // Only the last 100 observations (150..250) remain.
        assert!(pct.p50 >= 150.0);
        assert!(pct.p99 <= 249.0);
    }

    #[test]
    fn percentiles_order_is_monotonic() {
        let map = CapabilityMap::with_default_profiles();
        for v in [10.0, 20.0, 30.0, 40.0, 1000.0] {
            map.update_latency("ollama", "llama3", v);
        }
        let pct = map.latency_percentiles("ollama", "llama3").unwrap();
        assert!(pct.p50 <= pct.p95);
        assert!(pct.p95 <= pct.p99);
        assert_eq!(pct.p99, 1000.0);
    }

    #[test]
    fn alias_resolution_is_single_hop() {
        let map = CapabilityMap::with_default_profiles();
        map.add_alias("gpt4", "gpt-4o");
        map.add_alias("best", "gpt4");
        assert_eq!(map.resolve_alias("gpt4"), "gpt-4o");
        // One hop only: "best" resolves to "gpt4", not to "gpt-4o".
        assert_eq!(map.resolve_alias("best"), "gpt4");
        assert_eq!(map.resolve_alias("unknown"), "unknown");
    }

    #[test]
    fn capability_filter_matches_subsets() {
        let map = CapabilityMap::with_default_profiles();
        let vision = map.profiles_by_capability(Capability::Vision);
        assert!(vision.iter().all(|p| p.capabilities.contains(&Capability::Vision)));
        assert!(!vision.is_empty());

        let profile = map.get_profile("groq", "llama3-8b-8192").unwrap();
        assert!(profile.has_capabilities(&[Capability::General]));
        assert!(!profile.has_capabilities(&[Capability::Vision]));
    }
}
