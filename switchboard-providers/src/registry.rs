//! Provider registry and the background health probe loop.
//!
//! The registry owns every adapter, keeps an insertion-ordered table for
//! deterministic scans, and maintains a per-provider health snapshot that
//! the probe loop refreshes every interval. Probe failures mark a provider
//! unhealthy but are never fatal to the registry itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::models::ModelInfo;
use crate::providers::ProviderAdapter;

/// Default cadence of the health probe loop.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Last-known health and catalogue for one provider.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderStatus {
    pub healthy: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check: Option<DateTime<Utc>>,
    pub model_count: usize,
    #[serde(skip)]
    pub models: Vec<String>,
}

struct ProbeLoop {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct ProviderRegistry {
    adapters: Vec<Arc<dyn ProviderAdapter>>,
    status: DashMap<String, ProviderStatus>,
    probe: Mutex<Option<ProbeLoop>>,
}

impl ProviderRegistry {
    /// Builds a registry over the given adapters, preserving their order.
    /// Until the first probe, every provider is assumed healthy and its
    /// static model catalogue stands in for the live listing.
    pub fn new(adapters: Vec<Arc<dyn ProviderAdapter>>) -> Self {
        let status = DashMap::new();
        for adapter in &adapters {
            let models = adapter.supported_models();
            status.insert(
                adapter.id().to_string(),
                ProviderStatus {
                    healthy: true,
                    latency_ms: 0,
                    message: None,
                    last_check: None,
                    model_count: models.len(),
                    models,
                },
            );
        }

        Self {
            adapters,
            status,
            probe: Mutex::new(None),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.iter().find(|a| a.id() == id).cloned()
    }

    pub fn get_all(&self) -> &[Arc<dyn ProviderAdapter>] {
        &self.adapters
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Ids of providers whose last probe (or optimistic default) is healthy,
    /// in registration order. Callers snapshot this once per routing
    /// decision so a mid-decision health flip cannot split the view.
    pub fn healthy_ids(&self) -> Vec<String> {
        self.adapters
            .iter()
            .filter(|a| self.is_healthy(a.id()))
            .map(|a| a.id().to_string())
            .collect()
    }

    pub fn is_healthy(&self, id: &str) -> bool {
        self.status.get(id).map(|s| s.healthy).unwrap_or(false)
    }

    /// First provider (in registration order) whose last-known model list
    /// contains `model_id`.
    pub fn find_provider_for_model(&self, model_id: &str) -> Option<String> {
        self.adapters
            .iter()
            .find(|a| {
                self.status
                    .get(a.id())
                    .map(|s| s.models.iter().any(|m| m == model_id))
                    .unwrap_or(false)
            })
            .map(|a| a.id().to_string())
    }

    /// Union of all last-known model lists, deduplicated by
    /// `(provider, model)`.
    pub fn get_all_models(&self) -> Vec<(String, ModelInfo)> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for adapter in &self.adapters {
            if let Some(status) = self.status.get(adapter.id()) {
                for model in &status.models {
                    if seen.insert((adapter.id().to_string(), model.clone())) {
                        out.push((
                            adapter.id().to_string(),
                            ModelInfo {
                                id: model.clone(),
                                owned_by: adapter.id().to_string(),
                            },
                        ));
                    }
                }
            }
        }
        out
    }

    pub fn get_providers_status(&self) -> HashMap<String, ProviderStatus> {
        self.status
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Probes every adapter once, in parallel, and swaps in fresh snapshots.
    pub async fn probe_all(&self) {
        let probes = self.adapters.iter().map(|adapter| {
            let adapter = adapter.clone();
            async move {
                let report = adapter.health_check().await;
                let models = if report.healthy {
                    match adapter.list_models().await {
                        Ok(models) => Some(models.into_iter().map(|m| m.id).collect::<Vec<_>>()),
                        Err(e) => {
                            tracing::debug!(
                                provider = adapter.id(),
                                "model listing failed during probe: {e}"
                            );
                            None
                        }
                    }
                } else {
                    None
                };
                (adapter.id().to_string(), report, models)
            }
        });

        for (id, report, models) in futures::future::join_all(probes).await {
            let previous_models = self
                .status
                .get(&id)
                .map(|s| s.models.clone())
                .unwrap_or_default();
            let models = models.filter(|m| !m.is_empty()).unwrap_or(previous_models);

            if !report.healthy {
                tracing::warn!(
                    provider = %id,
                    message = report.message.as_deref().unwrap_or(""),
                    "provider unhealthy"
                );
            }

            self.status.insert(
                id,
                ProviderStatus {
                    healthy: report.healthy,
                    latency_ms: report.latency_ms,
                    message: report.message,
                    last_check: Some(Utc::now()),
                    model_count: models.len(),
                    models,
                },
            );
        }
    }

    /// Starts the periodic probe loop. Idempotent: a second call replaces
    /// the previous loop.
    pub async fn start_health_check_loop(self: Arc<Self>, interval: Duration) {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let registry = self.clone();

        let handle = tokio::spawn(async move {
            loop {
                registry.probe_all().await;
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        let mut probe = self.probe.lock().await;
        if let Some(previous) = probe.take() {
            let _ = previous.stop.send(true);
            previous.handle.abort();
        }
        *probe = Some(ProbeLoop {
            stop: stop_tx,
            handle,
        });
    }

    /// Stops the probe loop, waiting for any in-flight probe round.
    pub async fn stop_health_check_loop(&self) {
        let loop_state = self.probe.lock().await.take();
        if let Some(loop_state) = loop_state {
            let _ = loop_state.stop.send(true);
            let _ = loop_state.handle.await;
        }
    }

    /// Manual health override, used by operators and tests to force a
    /// provider in or out of rotation ahead of the next probe.
    pub fn set_health(&self, id: &str, healthy: bool) {
        if let Some(mut status) = self.status.get_mut(id) {
            status.healthy = healthy;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{create_adapter, AdapterConfig};

    fn registry_with(providers: &[&str]) -> Arc<ProviderRegistry> {
        let adapters = providers
            .iter()
            .map(|p| create_adapter(AdapterConfig::new(*p, "test-key")).unwrap())
            .collect();
        Arc::new(ProviderRegistry::new(adapters))
    }

    #[test]
    fn lookup_preserves_registration_order() {
        let registry = registry_with(&["openai", "groq", "ollama"]);
        let all: Vec<&str> = registry.get_all().iter().map(|a| a.id()).collect();
        assert_eq!(all, vec!["openai", "groq", "ollama"]);
        assert!(registry.get("groq").is_some());
        assert!(registry.get("anthropic").is_none());
    }

    #[test]
    fn find_provider_scans_in_order_first_hit_wins() {
        let registry = registry_with(&["openai", "groq"]);
        assert_eq!(
            registry.find_provider_for_model("gpt-4o").as_deref(),
            Some("openai")
        );
        assert_eq!(
            registry.find_provider_for_model("llama3-8b-8192").as_deref(),
            Some("groq")
        );
        assert!(registry.find_provider_for_model("no-such-model").is_none());
    }

    #[test]
    fn providers_start_optimistically_healthy() {
        let registry = registry_with(&["openai"]);
        assert!(registry.is_healthy("openai"));
        assert_eq!(registry.healthy_ids(), vec!["openai"]);
    }

    #[test]
    fn health_override_removes_from_healthy_set() {
        let registry = registry_with(&["openai", "groq"]);
        registry.set_health("openai", false);
        assert_eq!(registry.healthy_ids(), vec!["groq"]);
        assert!(!registry.is_healthy("openai"));
    }

    #[test]
    fn all_models_are_deduplicated() {
        let registry = registry_with(&["openai", "groq"]);
        let models = registry.get_all_models();
        let mut pairs: Vec<_> = models
            .iter()
            .map(|(p, m)| (p.clone(), m.id.clone()))
            .collect();
        let before = pairs.len();
        pairs.dedup();
        assert_eq!(before, pairs.len());
        assert!(before > 0);
    }

    #[tokio::test]
    async fn stop_without_start_is_harmless() {
        let registry = registry_with(&["ollama"]);
        registry.stop_health_check_loop().await;
    }
}
