//! Metrics: label-keyed counters, a latency histogram, cache statistics,
//! and the in-memory request tracker behind `/api/analytics`.
//!
//! The `/metrics` endpoint renders the Prometheus text exposition by hand;
//! there is no client-library dependency, just counters in concurrent maps
//! and atomics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use switchboard_providers::circuit_breaker::{BreakerSnapshot, CircuitState};

/// Histogram bucket upper bounds, in seconds.
const LATENCY_BUCKETS_SECS: [f64; 9] = [0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

/// Completed-request ring capacity.
const COMPLETED_RING_CAP: usize = 10_000;

/// One request's worth of metric labels and measurements.
#[derive(Debug, Clone)]
pub struct MetricEvent {
    pub provider: String,
    pub model: String,
    pub status: u16,
    pub strategy: String,
    pub latency: Duration,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_usd: f64,
}

pub struct MetricsRegistry {
    requests: DashMap<(String, String, u16, String), u64>,
    tokens: DashMap<(String, String, String), u64>,
    latency_buckets: [AtomicU64; 10],
    latency_sum_micros: AtomicU64,
    latency_count: AtomicU64,
    cost_micro_usd: AtomicU64,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            requests: DashMap::new(),
            tokens: DashMap::new(),
            latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            latency_sum_micros: AtomicU64::new(0),
            latency_count: AtomicU64::new(0),
            cost_micro_usd: AtomicU64::new(0),
        }
    }

    pub fn record(&self, event: &MetricEvent) {
        *self
            .requests
            .entry((
                event.provider.clone(),
                event.model.clone(),
                event.status,
                event.strategy.clone(),
            ))
            .or_insert(0) += 1;

        if event.input_tokens > 0 {
            *self
                .tokens
                .entry((
                    "input".to_string(),
                    event.provider.clone(),
                    event.model.clone(),
                ))
                .or_insert(0) += event.input_tokens as u64;
        }
        if event.output_tokens > 0 {
            *self
                .tokens
                .entry((
                    "output".to_string(),
                    event.provider.clone(),
                    event.model.clone(),
                ))
                .or_insert(0) += event.output_tokens as u64;
        }

        let secs = event.latency.as_secs_f64();
        for (i, bound) in LATENCY_BUCKETS_SECS.iter().enumerate() {
            if secs <= *bound {
                self.latency_buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        // +Inf bucket.
        self.latency_buckets[LATENCY_BUCKETS_SECS.len()].fetch_add(1, Ordering::Relaxed);
        self.latency_sum_micros
            .fetch_add(event.latency.as_micros() as u64, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);

        self.cost_micro_usd
            .fetch_add((event.cost_usd * 1e6) as u64, Ordering::Relaxed);
    }

    /// Prometheus text exposition for everything the gateway tracks.
    pub fn render(
        &self,
        cache: &CacheStats,
        breakers: &HashMap<String, BreakerSnapshot>,
    ) -> String {
        let mut out = String::with_capacity(4096);

        out.push_str("# HELP gateway_requests_total Requests served, by provider/model/status/strategy.\n");
        out.push_str("# TYPE gateway_requests_total counter\n");
        let mut requests: Vec<_> = self
            .requests
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        requests.sort();
        for ((provider, model, status, strategy), count) in requests {
            out.push_str(&format!(
                "gateway_requests_total{{provider=\"{provider}\",model=\"{model}\",status=\"{status}\",strategy=\"{strategy}\"}} {count}\n"
            ));
        }

        out.push_str("# HELP gateway_tokens_total Tokens processed, by direction.\n");
        out.push_str("# TYPE gateway_tokens_total counter\n");
        let mut tokens: Vec<_> = self
            .tokens
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        tokens.sort();
        for ((direction, provider, model), count) in tokens {
            out.push_str(&format!(
                "gateway_tokens_total{{direction=\"{direction}\",provider=\"{provider}\",model=\"{model}\"}} {count}\n"
            ));
        }

        out.push_str("# HELP gateway_request_duration_seconds Request latency.\n");
        out.push_str("# TYPE gateway_request_duration_seconds histogram\n");
        for (i, bound) in LATENCY_BUCKETS_SECS.iter().enumerate() {
            out.push_str(&format!(
                "gateway_request_duration_seconds_bucket{{le=\"{bound}\"}} {}\n",
                self.latency_buckets[i].load(Ordering::Relaxed)
            ));
        }
        out.push_str(&format!(
            "gateway_request_duration_seconds_bucket{{le=\"+Inf\"}} {}\n",
            self.latency_buckets[LATENCY_BUCKETS_SECS.len()].load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "gateway_request_duration_seconds_sum {}\n",
            self.latency_sum_micros.load(Ordering::Relaxed) as f64 / 1e6
        ));
        out.push_str(&format!(
            "gateway_request_duration_seconds_count {}\n",
            self.latency_count.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP gateway_cost_usd_total Upstream spend in USD.\n");
        out.push_str("# TYPE gateway_cost_usd_total counter\n");
        out.push_str(&format!(
            "gateway_cost_usd_total {}\n",
            self.cost_micro_usd.load(Ordering::Relaxed) as f64 / 1e6
        ));

        let snapshot = cache.snapshot();
        out.push_str("# HELP gateway_cache_hits_total Semantic cache hits.\n");
        out.push_str("# TYPE gateway_cache_hits_total counter\n");
        out.push_str(&format!("gateway_cache_hits_total {}\n", snapshot.hits));
        out.push_str("# HELP gateway_cache_misses_total Semantic cache misses.\n");
        out.push_str("# TYPE gateway_cache_misses_total counter\n");
        out.push_str(&format!("gateway_cache_misses_total {}\n", snapshot.misses));

        out.push_str(
            "# HELP gateway_circuit_breaker_state Breaker state (0=closed, 1=half-open, 2=open).\n",
        );
        out.push_str("# TYPE gateway_circuit_breaker_state gauge\n");
        let mut providers: Vec<_> = breakers.iter().collect();
        providers.sort_by_key(|(id, _)| id.as_str());
        for (provider, snapshot) in providers {
            let value = match snapshot.state {
                CircuitState::Closed => 0,
                CircuitState::HalfOpen => 1,
                CircuitState::Open => 2,
            };
            out.push_str(&format!(
                "gateway_circuit_breaker_state{{provider=\"{provider}\"}} {value}\n"
            ));
        }

        out
    }
}

/// Hit/miss counters and estimated savings for the semantic cache.
#[derive(Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    savings_micro_usd: AtomicU64,
    hits_by_model: DashMap<String, u64>,
    misses_by_model: DashMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub estimated_savings_usd: f64,
    pub hits_by_model: HashMap<String, u64>,
    pub misses_by_model: HashMap<String, u64>,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self, model: &str, estimated_savings_usd: f64) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.savings_micro_usd
            .fetch_add((estimated_savings_usd * 1e6) as u64, Ordering::Relaxed);
        *self.hits_by_model.entry(model.to_string()).or_insert(0) += 1;
    }

    pub fn record_miss(&self, model: &str) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        *self.misses_by_model.entry(model.to_string()).or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStatsSnapshot {
            hits,
            misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            estimated_savings_usd: self.savings_micro_usd.load(Ordering::Relaxed) as f64 / 1e6,
            hits_by_model: self
                .hits_by_model
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            misses_by_model: self
                .misses_by_model
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
        }
    }
}

/// One finished request, as remembered by the tracker's bounded ring.
#[derive(Debug, Clone, Serialize)]
pub struct CompletedRequest {
    pub provider: String,
    pub model: String,
    pub status: u16,
    pub latency_ms: u64,
    pub cost_usd: f64,
    pub cache_hit: bool,
    pub finished_at: DateTime<Utc>,
}

/// Analytics summary for `/api/analytics`.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsReport {
    pub total_requests: u64,
    pub active_requests: usize,
    pub uptime_seconds: u64,
    pub requests_by_provider: HashMap<String, u64>,
    pub requests_by_model: HashMap<String, u64>,
    pub cost_last_hour_usd: f64,
    pub cost_last_24h_usd: f64,
    pub cost_total_usd: f64,
    pub latency_p50_ms: u64,
    pub latency_p95_ms: u64,
    pub latency_p99_ms: u64,
    pub cache_hit_ratio: f64,
}

pub struct RequestTracker {
    started_at: Instant,
    active: DashMap<String, Instant>,
    completed: Mutex<std::collections::VecDeque<CompletedRequest>>,
    total: AtomicU64,
    cost_total_micro_usd: AtomicU64,
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestTracker {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            active: DashMap::new(),
            completed: Mutex::new(std::collections::VecDeque::new()),
            total: AtomicU64::new(0),
            cost_total_micro_usd: AtomicU64::new(0),
        }
    }

    pub fn begin(&self, request_id: &str) {
        self.active.insert(request_id.to_string(), Instant::now());
    }

    pub fn end(&self, request_id: &str) {
        self.active.remove(request_id);
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn push(&self, record: CompletedRequest) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.cost_total_micro_usd
            .fetch_add((record.cost_usd * 1e6) as u64, Ordering::Relaxed);

        let mut ring = self.completed.lock().unwrap();
        ring.push_back(record);
        while ring.len() > COMPLETED_RING_CAP {
            ring.pop_front();
        }
    }

    pub fn analytics(&self) -> AnalyticsReport {
        let ring = self.completed.lock().unwrap();
        let now = Utc::now();

        let mut by_provider: HashMap<String, u64> = HashMap::new();
        let mut by_model: HashMap<String, u64> = HashMap::new();
        let mut latencies: Vec<u64> = Vec::with_capacity(ring.len());
        let mut cost_hour = 0.0;
        let mut cost_day = 0.0;
        let mut cache_hits = 0u64;

        for record in ring.iter() {
            *by_provider.entry(record.provider.clone()).or_insert(0) += 1;
            *by_model.entry(record.model.clone()).or_insert(0) += 1;
            latencies.push(record.latency_ms);
            if record.cache_hit {
                cache_hits += 1;
            }

            let age = now.signed_duration_since(record.finished_at);
            if age.num_hours() < 1 {
                cost_hour += record.cost_usd;
            }
            if age.num_hours() < 24 {
                cost_day += record.cost_usd;
            }
        }

        latencies.sort_unstable();
        let pct = |p: f64| -> u64 {
            if latencies.is_empty() {
                return 0;
            }
            let idx = ((p / 100.0) * latencies.len() as f64).ceil() as usize;
            latencies[idx.clamp(1, latencies.len()) - 1]
        };

        AnalyticsReport {
            total_requests: self.total.load(Ordering::Relaxed),
            active_requests: self.active.len(),
            uptime_seconds: self.uptime_seconds(),
            requests_by_provider: by_provider,
            requests_by_model: by_model,
            cost_last_hour_usd: cost_hour,
            cost_last_24h_usd: cost_day,
            cost_total_usd: self.cost_total_micro_usd.load(Ordering::Relaxed) as f64 / 1e6,
            latency_p50_ms: pct(50.0),
            latency_p95_ms: pct(95.0),
            latency_p99_ms: pct(99.0),
            cache_hit_ratio: if ring.is_empty() {
                0.0
            } else {
                cache_hits as f64 / ring.len() as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(provider: &str, status: u16, latency_ms: u64, cost: f64) -> MetricEvent {
        MetricEvent {
            provider: provider.to_string(),
            model: "m1".to_string(),
            status,
            strategy: "balanced".to_string(),
            latency: Duration::from_millis(latency_ms),
            input_tokens: 10,
            output_tokens: 20,
            cost_usd: cost,
        }
    }

    #[test]
    fn render_contains_all_metric_families() {
        let registry = MetricsRegistry::new();
        registry.record(&event("openai", 200, 300, 0.01));
        registry.record(&event("groq", 502, 50, 0.0));

        let cache = CacheStats::new();
        cache.record_hit("m1", 0.01);
        cache.record_miss("m1");

        let text = registry.render(&cache, &HashMap::new());
        assert!(text.contains(
            "gateway_requests_total{provider=\"openai\",model=\"m1\",status=\"200\",strategy=\"balanced\"} 1"
        ));
        assert!(text.contains("gateway_tokens_total{direction=\"input\",provider=\"openai\",model=\"m1\"} 10"));
        assert!(text.contains("gateway_request_duration_seconds_bucket{le=\"0.5\"} 2"));
        assert!(text.contains("gateway_request_duration_seconds_count 2"));
        assert!(text.contains("gateway_cache_hits_total 1"));
        assert!(text.contains("gateway_cache_misses_total 1"));
        assert!(text.contains("gateway_cost_usd_total 0.01"));
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let registry = MetricsRegistry::new();
        registry.record(&event("openai", 200, 50, 0.0)); // <=0.1
        registry.record(&event("openai", 200, 800, 0.0)); // <=1
        registry.record(&event("openai", 200, 40_000, 0.0)); // <=60

        let text = registry.render(&CacheStats::new(), &HashMap::new());
        assert!(text.contains("gateway_request_duration_seconds_bucket{le=\"0.1\"} 1"));
        assert!(text.contains("gateway_request_duration_seconds_bucket{le=\"1\"} 2"));
        assert!(text.contains("gateway_request_duration_seconds_bucket{le=\"60\"} 3"));
        assert!(text.contains("gateway_request_duration_seconds_bucket{le=\"+Inf\"} 3"));
    }

    #[test]
    fn cache_stats_aggregate_per_model() {
        let cache = CacheStats::new();
        cache.record_hit("a", 0.02);
        cache.record_hit("a", 0.03);
        cache.record_miss("b");

        let snapshot = cache.snapshot();
        assert_eq!(snapshot.hits, 2);
        assert_eq!(snapshot.misses, 1);
        assert!((snapshot.hit_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((snapshot.estimated_savings_usd - 0.05).abs() < 1e-9);
        assert_eq!(snapshot.hits_by_model["a"], 2);
        assert_eq!(snapshot.misses_by_model["b"], 1);
    }

    #[test]
    fn tracker_ring_is_bounded_and_percentiles_ordered() {
        let tracker = RequestTracker::new();
        for i in 0..(COMPLETED_RING_CAP + 500) {
            tracker.push(CompletedRequest {
                provider: "openai".to_string(),
                model: "m".to_string(),
                status: 200,
                latency_ms: (i % 1000) as u64,
                cost_usd: 0.001,
                cache_hit: i % 4 == 0,
                finished_at: Utc::now(),
            });
        }

        let report = tracker.analytics();
        assert_eq!(report.total_requests, (COMPLETED_RING_CAP + 500) as u64);
        assert!(report.latency_p50_ms <= report.latency_p95_ms);
        assert!(report.latency_p95_ms <= report.latency_p99_ms);
        assert!(report.cost_last_hour_usd > 0.0);
        assert!(report.cache_hit_ratio > 0.2 && report.cache_hit_ratio < 0.3);
    }

    #[test]
    fn active_count_follows_begin_end() {
        let tracker = RequestTracker::new();
        tracker.begin("a");
        tracker.begin("b");
        assert_eq!(tracker.active_count(), 2);
        tracker.end("a");
        assert_eq!(tracker.active_count(), 1);
    }
}
