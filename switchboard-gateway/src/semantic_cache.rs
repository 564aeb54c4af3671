//! Embedding service and the semantic response cache.
//!
//! The cache stores prior chat responses keyed by an embedding of the
//! prompt; a new request whose embedding is close enough (cosine similarity
//! at or above the configured threshold) is served from the cache without an
//! upstream call. Entries live in the shared key-value store with a TTL and
//! a live-id set; every cache failure is swallowed so the request path never
//! depends on the store being up.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use switchboard_providers::models::{is_virtual_model, ChatResponse};

/// Dimension of the deterministic fallback embedding.
const FALLBACK_DIMENSIONS: usize = 384;

/// Deadline for the external embedding endpoint.
const EMBEDDING_DEADLINE: Duration = Duration::from_secs(10);

const ENTRY_KEY_PREFIX: &str = "semcache:entry:";
const LIVE_SET_KEY: &str = "semcache:ids";

/// Client for the external embedding endpoint with a deterministic local
/// fallback, so `embed` never fails.
pub struct EmbeddingService {
    http: reqwest::Client,
    url: String,
    model: String,
}

#[derive(Serialize)]
struct EmbeddingRequestBody<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponseBody {
    embedding: Vec<f32>,
}

impl EmbeddingService {
    pub fn new(url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
            model: model.into(),
        }
    }

    /// Embeds `text`, falling back to the local pseudo-embedding when the
    /// endpoint is unreachable, slow, or returns garbage.
    pub async fn embed(&self, text: &str) -> Vec<f32> {
        match self.embed_remote(text).await {
            Ok(embedding) if !embedding.is_empty() => embedding,
            Ok(_) => {
                tracing::debug!("embedding endpoint returned an empty vector, using fallback");
                pseudo_embedding(text)
            }
            Err(e) => {
                tracing::debug!("embedding endpoint unavailable ({e}), using fallback");
                pseudo_embedding(text)
            }
        }
    }

    async fn embed_remote(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .timeout(EMBEDDING_DEADLINE)
            .json(&EmbeddingRequestBody {
                model: &self.model,
                prompt: text,
            })
            .send()
            .await?
            .error_for_status()?;
        let body: EmbeddingResponseBody = response.json().await?;
        Ok(body.embedding)
    }
}

/// Deterministic pseudo-embedding: character folding over a fixed number of
/// hash positions, L2-normalized. Identical input always produces the same
/// unit vector.
pub fn pseudo_embedding(text: &str) -> Vec<f32> {
    let normalized = text.trim().to_lowercase();
    let mut v = vec![0.0f32; FALLBACK_DIMENSIONS];

    for (i, ch) in normalized.chars().enumerate() {
        let code = ch as u64;
        for j in 0..3u64 {
            let idx = ((code * (j + 1) + i as u64 * 7) % FALLBACK_DIMENSIONS as u64) as usize;
            v[idx] += 1.0;
        }
    }

    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

/// Cosine similarity; 0 for mismatched lengths or zero-norm vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub embedding: Vec<f32>,
    pub response: ChatResponse,
    pub query: String,
    pub model: String,
    /// Unix millis at store time; eviction removes oldest first.
    pub timestamp: i64,
    pub hit_count: u64,
}

#[derive(Debug, Clone)]
pub struct SemanticCacheConfig {
    pub enabled: bool,
    pub similarity_threshold: f32,
    pub ttl_seconds: u64,
    pub max_entries: usize,
}

impl Default for SemanticCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            similarity_threshold: 0.95,
            ttl_seconds: 3600,
            max_entries: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SemanticCacheStats {
    pub total_entries: u64,
    pub enabled: bool,
    pub threshold: f32,
    pub ttl_seconds: u64,
}

/// Embedding-keyed response cache over the shared key-value store.
pub struct SemanticCache {
    config: SemanticCacheConfig,
    embedder: EmbeddingService,
    redis: Option<redis::Client>,
}

impl SemanticCache {
    pub fn new(
        config: SemanticCacheConfig,
        embedder: EmbeddingService,
        redis_url: Option<&str>,
    ) -> Self {
        let redis = redis_url.and_then(|url| match redis::Client::open(url) {
            Ok(client) => Some(client),
            Err(e) => {
                tracing::warn!("invalid redis URL, semantic cache disabled: {e}");
                None
            }
        });

        if redis.is_none() {
            tracing::info!("semantic cache running without a key-value store (disabled)");
        }

        Self {
            config,
            embedder,
            redis,
        }
    }

    pub fn is_active(&self) -> bool {
        self.config.enabled && self.redis.is_some()
    }

    /// Finds the best cached response for `query`, if any entry clears the
    /// similarity threshold. A hit refreshes the entry TTL and bumps its
    /// hit count. Returns `None` on any store failure.
    pub async fn lookup(&self, query: &str, requested_model: &str) -> Option<ChatResponse> {
        if !self.is_active() {
            return None;
        }

        match self.lookup_inner(query, requested_model).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!("semantic cache lookup failed: {e}");
                None
            }
        }
    }

    async fn lookup_inner(
        &self,
        query: &str,
        requested_model: &str,
    ) -> anyhow::Result<Option<ChatResponse>> {
        let mut conn = self.connection().await?;
        let query_embedding = self.embedder.embed(query).await;

        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(LIVE_SET_KEY)
            .query_async(&mut conn)
            .await?;

        let mut best: Option<(String, CacheEntry, f32)> = None;
        for id in ids {
            let raw: Option<String> = redis::cmd("GET")
                .arg(entry_key(&id))
                .query_async(&mut conn)
                .await?;

            let Some(raw) = raw else {
                // Entry expired out from under the live set.
                let _: i64 = redis::cmd("SREM")
                    .arg(LIVE_SET_KEY)
                    .arg(&id)
                    .query_async(&mut conn)
                    .await?;
                continue;
            };

            let Ok(entry) = serde_json::from_str::<CacheEntry>(&raw) else {
                continue;
            };

            if !is_virtual_model(requested_model) && entry.model != requested_model {
                continue;
            }

            let similarity = cosine_similarity(&query_embedding, &entry.embedding);
            if similarity >= self.config.similarity_threshold
                && best.as_ref().map(|(_, _, s)| similarity > *s).unwrap_or(true)
            {
                best = Some((id, entry, similarity));
            }
        }

        let Some((id, mut entry, similarity)) = best else {
            return Ok(None);
        };

        tracing::debug!(
            similarity,
            model = %entry.model,
            "semantic cache hit"
        );

        entry.hit_count += 1;
        let raw = serde_json::to_string(&entry)?;
        let _: () = redis::cmd("SET")
            .arg(entry_key(&id))
            .arg(raw)
            .arg("EX")
            .arg(self.config.ttl_seconds)
            .query_async(&mut conn)
            .await?;

        Ok(Some(entry.response))
    }

    /// Stores a response under a fresh opaque id, evicting oldest entries
    /// when the live set outgrows the configured bound. Failures are logged
    /// and swallowed.
    pub async fn store(&self, query: &str, model: &str, response: &ChatResponse) {
        if !self.is_active() {
            return;
        }
        if let Err(e) = self.store_inner(query, model, response).await {
            tracing::warn!("semantic cache store failed: {e}");
        }
    }

    async fn store_inner(
        &self,
        query: &str,
        model: &str,
        response: &ChatResponse,
    ) -> anyhow::Result<()> {
        let mut conn = self.connection().await?;
        let embedding = self.embedder.embed(query).await;

        let id = uuid::Uuid::new_v4().to_string();
        let entry = CacheEntry {
            embedding,
            response: response.clone(),
            query: query.to_string(),
            model: model.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            hit_count: 0,
        };

        let raw = serde_json::to_string(&entry)?;
        let _: () = redis::cmd("SET")
            .arg(entry_key(&id))
            .arg(raw)
            .arg("EX")
            .arg(self.config.ttl_seconds)
            .query_async(&mut conn)
            .await?;
        let _: i64 = redis::cmd("SADD")
            .arg(LIVE_SET_KEY)
            .arg(&id)
            .query_async(&mut conn)
            .await?;

        let live: i64 = redis::cmd("SCARD")
            .arg(LIVE_SET_KEY)
            .query_async(&mut conn)
            .await?;
        if live as usize > self.config.max_entries {
            self.evict_oldest(&mut conn, live as usize - self.config.max_entries)
                .await?;
        }

        Ok(())
    }

    /// Removes the `overflow` oldest entries by stored timestamp.
    async fn evict_oldest(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        overflow: usize,
    ) -> anyhow::Result<()> {
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(LIVE_SET_KEY)
            .query_async(&mut *conn)
            .await?;

        let mut stamped: Vec<(String, i64)> = Vec::with_capacity(ids.len());
        for id in ids {
            let raw: Option<String> = redis::cmd("GET")
                .arg(entry_key(&id))
                .query_async(&mut *conn)
                .await?;
            match raw.and_then(|r| serde_json::from_str::<CacheEntry>(&r).ok()) {
                Some(entry) => stamped.push((id, entry.timestamp)),
                None => stamped.push((id, i64::MIN)), // dead id, evict first
            }
        }

        stamped.sort_by_key(|(_, ts)| *ts);
        let victims = stamped.into_iter().take(overflow);

        let mut pipe = redis::pipe();
        for (id, _) in victims {
            pipe.cmd("DEL").arg(entry_key(&id)).ignore();
            pipe.cmd("SREM").arg(LIVE_SET_KEY).arg(&id).ignore();
        }
        let _: () = pipe.query_async(&mut *conn).await?;

        Ok(())
    }

    /// Removes entries whose query or model contains `pattern`; with no
    /// pattern, drops everything. Returns how many entries were removed.
    pub async fn invalidate(&self, pattern: Option<&str>) -> u64 {
        if self.redis.is_none() {
            return 0;
        }
        match self.invalidate_inner(pattern).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!("semantic cache invalidation failed: {e}");
                0
            }
        }
    }

    async fn invalidate_inner(&self, pattern: Option<&str>) -> anyhow::Result<u64> {
        let mut conn = self.connection().await?;
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(LIVE_SET_KEY)
            .query_async(&mut conn)
            .await?;

        let mut removed = 0u64;
        match pattern {
            None => {
                let mut pipe = redis::pipe();
                for id in &ids {
                    pipe.cmd("DEL").arg(entry_key(id)).ignore();
                }
                pipe.cmd("DEL").arg(LIVE_SET_KEY).ignore();
                let _: () = pipe.query_async(&mut conn).await?;
                removed = ids.len() as u64;
            }
            Some(pattern) => {
                for id in ids {
                    let raw: Option<String> = redis::cmd("GET")
                        .arg(entry_key(&id))
                        .query_async(&mut conn)
                        .await?;
                    let matches = raw
                        .and_then(|r| serde_json::from_str::<CacheEntry>(&r).ok())
                        .map(|e| e.query.contains(pattern) || e.model.contains(pattern))
                        .unwrap_or(true);
                    if matches {
                        let _: () = redis::cmd("DEL")
                            .arg(entry_key(&id))
                            .query_async(&mut conn)
                            .await?;
                        let _: i64 = redis::cmd("SREM")
                            .arg(LIVE_SET_KEY)
                            .arg(&id)
                            .query_async(&mut conn)
                            .await?;
                        removed += 1;
                    }
                }
            }
        }

        Ok(removed)
    }

    pub async fn stats(&self) -> SemanticCacheStats {
        let total_entries = match self.connection().await {
            Ok(mut conn) => redis::cmd("SCARD")
                .arg(LIVE_SET_KEY)
                .query_async::<_, i64>(&mut conn)
                .await
                .unwrap_or(0) as u64,
            Err(_) => 0,
        };

        SemanticCacheStats {
            total_entries,
            enabled: self.is_active(),
            threshold: self.config.similarity_threshold,
            ttl_seconds: self.config.ttl_seconds,
        }
    }

    async fn connection(&self) -> anyhow::Result<redis::aio::MultiplexedConnection> {
        let client = self
            .redis
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("key-value store not configured"))?;
        Ok(client.get_multiplexed_async_connection().await?)
    }
}

fn entry_key(id: &str) -> String {
    format!("{ENTRY_KEY_PREFIX}{id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pseudo_embedding_is_unit_length() {
        for text in ["hello", "a", "What is the capital of France?", "  spaced  "] {
            let v = pseudo_embedding(text);
            assert_eq!(v.len(), FALLBACK_DIMENSIONS);
            let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-5, "norm for {text:?} was {norm}");
        }
    }

    #[test]
    fn pseudo_embedding_is_deterministic_and_case_insensitive() {
        assert_eq!(pseudo_embedding("Hello World"), pseudo_embedding("hello world"));
        assert_eq!(pseudo_embedding(" hi "), pseudo_embedding("hi"));
    }

    #[test]
    fn cosine_bounds_hold() {
        let a = pseudo_embedding("the quick brown fox");
        let b = pseudo_embedding("an entirely different sentence");
        let sim = cosine_similarity(&a, &b);
        assert!((-1.0..=1.0).contains(&sim));
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn cosine_degenerate_cases_are_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn similar_texts_score_higher_than_unrelated() {
        let a = pseudo_embedding("What is the capital of France?");
        let b = pseudo_embedding("What is the capital of France???");
        let c = pseudo_embedding("Write a haiku about compilers");
        assert!(cosine_similarity(&a, &b) > cosine_similarity(&a, &c));
    }

    #[tokio::test]
    async fn cache_without_store_is_inert() {
        let cache = SemanticCache::new(
            SemanticCacheConfig::default(),
            EmbeddingService::new("http://localhost:11434", "nomic-embed-text"),
            None,
        );
        assert!(!cache.is_active());
        assert!(cache.lookup("anything", "auto").await.is_none());
        assert_eq!(cache.invalidate(None).await, 0);
        let stats = cache.stats().await;
        assert_eq!(stats.total_entries, 0);
        assert!(!stats.enabled);
    }
}
