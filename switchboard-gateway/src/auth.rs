//! Admission control: API keys, monthly budgets, and sliding-window rate
//! limits.
//!
//! Keys are opaque strings minted by the admin API. Each record carries
//! optional monthly token/cost budgets and optional per-minute rate limits;
//! the used-counters reset atomically on the first access in a new calendar
//! month. Budget checks fail closed (they protect spend); rate-limit store
//! errors fail open (they protect availability).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Datelike, Utc};
use dashmap::DashMap;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Sliding window for both RPM and TPM checks.
const RATE_WINDOW_MS: u64 = 60_000;

#[derive(Debug, Clone, Serialize)]
pub struct ApiKeyRecord {
    /// Stable identifier, `gw-{env}-{random}`.
    pub id: String,
    /// The bearer secret presented by clients.
    pub key: String,
    pub name: String,
    pub enabled: bool,
    pub monthly_token_budget: Option<u64>,
    pub monthly_cost_budget_usd: Option<f64>,
    pub rate_limit_rpm: Option<u32>,
    pub rate_limit_tpm: Option<u32>,
    pub tokens_used_this_month: u64,
    pub cost_used_this_month_usd: f64,
    pub last_reset_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateKeyOptions {
    pub name: String,
    #[serde(default)]
    pub monthly_token_budget: Option<u64>,
    #[serde(default)]
    pub monthly_cost_budget_usd: Option<f64>,
    #[serde(default)]
    pub rate_limit_rpm: Option<u32>,
    #[serde(default)]
    pub rate_limit_tpm: Option<u32>,
}

/// In-process key table; persistence is a write-through concern of the
/// deployment, not of the gateway core.
pub struct ApiKeyStore {
    environment: String,
    records: DashMap<String, ApiKeyRecord>,
    creation_order: Mutex<Vec<String>>,
}

impl ApiKeyStore {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            records: DashMap::new(),
            creation_order: Mutex::new(Vec::new()),
        }
    }

    pub fn create(&self, options: CreateKeyOptions) -> ApiKeyRecord {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        let id = format!("gw-{}-{}", self.environment, suffix);
        let key: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(40)
            .map(char::from)
            .collect();

        let now = Utc::now();
        let record = ApiKeyRecord {
            id,
            key: format!("sb-{key}"),
            name: options.name,
            enabled: true,
            monthly_token_budget: options.monthly_token_budget,
            monthly_cost_budget_usd: options.monthly_cost_budget_usd,
            rate_limit_rpm: options.rate_limit_rpm,
            rate_limit_tpm: options.rate_limit_tpm,
            tokens_used_this_month: 0,
            cost_used_this_month_usd: 0.0,
            last_reset_at: now,
            created_at: now,
        };

        self.records.insert(record.key.clone(), record.clone());
        self.creation_order
            .lock()
            .unwrap()
            .push(record.key.clone());
        record
    }

    /// Looks up an enabled key. The first access in a new calendar month
    /// atomically zeroes the used-counters and advances `last_reset_at`.
    pub fn validate(&self, key: &str) -> Option<ApiKeyRecord> {
        let mut entry = self.records.get_mut(key)?;
        if !entry.enabled {
            return None;
        }

        let now = Utc::now();
        if (now.year(), now.month()) != (entry.last_reset_at.year(), entry.last_reset_at.month()) {
            entry.tokens_used_this_month = 0;
            entry.cost_used_this_month_usd = 0.0;
            entry.last_reset_at = now;
            tracing::info!(key_id = %entry.id, "monthly usage counters reset");
        }

        Some(entry.clone())
    }

    pub fn record_usage(&self, key: &str, tokens: u64, cost_usd: f64) {
        if let Some(mut entry) = self.records.get_mut(key) {
            entry.tokens_used_this_month += tokens;
            entry.cost_used_this_month_usd += cost_usd;
        }
    }

    /// Disables a key; returns false when the key is unknown.
    pub fn revoke(&self, key: &str) -> bool {
        match self.records.get_mut(key) {
            Some(mut entry) => {
                entry.enabled = false;
                true
            }
            None => false,
        }
    }

    pub fn list(&self) -> Vec<ApiKeyRecord> {
        let order = self.creation_order.lock().unwrap();
        order
            .iter()
            .filter_map(|key| self.records.get(key).map(|e| e.clone()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Test/bootstrap hook for inserting a record with a known key.
    pub fn insert_record(&self, record: ApiKeyRecord) {
        self.creation_order
            .lock()
            .unwrap()
            .push(record.key.clone());
        self.records.insert(record.key.clone(), record);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetCheck {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub token_usage_percent: f64,
    pub cost_usage_percent: f64,
    /// 80 or 95 when usage crosses those alert lines.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert_threshold: Option<u8>,
}

/// Per-key and process-wide budget enforcement. Global counters are plain
/// atomics; cost is tracked in micro-dollars to stay lock-free.
pub struct BudgetEnforcer {
    global_token_budget: Option<u64>,
    global_cost_budget_usd: Option<f64>,
    global_tokens_used: AtomicU64,
    global_cost_used_micro_usd: AtomicU64,
}

impl BudgetEnforcer {
    pub fn new(global_token_budget: Option<u64>, global_cost_budget_usd: Option<f64>) -> Self {
        Self {
            global_token_budget,
            global_cost_budget_usd,
            global_tokens_used: AtomicU64::new(0),
            global_cost_used_micro_usd: AtomicU64::new(0),
        }
    }

    pub fn check_budget(&self, record: Option<&ApiKeyRecord>) -> BudgetCheck {
        let mut token_percent = 0.0;
        let mut cost_percent = 0.0;

        if let Some(record) = record {
            if let Some(budget) = record.monthly_token_budget {
                token_percent = percent(record.tokens_used_this_month as f64, budget as f64);
                if record.tokens_used_this_month >= budget {
                    return BudgetCheck {
                        allowed: false,
                        reason: Some(format!(
                            "monthly token budget exhausted ({}/{budget})",
                            record.tokens_used_this_month
                        )),
                        token_usage_percent: token_percent,
                        cost_usage_percent: cost_percent,
                        alert_threshold: Some(95),
                    };
                }
            }
            if let Some(budget) = record.monthly_cost_budget_usd {
                cost_percent = percent(record.cost_used_this_month_usd, budget);
                if record.cost_used_this_month_usd >= budget {
                    return BudgetCheck {
                        allowed: false,
                        reason: Some(format!(
                            "monthly cost budget exhausted (${:.4}/${budget:.4})",
                            record.cost_used_this_month_usd
                        )),
                        token_usage_percent: token_percent,
                        cost_usage_percent: cost_percent,
                        alert_threshold: Some(95),
                    };
                }
            }
        }

        if let Some(global) = self.global_token_budget {
            let used = self.global_tokens_used.load(Ordering::Relaxed);
            if used >= global {
                return BudgetCheck {
                    allowed: false,
                    reason: Some(format!("global token budget exhausted ({used}/{global})")),
                    token_usage_percent: token_percent,
                    cost_usage_percent: cost_percent,
                    alert_threshold: Some(95),
                };
            }
        }
        if let Some(global) = self.global_cost_budget_usd {
            let used = self.global_cost_used_micro_usd.load(Ordering::Relaxed) as f64 / 1e6;
            if used >= global {
                return BudgetCheck {
                    allowed: false,
                    reason: Some(format!(
                        "global cost budget exhausted (${used:.4}/${global:.4})"
                    )),
                    token_usage_percent: token_percent,
                    cost_usage_percent: cost_percent,
                    alert_threshold: Some(95),
                };
            }
        }

        let worst = token_percent.max(cost_percent);
        let alert_threshold = if worst >= 95.0 {
            Some(95)
        } else if worst >= 80.0 {
            Some(80)
        } else {
            None
        };

        BudgetCheck {
            allowed: true,
            reason: None,
            token_usage_percent: token_percent,
            cost_usage_percent: cost_percent,
            alert_threshold,
        }
    }

    pub fn record_global_usage(&self, tokens: u64, cost_usd: f64) {
        self.global_tokens_used.fetch_add(tokens, Ordering::Relaxed);
        self.global_cost_used_micro_usd
            .fetch_add((cost_usd * 1e6) as u64, Ordering::Relaxed);
    }

    pub fn global_usage(&self) -> (u64, f64) {
        (
            self.global_tokens_used.load(Ordering::Relaxed),
            self.global_cost_used_micro_usd.load(Ordering::Relaxed) as f64 / 1e6,
        )
    }

    pub fn global_budgets(&self) -> (Option<u64>, Option<f64>) {
        (self.global_token_budget, self.global_cost_budget_usd)
    }
}

fn percent(used: f64, budget: f64) -> f64 {
    if budget <= 0.0 {
        0.0
    } else {
        (used / budget) * 100.0
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Serialize)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// How long to back off when denied.
    pub retry_after_ms: u64,
}

impl RateDecision {
    fn open(limit: u32) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: limit,
            retry_after_ms: 0,
        }
    }
}

/// Sliding-window limiter over sorted sets in the shared key-value store.
/// Without a store (or on store errors) every check allows: availability
/// wins over precision here.
pub struct RateLimiter {
    redis: Option<redis::Client>,
}

impl RateLimiter {
    pub fn new(redis_url: Option<&str>) -> Self {
        let redis = redis_url.and_then(|url| match redis::Client::open(url) {
            Ok(client) => Some(client),
            Err(e) => {
                tracing::warn!("invalid redis URL, rate limiting disabled: {e}");
                None
            }
        });
        Self { redis }
    }

    pub fn is_active(&self) -> bool {
        self.redis.is_some()
    }

    /// Requests-per-minute check for one key.
    pub async fn check_rpm(&self, key_id: &str, max: u32) -> RateDecision {
        match self.sliding_window_rpm(key_id, max).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!("rate limit store error, failing open: {e}");
                RateDecision::open(max)
            }
        }
    }

    async fn sliding_window_rpm(&self, key_id: &str, max: u32) -> anyhow::Result<RateDecision> {
        let mut conn = self.connection().await?;
        let key = format!("ratelimit:rpm:{key_id}");
        let now = Utc::now().timestamp_millis() as u64;
        let window_start = now.saturating_sub(RATE_WINDOW_MS);
        let member = format!("{now}-{}", uuid::Uuid::new_v4());

        // Trim, count, add, refresh expiry in one round trip. The count is
        // taken before the add, so the (max+1)-th request in a window sees
        // count == max and is denied.
        let (_, count, _, _): (i64, u32, i64, i64) = redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&key)
            .arg(0)
            .arg(window_start)
            .cmd("ZCARD")
            .arg(&key)
            .cmd("ZADD")
            .arg(&key)
            .arg(now)
            .arg(&member)
            .cmd("PEXPIRE")
            .arg(&key)
            .arg(RATE_WINDOW_MS)
            .query_async(&mut conn)
            .await?;

        if count >= max {
            let oldest: Vec<(String, f64)> = redis::cmd("ZRANGE")
                .arg(&key)
                .arg(0)
                .arg(0)
                .arg("WITHSCORES")
                .query_async(&mut conn)
                .await?;
            let oldest_score = oldest.first().map(|(_, s)| *s as u64).unwrap_or(now);
            let retry_after_ms = (oldest_score + RATE_WINDOW_MS).saturating_sub(now).max(1);

            return Ok(RateDecision {
                allowed: false,
                limit: max,
                remaining: 0,
                retry_after_ms,
            });
        }

        Ok(RateDecision {
            allowed: true,
            limit: max,
            remaining: max.saturating_sub(count + 1),
            retry_after_ms: 0,
        })
    }

    /// Tokens-per-minute check. Each window member encodes its token count
    /// as a `{tokens}:{now}-{nonce}` prefix; the window sum plus the new
    /// request must stay within `max`.
    pub async fn check_tpm(&self, key_id: &str, max: u32, new_tokens: u32) -> RateDecision {
        match self.sliding_window_tpm(key_id, max, new_tokens).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!("rate limit store error, failing open: {e}");
                RateDecision::open(max)
            }
        }
    }

    async fn sliding_window_tpm(
        &self,
        key_id: &str,
        max: u32,
        new_tokens: u32,
    ) -> anyhow::Result<RateDecision> {
        let mut conn = self.connection().await?;
        let key = format!("ratelimit:tpm:{key_id}");
        let now = Utc::now().timestamp_millis() as u64;
        let window_start = now.saturating_sub(RATE_WINDOW_MS);

        let _: i64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(&key)
            .arg(0)
            .arg(window_start)
            .query_async(&mut conn)
            .await?;

        let members: Vec<(String, f64)> = redis::cmd("ZRANGE")
            .arg(&key)
            .arg(0)
            .arg(-1)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;

        let used: u64 = members
            .iter()
            .filter_map(|(m, _)| m.split(':').next())
            .filter_map(|t| t.parse::<u64>().ok())
            .sum();

        if used + new_tokens as u64 > max as u64 {
            let oldest_score = members.first().map(|(_, s)| *s as u64).unwrap_or(now);
            let retry_after_ms = (oldest_score + RATE_WINDOW_MS).saturating_sub(now).max(1);
            return Ok(RateDecision {
                allowed: false,
                limit: max,
                remaining: max.saturating_sub(used as u32),
                retry_after_ms,
            });
        }

        let member = format!("{new_tokens}:{now}-{}", rand::thread_rng().gen::<u32>());
        let (_, _): (i64, i64) = redis::pipe()
            .atomic()
            .cmd("ZADD")
            .arg(&key)
            .arg(now)
            .arg(&member)
            .cmd("PEXPIRE")
            .arg(&key)
            .arg(RATE_WINDOW_MS)
            .query_async(&mut conn)
            .await?;

        Ok(RateDecision {
            allowed: true,
            limit: max,
            remaining: max.saturating_sub((used + new_tokens as u64) as u32),
            retry_after_ms: 0,
        })
    }

    async fn connection(&self) -> anyhow::Result<redis::aio::MultiplexedConnection> {
        let client = self
            .redis
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("key-value store not configured"))?;
        Ok(client.get_multiplexed_async_connection().await?)
    }
}
