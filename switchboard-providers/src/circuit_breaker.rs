//! Per-provider circuit breakers.
//!
//! A breaker sits in front of each provider and trips after a run of
//! failures, blocking further calls until a recovery window has passed.
//! After the window, the next state read moves the breaker to half-open and
//! a limited number of trial calls decide whether it closes again.
//!
//! The fallback chain owns call execution, so the breaker exposes explicit
//! admission (`allow_request`) and outcome recording (`record_success` /
//! `record_failure`) instead of wrapping closures.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, requests admitted.
    Closed,
    /// Tripped, all requests blocked.
    Open,
    /// Probing recovery with a bounded number of trial requests.
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// How long an open breaker blocks before allowing trial calls.
    #[serde(with = "crate::common::duration_serde")]
    pub reset_timeout: Duration,
    /// Trial calls admitted (and successes required) in half-open.
    pub half_open_max_attempts: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_millis(30_000),
            half_open_max_attempts: 3,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    half_open_attempts: u32,
}

impl Default for BreakerInner {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            half_open_attempts: 0,
        }
    }
}

/// Point-in-time view of a breaker for status endpoints and metrics.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub half_open_attempts: u32,
    pub seconds_since_last_failure: Option<u64>,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: String, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            config,
            inner: Mutex::new(BreakerInner::default()),
        }
    }

    /// Current state. Reading the state of an open breaker past its reset
    /// timeout transitions it to half-open.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().unwrap();
        self.maybe_enter_half_open(&mut inner);
        inner.state
    }

    fn maybe_enter_half_open(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open {
            let elapsed = inner
                .last_failure_time
                .map(|t| t.elapsed())
                .unwrap_or(Duration::MAX);
            if elapsed >= self.config.reset_timeout {
                inner.state = CircuitState::HalfOpen;
                inner.half_open_attempts = 0;
                inner.success_count = 0;
                tracing::info!("circuit breaker {} entering half-open", self.name);
            }
        }
    }

    /// Whether a request may proceed right now. Half-open admissions count
    /// against the trial budget.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        self.maybe_enter_half_open(&mut inner);

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.half_open_attempts < self.config.half_open_max_attempts {
                    inner.half_open_attempts += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.success_count += 1;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.half_open_max_attempts {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.half_open_attempts = 0;
                    tracing::info!("circuit breaker {} closed after recovery", self.name);
                }
            }
            CircuitState::Open => {
                // Late completion of a call admitted before the trip.
            }
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.failure_count += 1;
        inner.last_failure_time = Some(Instant::now());

        match inner.state {
            CircuitState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.success_count = 0;
                    inner.half_open_attempts = 0;
                    tracing::warn!(
                        "circuit breaker {} opened after {} failures",
                        self.name,
                        inner.failure_count
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.half_open_attempts = 0;
                inner.success_count = 0;
                tracing::warn!("circuit breaker {} re-opened from half-open", self.name);
            }
            CircuitState::Open => {}
        }
    }

    /// Forces the breaker back to a pristine closed state.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        *inner = BreakerInner::default();
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.inner.lock().unwrap();
        self.maybe_enter_half_open(&mut inner);
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            half_open_attempts: inner.half_open_attempts,
            seconds_since_last_failure: inner.last_failure_time.map(|t| t.elapsed().as_secs()),
        }
    }

    #[cfg(test)]
    fn failure_count(&self) -> u32 {
        self.inner.lock().unwrap().failure_count
    }
}

/// Lazily creates and hands out one breaker per provider id.
pub struct CircuitBreakerManager {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerManager {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn breaker(&self, provider_id: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(provider_id.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    provider_id.to_string(),
                    self.config.clone(),
                ))
            })
            .clone()
    }

    pub fn snapshots(&self) -> HashMap<String, BreakerSnapshot> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config(threshold: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            reset_timeout: Duration::from_millis(50),
            half_open_max_attempts: 2,
        }
    }

    #[test]
    fn exactly_threshold_failures_trip_the_breaker() {
        let breaker = CircuitBreaker::new("test".to_string(), fast_config(3));

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn success_in_closed_resets_failure_count() {
        let breaker = CircuitBreaker::new("test".to_string(), fast_config(3));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        // Two failures after the reset: still below the threshold of three.
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn open_breaker_half_opens_after_reset_timeout() {
        let breaker = CircuitBreaker::new("test".to_string(), fast_config(1));
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;

        // The state read itself performs the transition.
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn half_open_admits_a_bounded_number_of_trials() {
        let breaker = CircuitBreaker::new("test".to_string(), fast_config(1));
        breaker.record_failure();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(breaker.allow_request());
        assert!(breaker.allow_request());
        assert!(!breaker.allow_request());
    }

    #[tokio::test]
    async fn consecutive_half_open_successes_close_the_breaker() {
        let breaker = CircuitBreaker::new("test".to_string(), fast_config(1));
        breaker.record_failure();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(breaker.allow_request());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert!(breaker.allow_request());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("test".to_string(), fast_config(1));
        breaker.record_failure();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(breaker.allow_request());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn reset_on_closed_breaker_is_a_no_op() {
        let breaker = CircuitBreaker::new("test".to_string(), fast_config(3));
        breaker.record_success();
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);

        // record_success with zero failures also changes nothing observable.
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn manager_creates_one_breaker_per_provider() {
        let manager = CircuitBreakerManager::default();
        let a = manager.breaker("openai");
        let b = manager.breaker("openai");
        assert!(Arc::ptr_eq(&a, &b));

        a.record_failure();
        assert_eq!(manager.snapshots().get("openai").unwrap().failure_count, 1);
    }
}
