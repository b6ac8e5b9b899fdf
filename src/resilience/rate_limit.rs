//! Fixed-window rate limiting.
//!
//! Counting and the optional "skip successful/failed requests" refund happen
//! under one lock. A slot is taken by [`RateLimiter::acquire`] and the
//! returned permit is later passed to [`RateLimiter::settle`] with the call's
//! outcome; the refund only applies while the permit's window is current.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::CallOutcome;
use crate::Error;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_ms: u64,
    pub max_requests: u32,
    /// Refund the slot of calls that succeeded.
    pub skip_successful_requests: bool,
    /// Refund the slot of calls that failed.
    pub skip_failed_requests: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            max_requests: 100,
            skip_successful_requests: false,
            skip_failed_requests: false,
        }
    }
}

impl RateLimitConfig {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            window_ms: window.as_millis() as u64,
            max_requests,
            ..Default::default()
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RateLimitInfo {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_time: DateTime<Utc>,
    /// Remaining time in the current window; set on rejections only.
    pub retry_after: Option<Duration>,
}

impl RateLimitInfo {
    pub fn into_error(self, key: &str) -> Error {
        Error::RateLimited {
            key: key.to_string(),
            limit: self.limit,
            retry_after: self.retry_after.unwrap_or_default(),
            reset_time: self.reset_time,
        }
    }
}

/// A counted slot in a specific window.
#[derive(Debug)]
#[must_use = "settle the permit so skip options can refund it"]
pub struct RateLimitPermit {
    generation: u64,
    info: RateLimitInfo,
}

impl RateLimitPermit {
    pub fn info(&self) -> &RateLimitInfo {
        &self.info
    }
}

struct Window {
    started: Instant,
    count: u32,
    generation: u64,
    rejected: u64,
}

pub struct RateLimiter {
    key: String,
    config: RateLimitConfig,
    window: Mutex<Window>,
}

impl RateLimiter {
    pub fn new(key: impl Into<String>, config: RateLimitConfig) -> Self {
        Self {
            key: key.into(),
            config,
            window: Mutex::new(Window {
                started: Instant::now(),
                count: 0,
                generation: 0,
                rejected: 0,
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Counts one request, or rejects it without counting when the window is
    /// full.
    pub fn acquire(&self) -> Result<RateLimitPermit, RateLimitInfo> {
        let now = Instant::now();
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        self.roll(&mut window, now);

        if window.count >= self.config.max_requests {
            window.rejected += 1;
            let info = self.info(&window, now, false);
            tracing::debug!(
                key = %self.key,
                limit = self.config.max_requests,
                retry_after_ms = info.retry_after.unwrap_or_default().as_millis() as u64,
                "Rate limit exceeded"
            );
            return Err(info);
        }

        window.count += 1;
        Ok(RateLimitPermit {
            generation: window.generation,
            info: self.info(&window, now, true),
        })
    }

    /// Acquire-and-forget form of [`acquire`](Self::acquire).
    pub fn check_limit(&self) -> RateLimitInfo {
        match self.acquire() {
            Ok(permit) => permit.info,
            Err(info) => info,
        }
    }

    /// Feeds a call's outcome back. Refunds the slot when the matching skip
    /// option is set and the permit's window has not rolled over.
    pub fn settle(&self, permit: RateLimitPermit, outcome: CallOutcome) {
        let refund = match outcome {
            CallOutcome::Success => self.config.skip_successful_requests,
            CallOutcome::Failure => self.config.skip_failed_requests,
            CallOutcome::Ignored => false,
        };
        if !refund {
            return;
        }

        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        if window.generation == permit.generation {
            window.count = window.count.saturating_sub(1);
        }
    }

    /// Current window state without counting a request.
    pub fn status(&self) -> RateLimitInfo {
        let now = Instant::now();
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        self.roll(&mut window, now);
        let allowed = window.count < self.config.max_requests;
        self.info(&window, now, allowed)
    }

    pub fn rejected(&self) -> u64 {
        self.window.lock().unwrap_or_else(|e| e.into_inner()).rejected
    }

    pub fn reset(&self) {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        window.started = Instant::now();
        window.count = 0;
        window.generation += 1;
    }

    fn roll(&self, window: &mut Window, now: Instant) {
        if now.duration_since(window.started) >= self.config.window() {
            window.started = now;
            window.count = 0;
            window.generation += 1;
        }
    }

    fn info(&self, window: &Window, now: Instant, allowed: bool) -> RateLimitInfo {
        let remaining_window = self
            .config
            .window()
            .saturating_sub(now.duration_since(window.started));
        let reset_time = Utc::now()
            + chrono::Duration::from_std(remaining_window).unwrap_or_else(|_| chrono::Duration::zero());
        RateLimitInfo {
            allowed,
            limit: self.config.max_requests,
            remaining: self.config.max_requests.saturating_sub(window.count),
            reset_time,
            retry_after: (!allowed).then_some(remaining_window),
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("key", &self.key)
            .field("config", &self.config)
            .finish()
    }
}

/// One limiter per key.
#[derive(Clone, Default)]
pub struct RateLimiterRegistry {
    limiters: Arc<DashMap<String, Arc<RateLimiter>>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the limiter for `key`, creating it with `config` on first use.
    pub fn get_or_create(&self, key: &str, config: &RateLimitConfig) -> Arc<RateLimiter> {
        if let Some(existing) = self.limiters.get(key) {
            return existing.clone();
        }
        self.limiters
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(RateLimiter::new(key, config.clone())))
            .clone()
    }

    pub fn get(&self, key: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.get(key).map(|l| l.clone())
    }

    pub fn check_limit(&self, key: &str, config: &RateLimitConfig) -> RateLimitInfo {
        self.get_or_create(key, config).check_limit()
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    pub fn remove(&self, key: &str) -> bool {
        self.limiters.remove(key).is_some()
    }

    pub fn destroy_all(&self) {
        let count = self.limiters.len();
        self.limiters.clear();
        tracing::debug!(count, "Rate limiters destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: u32) -> RateLimiter {
        RateLimiter::new("api", RateLimitConfig::new(max, Duration::from_secs(60)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_allows_exactly_max_per_window() {
        let limiter = limiter(10);
        for i in 0..10 {
            let info = limiter.check_limit();
            assert!(info.allowed, "call {i} should pass");
            assert_eq!(info.remaining, 9 - i);
        }

        let rejected = limiter.check_limit();
        assert!(!rejected.allowed);
        assert_eq!(rejected.remaining, 0);
        assert_eq!(rejected.retry_after, Some(Duration::from_secs(60)));
        assert_eq!(limiter.rejected(), 1);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(limiter.check_limit().allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_is_remaining_window() {
        let limiter = limiter(1);
        assert!(limiter.check_limit().allowed);
        tokio::time::advance(Duration::from_secs(45)).await;
        assert_eq!(
            limiter.check_limit().retry_after,
            Some(Duration::from_secs(15))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_successful_refunds_slot() {
        let config = RateLimitConfig {
            skip_successful_requests: true,
            ..RateLimitConfig::new(1, Duration::from_secs(60))
        };
        let limiter = RateLimiter::new("api", config);

        let permit = limiter.acquire().unwrap();
        assert!(limiter.acquire().is_err());
        limiter.settle(permit, CallOutcome::Success);
        let permit = limiter.acquire().unwrap();

        limiter.settle(permit, CallOutcome::Failure);
        assert!(limiter.acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refund_ignored_after_window_rolls() {
        let config = RateLimitConfig {
            skip_failed_requests: true,
            ..RateLimitConfig::new(2, Duration::from_secs(60))
        };
        let limiter = RateLimiter::new("api", config);

        let stale = limiter.acquire().unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        let _fresh = limiter.acquire().unwrap();
        limiter.settle(stale, CallOutcome::Failure);

        assert_eq!(limiter.status().remaining, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_does_not_count() {
        let limiter = limiter(1);
        assert!(limiter.status().allowed);
        assert!(limiter.status().allowed);
        assert!(limiter.check_limit().allowed);
        assert!(!limiter.status().allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry() {
        let registry = RateLimiterRegistry::new();
        let config = RateLimitConfig::new(1, Duration::from_secs(60));
        assert!(registry.check_limit("a", &config).allowed);
        assert!(!registry.check_limit("a", &config).allowed);
        assert!(registry.check_limit("b", &config).allowed);
        assert_eq!(registry.len(), 2);

        registry.destroy_all();
        assert!(registry.is_empty());
        assert!(registry.check_limit("a", &config).allowed);
    }

    #[test]
    fn test_rejection_converts_to_error() {
        let info = RateLimitInfo {
            allowed: false,
            limit: 5,
            remaining: 0,
            reset_time: Utc::now(),
            retry_after: Some(Duration::from_secs(3)),
        };
        assert!(matches!(
            info.into_error("api"),
            Error::RateLimited { limit: 5, ref key, .. } if key == "api"
        ));
    }
}
