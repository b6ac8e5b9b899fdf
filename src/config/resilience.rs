//! Per-endpoint resilience settings.
//!
//! A settings value holds a `defaults` block plus partial overrides keyed by
//! endpoint name. [`ResilienceSettings::resolve`] layers, in order: the
//! defaults, the built-in tuning of a known [`EndpointClass`], and the
//! user's override for that name. Components only ever see the fully
//! populated [`EndpointConfig`].

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::resilience::{CircuitConfig, RateLimitConfig, RetryPolicy};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointClass {
    GenerationApi,
    Database,
    Storage,
}

impl EndpointClass {
    pub const ALL: [EndpointClass; 3] = [Self::GenerationApi, Self::Database, Self::Storage];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GenerationApi => "generation_api",
            Self::Database => "database",
            Self::Storage => "storage",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }

    /// Built-in tuning. The external API gets a long timeout, a small rate
    /// ceiling and slow backoff; the database gets the opposite.
    pub fn builtin_override(&self) -> EndpointOverride {
        let (base, max, requests, timeout) = match self {
            Self::GenerationApi => (2_000, 30_000, 20, 120_000),
            Self::Database => (100, 2_000, 1_000, 10_000),
            Self::Storage => (500, 10_000, 200, 30_000),
        };
        EndpointOverride {
            retry: RetryOverride {
                base_delay_ms: Some(base),
                max_delay_ms: Some(max),
                ..Default::default()
            },
            rate_limit: RateLimitOverride {
                max_requests: Some(requests),
                window_ms: Some(60_000),
                ..Default::default()
            },
            timeout_ms: Some(timeout),
            ..Default::default()
        }
    }
}

impl fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fully resolved settings for one endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub retry: RetryPolicy,
    pub circuit_breaker: CircuitConfig,
    pub rate_limit: RateLimitConfig,
    pub timeout_ms: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            circuit_breaker: CircuitConfig::default(),
            rate_limit: RateLimitConfig::default(),
            timeout_ms: 30_000,
        }
    }
}

impl EndpointConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitConfig) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    fn apply(&mut self, o: &EndpointOverride) {
        o.retry.apply_to(&mut self.retry);
        o.circuit_breaker.apply_to(&mut self.circuit_breaker);
        o.rate_limit.apply_to(&mut self.rate_limit);
        if let Some(t) = o.timeout_ms {
            self.timeout_ms = t;
        }
    }

    pub(crate) fn collect_errors(&self, endpoint: &str, errors: &mut Vec<ConfigError>) {
        let mut invalid = |field: &str, message: &str| {
            errors.push(ConfigError::InvalidValue {
                key: format!("{endpoint}.{field}"),
                message: message.to_string(),
            });
        };

        let r = &self.retry;
        if r.max_attempts == 0 {
            invalid("retry.max_attempts", "must be at least 1");
        }
        if r.base_delay_ms > r.max_delay_ms {
            invalid("retry.base_delay_ms", "must not exceed max_delay_ms");
        }
        if r.backoff_multiplier.is_nan() || r.backoff_multiplier < 1.0 {
            invalid("retry.backoff_multiplier", "must be at least 1.0");
        }
        if !(0.0..=1.0).contains(&r.jitter_factor) {
            invalid("retry.jitter_factor", "must be within 0.0..=1.0");
        }

        let c = &self.circuit_breaker;
        if c.failure_threshold == 0 {
            invalid("circuit_breaker.failure_threshold", "must be at least 1");
        }
        if c.minimum_throughput == 0 {
            invalid("circuit_breaker.minimum_throughput", "must be at least 1");
        }
        if c.monitoring_period_ms == 0 {
            invalid("circuit_breaker.monitoring_period_ms", "must be positive");
        }
        if c.reset_timeout_ms == 0 {
            invalid("circuit_breaker.reset_timeout_ms", "must be positive");
        }

        if self.rate_limit.window_ms == 0 {
            invalid("rate_limit.window_ms", "must be positive");
        }
        if self.rate_limit.max_requests == 0 {
            invalid("rate_limit.max_requests", "must be at least 1");
        }
        if self.timeout_ms == 0 {
            invalid("timeout_ms", "must be positive");
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOverride {
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub jitter_factor: Option<f64>,
}

impl RetryOverride {
    fn apply_to(&self, p: &mut RetryPolicy) {
        if let Some(v) = self.max_attempts {
            p.max_attempts = v;
        }
        if let Some(v) = self.base_delay_ms {
            p.base_delay_ms = v;
        }
        if let Some(v) = self.max_delay_ms {
            p.max_delay_ms = v;
        }
        if let Some(v) = self.backoff_multiplier {
            p.backoff_multiplier = v;
        }
        if let Some(v) = self.jitter_factor {
            p.jitter_factor = v;
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitOverride {
    pub failure_threshold: Option<u32>,
    pub minimum_throughput: Option<u32>,
    pub monitoring_period_ms: Option<u64>,
    pub reset_timeout_ms: Option<u64>,
}

impl CircuitOverride {
    fn apply_to(&self, c: &mut CircuitConfig) {
        if let Some(v) = self.failure_threshold {
            c.failure_threshold = v;
        }
        if let Some(v) = self.minimum_throughput {
            c.minimum_throughput = v;
        }
        if let Some(v) = self.monitoring_period_ms {
            c.monitoring_period_ms = v;
        }
        if let Some(v) = self.reset_timeout_ms {
            c.reset_timeout_ms = v;
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitOverride {
    pub window_ms: Option<u64>,
    pub max_requests: Option<u32>,
    pub skip_successful_requests: Option<bool>,
    pub skip_failed_requests: Option<bool>,
}

impl RateLimitOverride {
    fn apply_to(&self, r: &mut RateLimitConfig) {
        if let Some(v) = self.window_ms {
            r.window_ms = v;
        }
        if let Some(v) = self.max_requests {
            r.max_requests = v;
        }
        if let Some(v) = self.skip_successful_requests {
            r.skip_successful_requests = v;
        }
        if let Some(v) = self.skip_failed_requests {
            r.skip_failed_requests = v;
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointOverride {
    pub retry: RetryOverride,
    pub circuit_breaker: CircuitOverride,
    pub rate_limit: RateLimitOverride,
    pub timeout_ms: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceSettings {
    pub defaults: EndpointConfig,
    pub endpoints: HashMap<String, EndpointOverride>,
}

impl ResilienceSettings {
    pub fn new(defaults: EndpointConfig) -> Self {
        Self {
            defaults,
            endpoints: HashMap::new(),
        }
    }

    pub fn with_endpoint(mut self, name: impl Into<String>, o: EndpointOverride) -> Self {
        self.endpoints.insert(name.into(), o);
        self
    }

    pub fn resolve(&self, endpoint: &str) -> EndpointConfig {
        let mut config = self.defaults.clone();
        if let Some(class) = EndpointClass::from_name(endpoint) {
            config.apply(&class.builtin_override());
        }
        if let Some(o) = self.endpoints.get(endpoint) {
            config.apply(o);
        }
        config
    }

    pub fn resolve_class(&self, class: EndpointClass) -> EndpointConfig {
        self.resolve(class.as_str())
    }

    pub(crate) fn collect_errors(&self, errors: &mut Vec<ConfigError>) {
        self.defaults.collect_errors("resilience.defaults", errors);
        let names = EndpointClass::ALL
            .iter()
            .map(|c| c.as_str().to_string())
            .chain(self.endpoints.keys().cloned())
            .collect::<std::collections::BTreeSet<_>>();
        for name in names {
            self.resolve(&name)
                .collect_errors(&format!("resilience.endpoints.{name}"), errors);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_endpoint_uses_defaults() {
        let settings = ResilienceSettings::default();
        assert_eq!(settings.resolve("other"), EndpointConfig::default());
    }

    #[test]
    fn test_class_tuning() {
        let settings = ResilienceSettings::default();
        let api = settings.resolve_class(EndpointClass::GenerationApi);
        let db = settings.resolve_class(EndpointClass::Database);

        assert!(api.timeout() > db.timeout());
        assert!(api.rate_limit.max_requests < db.rate_limit.max_requests);
        assert!(api.retry.base_delay_ms > db.retry.base_delay_ms);
        assert_eq!(api.retry.max_attempts, 3);
    }

    #[test]
    fn test_user_override_wins() {
        let json = r#"{
            "defaults": { "retry": { "max_attempts": 4 } },
            "endpoints": {
                "generation_api": {
                    "circuit_breaker": { "failure_threshold": 3, "minimum_throughput": 3 },
                    "timeout_ms": 5000
                }
            }
        }"#;
        let settings: ResilienceSettings = serde_json::from_str(json).unwrap();
        let api = settings.resolve("generation_api");

        assert_eq!(api.retry.max_attempts, 4);
        assert_eq!(api.retry.base_delay_ms, 2_000);
        assert_eq!(api.circuit_breaker.failure_threshold, 3);
        assert_eq!(api.circuit_breaker.reset_timeout_ms, 30_000);
        assert_eq!(api.timeout_ms, 5000);
    }

    #[test]
    fn test_collect_errors_reports_every_problem() {
        let settings = ResilienceSettings::default().with_endpoint(
            "storage",
            EndpointOverride {
                retry: RetryOverride {
                    max_attempts: Some(0),
                    jitter_factor: Some(2.0),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        let mut errors = Vec::new();
        settings.collect_errors(&mut errors);
        assert_eq!(errors.len(), 2);
        assert!(errors[0].to_string().contains("resilience.endpoints.storage"));
    }
}
