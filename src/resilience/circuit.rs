//! Circuit breaker with a windowed failure count.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Failures within the monitoring period that open the circuit.
    pub failure_threshold: u32,
    /// Calls that must be observed in the monitoring period before the
    /// circuit may open at all.
    pub minimum_throughput: u32,
    pub monitoring_period_ms: u64,
    pub reset_timeout_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            minimum_throughput: 10,
            monitoring_period_ms: 60_000,
            reset_timeout_ms: 30_000,
        }
    }
}

impl CircuitConfig {
    pub fn monitoring_period(&self) -> Duration {
        Duration::from_millis(self.monitoring_period_ms)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

/// How a guarded call ended, from the breaker's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
    /// The call never reached the dependency (rejected locally or
    /// cancelled). Counts for nothing but frees a half-open trial slot.
    Ignored,
}

#[derive(Clone, Debug, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub window_calls: u32,
    pub window_failures: u32,
    pub total_calls: u64,
    pub total_failures: u64,
    pub rejected: u64,
    pub last_transition_at: DateTime<Utc>,
    pub config: CircuitConfig,
}

struct Inner {
    state: CircuitState,
    window: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    last_transition_at: DateTime<Utc>,
    total_calls: u64,
    total_failures: u64,
    rejected: u64,
}

impl Inner {
    fn prune(&mut self, now: Instant, period: Duration) {
        while let Some((at, _)) = self.window.front() {
            if now.duration_since(*at) >= period {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn failures(&self) -> u32 {
        self.window.iter().filter(|(_, failed)| *failed).count() as u32
    }

    fn transition(&mut self, to: CircuitState, now: Instant) {
        self.state = to;
        self.trial_in_flight = false;
        self.last_transition_at = Utc::now();
        match to {
            CircuitState::Open => self.opened_at = Some(now),
            CircuitState::Closed => {
                self.opened_at = None;
                self.window.clear();
            }
            CircuitState::HalfOpen => {}
        }
    }
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                window: VecDeque::new(),
                opened_at: None,
                trial_in_flight: false,
                last_transition_at: Utc::now(),
                total_calls: 0,
                total_failures: 0,
                rejected: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    pub fn allow_request(&self) -> bool {
        self.try_acquire().is_ok()
    }

    /// Admits a call or rejects it with [`Error::CircuitOpen`]. A half-open
    /// circuit admits exactly one trial call until its outcome is recorded.
    pub fn try_acquire(&self) -> Result<()> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.refresh(&mut inner, now);

        let state = inner.state;
        let retry_in = match state {
            CircuitState::Closed => return Ok(()),
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                tracing::debug!(circuit = %self.name, "Admitting half-open trial");
                return Ok(());
            }
            CircuitState::HalfOpen => Duration::ZERO,
            CircuitState::Open => inner
                .opened_at
                .map(|at| self.config.reset_timeout().saturating_sub(now.duration_since(at)))
                .unwrap_or_default(),
        };

        inner.rejected += 1;
        Err(Error::CircuitOpen {
            operation: self.name.clone(),
            retry_in,
        })
    }

    pub fn record_success(&self) {
        self.record_outcome(CallOutcome::Success);
    }

    pub fn record_failure(&self) {
        self.record_outcome(CallOutcome::Failure);
    }

    pub fn record_outcome(&self, outcome: CallOutcome) {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if outcome == CallOutcome::Ignored {
            if inner.state == CircuitState::HalfOpen {
                inner.trial_in_flight = false;
            }
            return;
        }

        let failed = outcome == CallOutcome::Failure;
        inner.total_calls += 1;
        if failed {
            inner.total_failures += 1;
        }

        let state = inner.state;
        match state {
            CircuitState::Closed => {
                inner.window.push_back((now, failed));
                inner.prune(now, self.config.monitoring_period());
                let calls = inner.window.len() as u32;
                let failures = inner.failures();
                if failed
                    && failures >= self.config.failure_threshold
                    && calls >= self.config.minimum_throughput
                {
                    inner.transition(CircuitState::Open, now);
                    tracing::warn!(
                        circuit = %self.name,
                        failures,
                        calls,
                        "Circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen if failed => {
                inner.transition(CircuitState::Open, now);
                tracing::warn!(circuit = %self.name, "Half-open trial failed, circuit reopened");
            }
            CircuitState::HalfOpen => {
                inner.transition(CircuitState::Closed, now);
                tracing::info!(circuit = %self.name, "Circuit breaker closed");
            }
            // Late results from calls admitted before the circuit opened.
            CircuitState::Open => {}
        }
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.refresh(&mut inner, now);
        inner.prune(now, self.config.monitoring_period());
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            window_calls: inner.window.len() as u32,
            window_failures: inner.failures(),
            total_calls: inner.total_calls,
            total_failures: inner.total_failures,
            rejected: inner.rejected,
            last_transition_at: inner.last_transition_at,
            config: self.config.clone(),
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.transition(CircuitState::Closed, Instant::now());
    }

    fn refresh(&self, inner: &mut Inner, now: Instant) {
        if inner.state == CircuitState::Open
            && inner
                .opened_at
                .is_some_and(|at| now.duration_since(at) >= self.config.reset_timeout())
        {
            inner.transition(CircuitState::HalfOpen, now);
            tracing::info!(circuit = %self.name, "Circuit breaker half-open");
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub healthy_percentage: f64,
    pub breakers: Vec<CircuitSnapshot>,
}

/// One breaker per operation name.
#[derive(Clone, Default)]
pub struct CircuitBreakerRegistry {
    breakers: Arc<DashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the breaker for `name`, creating it with `config` on first use.
    /// Later calls return the same instance and ignore `config`.
    pub fn get_or_create(&self, name: &str, config: &CircuitConfig) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return existing.clone();
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config.clone())))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| b.clone())
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    pub fn health_summary(&self) -> HealthSummary {
        let mut breakers: Vec<CircuitSnapshot> =
            self.breakers.iter().map(|b| b.snapshot()).collect();
        breakers.sort_by(|a, b| a.name.cmp(&b.name));

        let total = breakers.len();
        let healthy = breakers
            .iter()
            .filter(|b| b.state == CircuitState::Closed)
            .count();
        let healthy_percentage = if total == 0 {
            100.0
        } else {
            healthy as f64 / total as f64 * 100.0
        };

        HealthSummary {
            total,
            healthy,
            unhealthy: total - healthy,
            healthy_percentage,
            breakers,
        }
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.iter() {
            breaker.reset();
        }
        tracing::info!(count = self.breakers.len(), "All circuit breakers reset");
    }
}
