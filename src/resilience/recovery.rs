//! Layered error recovery around a single logical call.
//!
//! Layers, outermost first: circuit breaker, rate limiter, retry, operation.
//! The breaker is consulted once per call and sees the call's final outcome.
//! The first rate-limit slot is taken before retrying starts, so a rejected
//! call never reaches the operation; every further attempt takes its own
//! slot, and a rejected retry ends the sequence.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{Either, ready};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::{
    CallOutcome, CircuitBreakerRegistry, HealthSummary, RateLimitInfo, RateLimiterRegistry,
    RetryAttempt, RetryExecutor, RetryPolicy,
};
use crate::config::{EndpointClass, ResilienceSettings};
use crate::observability::{MetricsRegistry, MetricsSummary, RecoveryRecord, recovery_span};
use crate::{Error, Result};

pub type RetryCallback = Arc<dyn Fn(&RetryAttempt) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;
pub type RateLimitCallback = Arc<dyn Fn(&RateLimitInfo) + Send + Sync>;

pub struct RecoveryOptions<T> {
    pub operation_name: String,
    pub endpoint_name: String,
    pub enable_retry: bool,
    pub enable_circuit_breaker: bool,
    pub enable_rate_limit: bool,
    /// Limiter key; the endpoint name when unset.
    pub rate_limit_key: Option<String>,
    pub fallback_result: Option<T>,
    pub on_retry: Option<RetryCallback>,
    pub on_circuit_breaker_open: Option<ErrorCallback>,
    pub on_rate_limit_exceeded: Option<RateLimitCallback>,
    pub on_fallback_used: Option<ErrorCallback>,
    pub cancel: CancellationToken,
}

impl<T> RecoveryOptions<T> {
    /// All layers enabled.
    pub fn new(operation_name: impl Into<String>, endpoint_name: impl Into<String>) -> Self {
        Self {
            operation_name: operation_name.into(),
            endpoint_name: endpoint_name.into(),
            enable_retry: true,
            enable_circuit_breaker: true,
            enable_rate_limit: true,
            rate_limit_key: None,
            fallback_result: None,
            on_retry: None,
            on_circuit_breaker_open: None,
            on_rate_limit_exceeded: None,
            on_fallback_used: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Layer defaults for an endpoint class: only the external API is rate
    /// limited.
    pub fn for_class(class: EndpointClass, operation_name: impl Into<String>) -> Self {
        Self::new(operation_name, class.as_str())
            .rate_limit(matches!(class, EndpointClass::GenerationApi))
    }

    pub fn retry(mut self, enabled: bool) -> Self {
        self.enable_retry = enabled;
        self
    }

    pub fn circuit_breaker(mut self, enabled: bool) -> Self {
        self.enable_circuit_breaker = enabled;
        self
    }

    pub fn rate_limit(mut self, enabled: bool) -> Self {
        self.enable_rate_limit = enabled;
        self
    }

    pub fn rate_limit_key(mut self, key: impl Into<String>) -> Self {
        self.rate_limit_key = Some(key.into());
        self
    }

    pub fn fallback(mut self, value: T) -> Self {
        self.fallback_result = Some(value);
        self
    }

    pub fn on_retry(mut self, f: impl Fn(&RetryAttempt) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(f));
        self
    }

    pub fn on_circuit_breaker_open(mut self, f: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.on_circuit_breaker_open = Some(Arc::new(f));
        self
    }

    pub fn on_rate_limit_exceeded(
        mut self,
        f: impl Fn(&RateLimitInfo) + Send + Sync + 'static,
    ) -> Self {
        self.on_rate_limit_exceeded = Some(Arc::new(f));
        self
    }

    pub fn on_fallback_used(mut self, f: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.on_fallback_used = Some(Arc::new(f));
        self
    }

    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn limiter_key(&self) -> &str {
        self.rate_limit_key.as_deref().unwrap_or(&self.endpoint_name)
    }
}

#[derive(Debug)]
pub struct RecoveryResult<T> {
    pub result: Result<T>,
    /// Attempts that reached the operation.
    pub retry_attempts: u32,
    pub circuit_breaker_tripped: bool,
    pub rate_limited: bool,
    pub fallback_used: bool,
    pub duration: Duration,
    pub attempts: Vec<RetryAttempt>,
}

impl<T> RecoveryResult<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn into_result(self) -> Result<T> {
        self.result
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryHealth {
    pub circuit_breakers: HealthSummary,
    pub rate_limiters: usize,
    pub metrics: MetricsSummary,
}

/// Owns the breaker and limiter registries for one process (or one test).
#[derive(Clone)]
pub struct ErrorRecovery {
    settings: Arc<ResilienceSettings>,
    circuits: CircuitBreakerRegistry,
    limiters: RateLimiterRegistry,
    metrics: Arc<MetricsRegistry>,
}

impl ErrorRecovery {
    pub fn new(settings: ResilienceSettings) -> Self {
        Self::with_metrics(settings, Arc::new(MetricsRegistry::new()))
    }

    pub fn with_metrics(settings: ResilienceSettings, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            settings: Arc::new(settings),
            circuits: CircuitBreakerRegistry::new(),
            limiters: RateLimiterRegistry::new(),
            metrics,
        }
    }

    pub fn settings(&self) -> &ResilienceSettings {
        &self.settings
    }

    pub fn circuits(&self) -> &CircuitBreakerRegistry {
        &self.circuits
    }

    pub fn limiters(&self) -> &RateLimiterRegistry {
        &self.limiters
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub async fn execute_with_recovery<T, F, Fut>(
        &self,
        mut options: RecoveryOptions<T>,
        operation: F,
    ) -> RecoveryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let span = recovery_span(&options.operation_name, &options.endpoint_name);
        let started = Instant::now();

        let mut outcome = self
            .run_layers(&options, operation)
            .instrument(span.clone())
            .await;

        if let Err(error) = &outcome.result
            && !matches!(error, Error::Cancelled)
            && let Some(fallback) = options.fallback_result.take()
        {
            if let Some(cb) = &options.on_fallback_used {
                cb(error);
            }
            tracing::warn!(
                parent: &span,
                operation = %options.operation_name,
                error = %error,
                "Using fallback result"
            );
            outcome.result = Ok(fallback);
            outcome.fallback_used = true;
        }
        outcome.duration = started.elapsed();

        span.record("success", outcome.result.is_ok());
        span.record("attempts", outcome.retry_attempts);
        self.log_outcome(&options, &outcome);
        self.metrics.record_recovery(RecoveryRecord {
            success: outcome.result.is_ok(),
            attempts: outcome.retry_attempts,
            circuit_breaker_tripped: outcome.circuit_breaker_tripped,
            rate_limited: outcome.rate_limited,
            fallback_used: outcome.fallback_used,
            duration: outcome.duration,
        });
        outcome
    }

    async fn run_layers<T, F, Fut>(
        &self,
        options: &RecoveryOptions<T>,
        mut operation: F,
    ) -> RecoveryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let config = self.settings.resolve(&options.endpoint_name);
        let mut outcome = RecoveryResult {
            result: Err(Error::Cancelled),
            retry_attempts: 0,
            circuit_breaker_tripped: false,
            rate_limited: false,
            fallback_used: false,
            duration: Duration::ZERO,
            attempts: Vec::new(),
        };
        if options.cancel.is_cancelled() {
            return outcome;
        }

        let breaker = options
            .enable_circuit_breaker
            .then(|| self.circuits.get_or_create(&options.operation_name, &config.circuit_breaker));
        if let Some(breaker) = &breaker
            && let Err(error) = breaker.try_acquire()
        {
            if let Some(cb) = &options.on_circuit_breaker_open {
                cb(&error);
            }
            outcome.circuit_breaker_tripped = true;
            outcome.result = Err(error);
            return outcome;
        }

        let key = options.limiter_key();
        let limiter = options
            .enable_rate_limit
            .then(|| self.limiters.get_or_create(key, &config.rate_limit));
        let mut first_permit = match limiter.as_ref().map(|l| l.acquire()).transpose() {
            Ok(permit) => permit,
            Err(info) => {
                if let Some(breaker) = &breaker {
                    breaker.record_outcome(CallOutcome::Ignored);
                }
                if let Some(cb) = &options.on_rate_limit_exceeded {
                    cb(&info);
                }
                outcome.rate_limited = true;
                outcome.result = Err(info.into_error(key));
                return outcome;
            }
        };

        let policy = if options.enable_retry {
            config.retry.clone()
        } else {
            RetryPolicy::single_attempt()
        };
        let executor = RetryExecutor::new(policy).with_attempt_timeout(config.timeout());

        let retry_rate_limited = AtomicBool::new(false);
        // Last error that came back from the dependency itself.
        let last_upstream: Mutex<Option<Error>> = Mutex::new(None);
        let on_limit = options.on_rate_limit_exceeded.as_ref();
        let limiter_ref = limiter.as_ref();
        let flag = &retry_rate_limited;
        let upstream = &last_upstream;

        let attempt = |attempt: u32| {
            let admitted = if attempt == 1 {
                Ok(first_permit.take())
            } else {
                limiter_ref.map(|l| l.acquire()).transpose()
            };
            match admitted {
                Err(info) => {
                    flag.store(true, Ordering::Relaxed);
                    if let Some(cb) = on_limit {
                        cb(&info);
                    }
                    Either::Left(ready(Err(info.into_error(key))))
                }
                Ok(permit) => {
                    let call = operation();
                    Either::Right(async move {
                        let result = call.await;
                        if let (Some(limiter), Some(permit)) = (limiter_ref, permit) {
                            limiter.settle(permit, call_outcome(&result));
                        }
                        *upstream.lock().unwrap_or_else(|e| e.into_inner()) =
                            result.as_ref().err().and_then(replay_upstream);
                        result
                    })
                }
            }
        };

        let on_retry = |a: &RetryAttempt| {
            if let Some(cb) = &options.on_retry {
                cb(a);
            }
        };
        let retried = executor
            .execute_with(&options.cancel, on_retry, attempt)
            .await;

        outcome.rate_limited = retry_rate_limited.load(Ordering::Relaxed);
        outcome.attempts = retried.attempts;
        // A retry rejected by the limiter never reached the operation.
        outcome.retry_attempts = outcome.attempts.len() as u32 - u32::from(outcome.rate_limited);

        let mut result = retried.result;
        if outcome.rate_limited
            && let Some(error) = last_upstream
                .into_inner()
                .unwrap_or_else(|e| e.into_inner())
        {
            // The limiter only cut the sequence short; report what the
            // dependency actually said.
            result = Err(error);
        }
        if let Some(breaker) = &breaker {
            breaker.record_outcome(call_outcome(&result));
        }
        outcome.result = result;
        outcome
    }

    fn log_outcome<T>(&self, options: &RecoveryOptions<T>, outcome: &RecoveryResult<T>) {
        let success = outcome.result.is_ok();
        let duration_ms = outcome.duration.as_millis() as u64;
        match &outcome.result {
            Ok(_) => tracing::info!(
                operation = %options.operation_name,
                endpoint = %options.endpoint_name,
                success,
                circuit_breaker_tripped = outcome.circuit_breaker_tripped,
                rate_limited = outcome.rate_limited,
                fallback_used = outcome.fallback_used,
                retry_attempts = outcome.retry_attempts,
                duration_ms,
                "Recovered call finished"
            ),
            Err(error) => tracing::warn!(
                operation = %options.operation_name,
                endpoint = %options.endpoint_name,
                success,
                circuit_breaker_tripped = outcome.circuit_breaker_tripped,
                rate_limited = outcome.rate_limited,
                fallback_used = outcome.fallback_used,
                retry_attempts = outcome.retry_attempts,
                duration_ms,
                error = %error,
                "Recovered call failed"
            ),
        }
    }

    /// External generation API: every layer enabled.
    pub async fn execute_generation_call<T, F, Fut>(
        &self,
        operation_name: &str,
        cancel: &CancellationToken,
        operation: F,
    ) -> RecoveryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let options = RecoveryOptions::for_class(EndpointClass::GenerationApi, operation_name)
            .cancel_token(cancel.clone());
        self.execute_with_recovery(options, operation).await
    }

    /// Job store access: retry and breaker, no rate limit.
    pub async fn execute_database_operation<T, F, Fut>(
        &self,
        operation_name: &str,
        operation: F,
    ) -> RecoveryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let options = RecoveryOptions::for_class(EndpointClass::Database, operation_name);
        self.execute_with_recovery(options, operation).await
    }

    /// Asset storage: retry and breaker, no rate limit.
    pub async fn execute_storage_operation<T, F, Fut>(
        &self,
        operation_name: &str,
        operation: F,
    ) -> RecoveryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let options = RecoveryOptions::for_class(EndpointClass::Storage, operation_name);
        self.execute_with_recovery(options, operation).await
    }

    pub fn health(&self) -> RecoveryHealth {
        RecoveryHealth {
            circuit_breakers: self.circuits.health_summary(),
            rate_limiters: self.limiters.len(),
            metrics: self.metrics.summary(),
        }
    }

    /// Administrative reset: closes every breaker and drops limiter state.
    pub fn reset_all(&self) {
        self.circuits.reset_all();
        self.limiters.destroy_all();
    }
}

impl Default for ErrorRecovery {
    fn default() -> Self {
        Self::new(ResilienceSettings::default())
    }
}

/// Copy of an error that earned a retry. Only retryable errors get that far,
/// and both kinds are cheap to rebuild.
fn replay_upstream(error: &Error) -> Option<Error> {
    match error {
        Error::Generation(e) => Some(Error::Generation(e.clone())),
        Error::Timeout(d) => Some(Error::Timeout(*d)),
        _ => None,
    }
}

/// How an attempt's result counts for breaker and limiter accounting.
fn call_outcome<T>(result: &Result<T>) -> CallOutcome {
    match result {
        Ok(_) => CallOutcome::Success,
        Err(e) if e.is_local_rejection() => CallOutcome::Ignored,
        Err(e) if e.trips_circuit() => CallOutcome::Failure,
        // The dependency answered; the request itself was bad.
        Err(_) => CallOutcome::Success,
    }
}
