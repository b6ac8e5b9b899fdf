//! Sequential retry with backoff.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::ExponentialBackoff;
use crate::jobs::ErrorCode;
use crate::{Error, Result};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay_ms = base.as_millis() as u64;
        self.max_delay_ms = max.as_millis() as u64;
        self
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.backoff_multiplier,
        )
        .with_jitter(self.jitter_factor)
    }
}

/// One attempt of a retried call.
#[derive(Clone, Debug, Serialize)]
pub struct RetryAttempt {
    /// 1-based.
    pub attempt: u32,
    /// Wait applied before this attempt started.
    pub delay: Duration,
    pub error: Option<String>,
    pub code: Option<ErrorCode>,
    pub at: DateTime<Utc>,
}

impl RetryAttempt {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T>,
    pub attempts: Vec<RetryAttempt>,
}

impl<T> RetryOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }
}

#[derive(Clone, Debug)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    backoff: ExponentialBackoff,
    attempt_timeout: Option<Duration>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        let backoff = policy.backoff();
        Self {
            policy,
            backoff,
            attempt_timeout: None,
        }
    }

    /// Bounds every attempt; an attempt that overruns fails with
    /// [`Error::Timeout`], which is retryable.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn execute<T, F, Fut>(&self, cancel: &CancellationToken, operation: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with(cancel, |_| {}, operation).await
    }

    /// Runs `operation(attempt)` until it succeeds, fails with a
    /// non-retryable error, or `max_attempts` is reached. `on_retry` sees each
    /// failed attempt that is about to be retried.
    pub async fn execute_with<T, F, Fut, R>(
        &self,
        cancel: &CancellationToken,
        mut on_retry: R,
        mut operation: F,
    ) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        R: FnMut(&RetryAttempt),
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempts = Vec::new();
        let mut delay = Duration::ZERO;
        let mut attempt = 1;

        loop {
            if cancel.is_cancelled() {
                return RetryOutcome {
                    result: Err(Error::Cancelled),
                    attempts,
                };
            }

            let started = Utc::now();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::Cancelled),
                result = self.run_attempt(operation(attempt)) => result,
            };

            let error = match result {
                Ok(value) => {
                    attempts.push(RetryAttempt {
                        attempt,
                        delay,
                        error: None,
                        code: None,
                        at: started,
                    });
                    return RetryOutcome {
                        result: Ok(value),
                        attempts,
                    };
                }
                Err(e) => e,
            };

            let record = RetryAttempt {
                attempt,
                delay,
                error: Some(error.to_string()),
                code: Some(error.code()),
                at: started,
            };
            attempts.push(record);

            if attempt >= max_attempts || !error.is_retryable() {
                return RetryOutcome {
                    result: Err(error),
                    attempts,
                };
            }

            delay = self.delay_after(attempt, &error);
            tracing::warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying after failure"
            );
            if let Some(last) = attempts.last() {
                on_retry(last);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return RetryOutcome {
                        result: Err(Error::Cancelled),
                        attempts,
                    };
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    async fn run_attempt<T>(&self, attempt: impl Future<Output = Result<T>>) -> Result<T> {
        match self.attempt_timeout {
            Some(limit) => tokio::time::timeout(limit, attempt)
                .await
                .unwrap_or(Err(Error::Timeout(limit))),
            None => attempt.await,
        }
    }

    /// Backoff for `attempt`, stretched to an upstream `Retry-After` hint but
    /// never past the policy's maximum.
    fn delay_after(&self, attempt: u32, error: &Error) -> Duration {
        let computed = self.backoff.delay_for(attempt);
        match error.retry_after() {
            Some(hint) => hint.max(computed).min(self.backoff.max()),
            None => computed,
        }
    }
}
