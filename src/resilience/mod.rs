//! Resilience layer for calls to downstream dependencies.
//!
//! Provides retry with exponential backoff, a windowed circuit breaker, a
//! fixed-window rate limiter, and [`ErrorRecovery`], which composes the three
//! around a single call.

mod backoff;
mod circuit;
mod rate_limit;
mod recovery;
mod retry;

pub use backoff::ExponentialBackoff;
pub use circuit::{
    CallOutcome, CircuitBreaker, CircuitBreakerRegistry, CircuitConfig, CircuitSnapshot,
    CircuitState, HealthSummary,
};
pub use rate_limit::{
    RateLimitConfig, RateLimitInfo, RateLimitPermit, RateLimiter, RateLimiterRegistry,
};
pub use recovery::{
    ErrorCallback, ErrorRecovery, RateLimitCallback, RecoveryHealth, RecoveryOptions,
    RecoveryResult, RetryCallback,
};
pub use retry::{RetryAttempt, RetryExecutor, RetryOutcome, RetryPolicy};
