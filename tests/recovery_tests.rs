//! Recovery Tests
//!
//! End-to-end behaviour of the layered recovery pipeline: retries through
//! transient upstream failures, breaker opening on persistent auth errors,
//! and local rate limiting.
//!
//! Run: cargo nextest run --test recovery_tests

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use common::{ScriptedClient, harness, quick_retries, request};
use genflow::config::{EndpointConfig, EndpointOverride, RateLimitOverride};
use genflow::resilience::ExponentialBackoff;
use genflow::{
    CircuitState, Error, ErrorCode, ErrorRecovery, GenerationError, JobStatus, RateLimitConfig,
    RateLimiterRegistry, RecoveryOptions, ResilienceSettings, RetryPolicy,
};

// =============================================================================
// Workflow scenarios
// =============================================================================

mod scenario_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_then_success() {
        let h = harness(ScriptedClient::failing(503, 2), quick_retries(3));
        let job = h.workflow.submit_character(request()).await.unwrap();

        let job = h.workflow.process(&job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.results[0].retry_attempts, 3);
        assert_eq!(h.client.calls(), 3);

        let summary = h.workflow.recovery().metrics().summary();
        assert_eq!(summary.recovery_success, 1);
        assert_eq!(summary.retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failures_open_the_breaker() {
        let h = harness(ScriptedClient::failing(401, 3), quick_retries(3));

        for _ in 0..3 {
            let job = h.workflow.submit_single(request()).await.unwrap();
            let job = h.workflow.process(&job.id).await.unwrap();
            assert_eq!(job.status, JobStatus::Failed);
        }
        assert_eq!(h.client.calls(), 3);

        let breaker = h
            .workflow
            .recovery()
            .circuits()
            .get("generate")
            .expect("breaker registered");
        assert_eq!(breaker.state(), CircuitState::Open);

        // Rejected locally: no outbound call, job goes back to pending.
        let job = h.workflow.submit_single(request()).await.unwrap();
        let job = h.workflow.process(&job.id).await.unwrap();
        assert_eq!(h.client.calls(), 3);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.error.unwrap().code, ErrorCode::CircuitBreakerOpen);
        assert_eq!(h.workflow.recovery().metrics().summary().circuit_rejections, 1);
    }
}

// =============================================================================
// Recovery layers
// =============================================================================

mod layer_tests {
    use super::*;

    fn limited(max_requests: u32) -> ErrorRecovery {
        let defaults = EndpointConfig::default().with_retry(
            RetryPolicy::default()
                .with_delays(Duration::from_millis(10), Duration::from_millis(50))
                .with_jitter(0.0),
        );
        ErrorRecovery::new(ResilienceSettings::new(defaults).with_endpoint(
            "limited",
            EndpointOverride {
                rate_limit: RateLimitOverride {
                    max_requests: Some(max_requests),
                    ..Default::default()
                },
                ..Default::default()
            },
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_call_never_runs_operation() {
        let recovery = limited(1);
        let calls = Arc::new(AtomicU32::new(0));
        let rejections = Arc::new(AtomicU32::new(0));

        let run = |calls: Arc<AtomicU32>| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Error>("done")
        };

        let first = recovery
            .execute_with_recovery(RecoveryOptions::new("op", "limited"), || run(calls.clone()))
            .await;
        assert!(first.is_success());

        let seen = rejections.clone();
        let options = RecoveryOptions::new("op", "limited").on_rate_limit_exceeded(move |info| {
            assert!(!info.allowed);
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let second = recovery
            .execute_with_recovery(options, || run(calls.clone()))
            .await;

        assert!(second.rate_limited);
        assert_eq!(second.retry_attempts, 0);
        assert!(matches!(second.result, Err(Error::RateLimited { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(rejections.load(Ordering::SeqCst), 1);

        // A local rejection is not a failure of the dependency.
        let breaker = recovery.circuits().get("op").unwrap();
        assert_eq!(breaker.snapshot().window_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_tripping_error_is_not_retried() {
        let recovery = limited(100);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let outcome = recovery
            .execute_with_recovery(RecoveryOptions::new("lookup", "limited"), || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::Generation(GenerationError::from_status(404, "gone"))) }
            })
            .await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.retry_attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let breaker = recovery.circuits().get("lookup").unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_limiter_allows_ten_then_rejects() {
        let registry = RateLimiterRegistry::default();
        let config = RateLimitConfig::new(10, Duration::from_secs(1));

        for i in 0..10 {
            let info = registry.check_limit("api", &config);
            assert!(info.allowed, "request {i} should be allowed");
        }
        let info = registry.check_limit("api", &config);
        assert!(!info.allowed);
        assert_eq!(info.remaining, 0);
        assert!(info.retry_after.is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(registry.check_limit("api", &config).allowed);
    }

    #[test]
    fn test_backoff_stays_within_bounds() {
        let backoff = ExponentialBackoff::new(
            Duration::from_millis(100),
            Duration::from_secs(2),
            2.0,
        )
        .with_jitter(0.5);

        for attempt in 1..=20 {
            for _ in 0..20 {
                let delay = backoff.delay_for(attempt);
                assert!(delay <= Duration::from_secs(2), "attempt {attempt}: {delay:?}");
            }
        }
    }
}
