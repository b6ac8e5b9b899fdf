//! In-process metrics.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Thread-safe atomic counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Thread-safe atomic gauge.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Simple histogram using fixed buckets.
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    bucket_bounds: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(bucket_bounds: Vec<f64>) -> Self {
        let buckets = (0..=bucket_bounds.len())
            .map(|_| AtomicU64::new(0))
            .collect();
        Self {
            buckets,
            bucket_bounds,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Millisecond buckets sized for calls that may retry for minutes.
    pub fn default_latency() -> Self {
        Self::new(vec![
            10.0, 50.0, 100.0, 500.0, 1_000.0, 5_000.0, 15_000.0, 30_000.0, 60_000.0, 120_000.0,
        ])
    }

    pub fn observe(&self, value: f64) {
        let bucket_idx = self
            .bucket_bounds
            .iter()
            .position(|&bound| value <= bound)
            .unwrap_or(self.bucket_bounds.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        self.sum
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_duration(&self, duration: Duration) {
        self.observe(duration.as_secs_f64() * 1000.0);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn bucket_counts(&self) -> Vec<u64> {
        self.buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect()
    }

    /// Returns the sum as a floating-point value in the original unit (ms).
    ///
    /// The internal sum is stored scaled by 1000x to preserve sub-integer
    /// precision. This method converts back to the original scale.
    pub fn sum_ms(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn mean_ms(&self) -> f64 {
        match self.count() {
            0 => 0.0,
            n => self.sum_ms() / n as f64,
        }
    }
}

/// Outcome flags of one recovered call, as the metrics registry sees it.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryRecord {
    pub success: bool,
    pub attempts: u32,
    pub circuit_breaker_tripped: bool,
    pub rate_limited: bool,
    pub fallback_used: bool,
    pub duration: Duration,
}

/// Process-level metrics for the orchestration core.
#[derive(Debug)]
pub struct MetricsRegistry {
    pub recovery_calls: Counter,
    pub recovery_success: Counter,
    pub recovery_failure: Counter,
    pub retry_attempts: Counter,
    pub circuit_rejections: Counter,
    pub rate_limit_rejections: Counter,
    pub fallbacks_used: Counter,
    pub recovery_latency_ms: Histogram,
    pub jobs_submitted: Counter,
    pub jobs_completed: Counter,
    pub jobs_failed: Counter,
    pub jobs_cancelled: Counter,
    pub jobs_requeued: Counter,
    pub jobs_in_flight: Gauge,
    pub polls_total: Counter,
    pub poll_errors: Counter,
    pub polled_jobs: Gauge,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            recovery_calls: Counter::new(),
            recovery_success: Counter::new(),
            recovery_failure: Counter::new(),
            retry_attempts: Counter::new(),
            circuit_rejections: Counter::new(),
            rate_limit_rejections: Counter::new(),
            fallbacks_used: Counter::new(),
            recovery_latency_ms: Histogram::default_latency(),
            jobs_submitted: Counter::new(),
            jobs_completed: Counter::new(),
            jobs_failed: Counter::new(),
            jobs_cancelled: Counter::new(),
            jobs_requeued: Counter::new(),
            jobs_in_flight: Gauge::new(),
            polls_total: Counter::new(),
            poll_errors: Counter::new(),
            polled_jobs: Gauge::new(),
        }
    }

    pub fn record_recovery(&self, record: RecoveryRecord) {
        self.recovery_calls.inc();
        if record.success {
            self.recovery_success.inc();
        } else {
            self.recovery_failure.inc();
        }
        self.retry_attempts
            .add(record.attempts.saturating_sub(1) as u64);
        if record.circuit_breaker_tripped {
            self.circuit_rejections.inc();
        }
        if record.rate_limited {
            self.rate_limit_rejections.inc();
        }
        if record.fallback_used {
            self.fallbacks_used.inc();
        }
        self.recovery_latency_ms.observe_duration(record.duration);
    }

    pub fn record_poll(&self, success: bool) {
        self.polls_total.inc();
        if !success {
            self.poll_errors.inc();
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary::from_registry(self)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot for export/display.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSummary {
    pub recovery_calls: u64,
    pub recovery_success: u64,
    pub recovery_failure: u64,
    pub retries: u64,
    pub circuit_rejections: u64,
    pub rate_limit_rejections: u64,
    pub fallbacks_used: u64,
    pub avg_recovery_latency_ms: f64,
    pub jobs_submitted: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub jobs_requeued: u64,
    pub jobs_in_flight: i64,
    pub polls: u64,
    pub poll_errors: u64,
    pub polled_jobs: i64,
}

impl MetricsSummary {
    pub fn from_registry(registry: &MetricsRegistry) -> Self {
        Self {
            recovery_calls: registry.recovery_calls.get(),
            recovery_success: registry.recovery_success.get(),
            recovery_failure: registry.recovery_failure.get(),
            retries: registry.retry_attempts.get(),
            circuit_rejections: registry.circuit_rejections.get(),
            rate_limit_rejections: registry.rate_limit_rejections.get(),
            fallbacks_used: registry.fallbacks_used.get(),
            avg_recovery_latency_ms: registry.recovery_latency_ms.mean_ms(),
            jobs_submitted: registry.jobs_submitted.get(),
            jobs_completed: registry.jobs_completed.get(),
            jobs_failed: registry.jobs_failed.get(),
            jobs_cancelled: registry.jobs_cancelled.get(),
            jobs_requeued: registry.jobs_requeued.get(),
            jobs_in_flight: registry.jobs_in_flight.get(),
            polls: registry.polls_total.get(),
            poll_errors: registry.poll_errors.get(),
            polled_jobs: registry.polled_jobs.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new();
        assert_eq!(counter.get(), 0);
        counter.inc();
        assert_eq!(counter.get(), 1);
        counter.add(5);
        assert_eq!(counter.get(), 6);
    }

    #[test]
    fn test_gauge() {
        let gauge = Gauge::new();
        gauge.set(10);
        gauge.inc();
        assert_eq!(gauge.get(), 11);
        gauge.dec();
        assert_eq!(gauge.get(), 10);
    }

    #[test]
    fn test_histogram() {
        let hist = Histogram::new(vec![10.0, 50.0, 100.0]);
        hist.observe(5.0);
        hist.observe(25.0);
        hist.observe(75.0);
        hist.observe(150.0);
        assert_eq!(hist.count(), 4);
        assert_eq!(hist.bucket_counts(), vec![1, 1, 1, 1]);
        assert_eq!(hist.mean_ms(), 63.75);
    }

    #[test]
    fn test_record_recovery() {
        let registry = MetricsRegistry::default();
        registry.record_recovery(RecoveryRecord {
            success: true,
            attempts: 3,
            duration: Duration::from_millis(250),
            ..Default::default()
        });
        registry.record_recovery(RecoveryRecord {
            success: false,
            attempts: 0,
            rate_limited: true,
            ..Default::default()
        });

        let summary = registry.summary();
        assert_eq!(summary.recovery_calls, 2);
        assert_eq!(summary.recovery_success, 1);
        assert_eq!(summary.recovery_failure, 1);
        assert_eq!(summary.retries, 2);
        assert_eq!(summary.rate_limit_rejections, 1);
    }
}
