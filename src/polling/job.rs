//! Per-job polling state.

use std::time::Duration;

use tokio::time::Instant;

use super::PollingConfig;
use crate::jobs::{JobId, JobPriority, JobStatus};

/// Bookkeeping for one actively polled job.
#[derive(Debug, Clone)]
pub struct PollingJob {
    pub job_id: JobId,
    pub last_polled_at: Option<Instant>,
    pub poll_count: u64,
    pub interval: Duration,
    pub priority: JobPriority,
    /// Priority of the job itself; strategies never drop below it.
    pub base_priority: JobPriority,
    pub consecutive_errors: u32,
    pub consecutive_no_changes: u32,
    pub created_at: Instant,
    pub last_status_change_at: Instant,
    pub last_status: JobStatus,
    pub strategy: Option<&'static str>,
    pub in_flight: bool,
}

impl PollingJob {
    pub fn new(job_id: JobId, status: JobStatus, priority: JobPriority, interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            job_id,
            last_polled_at: None,
            poll_count: 0,
            interval,
            priority,
            base_priority: priority,
            consecutive_errors: 0,
            consecutive_no_changes: 0,
            created_at: now,
            last_status_change_at: now,
            last_status: status,
            strategy: None,
            in_flight: false,
        }
    }

    /// Due when a full interval has passed since the last poll (or since the
    /// job was added, before its first poll).
    pub fn is_due(&self, now: Instant) -> bool {
        !self.in_flight
            && now.saturating_duration_since(self.last_polled_at.unwrap_or(self.created_at))
                >= self.interval
    }

    /// Time since the last poll; never-polled jobs count from creation.
    pub fn staleness(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_polled_at.unwrap_or(self.created_at))
    }

    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_status_change_at) > timeout
    }

    pub fn is_exhausted(&self, config: &PollingConfig) -> bool {
        self.consecutive_errors >= config.max_errors
    }

    /// Same status as last time: poll less often.
    pub(crate) fn record_unchanged(&mut self, config: &PollingConfig, now: Instant) {
        self.mark_polled(now);
        self.consecutive_errors = 0;
        self.consecutive_no_changes += 1;
        self.interval = self
            .interval
            .mul_f64(config.slowdown_factor)
            .min(config.slow_interval());
    }

    /// Status moved: poll a little more often.
    pub(crate) fn record_changed(&mut self, status: JobStatus, config: &PollingConfig, now: Instant) {
        self.mark_polled(now);
        self.consecutive_errors = 0;
        self.consecutive_no_changes = 0;
        self.last_status = status;
        self.last_status_change_at = now;
        self.interval = self
            .interval
            .mul_f64(config.speedup_factor)
            .max(config.fast_interval());
    }

    pub(crate) fn record_error(&mut self, config: &PollingConfig, now: Instant) {
        self.mark_polled(now);
        self.consecutive_errors += 1;
        self.interval = config.error_backoff(self.consecutive_errors);
    }

    fn mark_polled(&mut self, now: Instant) {
        self.last_polled_at = Some(now);
        self.poll_count += 1;
        self.in_flight = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(interval_ms: u64) -> PollingJob {
        PollingJob::new(
            JobId::from("p1"),
            JobStatus::Processing,
            JobPriority::Normal,
            Duration::from_millis(interval_ms),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_polls_slow_down_until_cap() {
        let config = PollingConfig::default();
        let mut job = job(5000);
        let now = Instant::now();

        let mut previous = job.interval;
        for _ in 0..5 {
            job.record_unchanged(&config, now);
            assert!(job.interval >= previous);
            assert!(job.interval <= config.slow_interval());
            previous = job.interval;
        }
        assert_eq!(job.consecutive_no_changes, 5);
        assert!(job.interval > Duration::from_millis(5000));

        for _ in 0..20 {
            job.record_unchanged(&config, now);
        }
        assert_eq!(job.interval, config.slow_interval());
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_resets_counter_and_speeds_up() {
        let config = PollingConfig::default();
        let mut job = job(5000);
        let now = Instant::now();
        for _ in 0..3 {
            job.record_unchanged(&config, now);
        }
        let before = job.interval;

        job.record_changed(JobStatus::Completed, &config, now);
        assert_eq!(job.consecutive_no_changes, 0);
        assert!(job.interval < before);
        assert!(job.interval >= config.fast_interval());
        assert_eq!(job.last_status, JobStatus::Completed);

        for _ in 0..10 {
            job.record_changed(JobStatus::Completed, &config, now);
        }
        assert_eq!(job.interval, config.fast_interval());
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_back_off_exponentially() {
        let config = PollingConfig::default();
        let mut job = job(5000);
        let now = Instant::now();

        job.record_error(&config, now);
        assert_eq!(job.interval, Duration::from_secs(10));
        job.record_error(&config, now);
        assert_eq!(job.interval, Duration::from_secs(20));
        for _ in 0..5 {
            job.record_error(&config, now);
        }
        assert_eq!(job.interval, config.max_backoff());
        assert!(job.is_exhausted(&config));
    }

    #[tokio::test(start_paused = true)]
    async fn test_due_after_interval() {
        let job = job(1000);
        assert!(!job.is_due(Instant::now()));
        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(job.is_due(Instant::now()));

        let mut busy = job.clone();
        busy.in_flight = true;
        assert!(!busy.is_due(Instant::now()));
    }
}
