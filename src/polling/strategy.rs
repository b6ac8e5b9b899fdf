//! Named polling strategies.
//!
//! Strategies are evaluated in order after each poll and the first match
//! wins. A strategy's interval is applied only when the active strategy
//! changes; between changes the adaptive slow-down and speed-up rules own
//! the interval.

use std::time::Duration;

use super::{PollingConfig, PollingJob};
use crate::jobs::{JobPriority, JobStatus};

pub struct PollingStrategy {
    pub name: &'static str,
    condition: fn(&PollingJob, &PollingConfig) -> bool,
    interval: fn(&PollingJob, &PollingConfig) -> Duration,
    pub priority: JobPriority,
}

impl PollingStrategy {
    pub fn new(
        name: &'static str,
        priority: JobPriority,
        condition: fn(&PollingJob, &PollingConfig) -> bool,
        interval: fn(&PollingJob, &PollingConfig) -> Duration,
    ) -> Self {
        Self {
            name,
            condition,
            interval,
            priority,
        }
    }

    pub fn matches(&self, job: &PollingJob, config: &PollingConfig) -> bool {
        (self.condition)(job, config)
    }

    pub fn interval(&self, job: &PollingJob, config: &PollingConfig) -> Duration {
        (self.interval)(job, config)
    }
}

impl std::fmt::Debug for PollingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingStrategy")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish()
    }
}

pub fn default_strategies() -> Vec<PollingStrategy> {
    vec![
        PollingStrategy::new(
            "fast-active",
            JobPriority::High,
            |job, config| {
                job.last_status == JobStatus::Processing
                    && job.consecutive_errors == 0
                    && job.consecutive_no_changes < config.no_change_threshold
            },
            |_, config| config.fast_interval(),
        ),
        PollingStrategy::new(
            "normal-queued",
            JobPriority::Normal,
            |job, config| {
                matches!(job.last_status, JobStatus::Pending | JobStatus::Queued)
                    && job.consecutive_errors == 0
                    && job.consecutive_no_changes < config.no_change_threshold
            },
            |_, config| config.base_interval(),
        ),
        PollingStrategy::new(
            "slow-stable",
            JobPriority::Low,
            |job, config| {
                job.consecutive_errors == 0
                    && job.consecutive_no_changes >= config.no_change_threshold
            },
            |_, config| config.slow_interval(),
        ),
        PollingStrategy::new(
            "adaptive-on-errors",
            JobPriority::Low,
            |job, _| job.consecutive_errors > 0,
            |job, config| config.error_backoff(job.consecutive_errors),
        ),
    ]
}

/// First strategy whose condition holds.
pub fn select<'a>(
    strategies: &'a [PollingStrategy],
    job: &PollingJob,
    config: &PollingConfig,
) -> Option<&'a PollingStrategy> {
    strategies.iter().find(|s| s.matches(job, config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobId;

    fn polling_job(status: JobStatus) -> PollingJob {
        PollingJob::new(
            JobId::from("s1"),
            status,
            JobPriority::Normal,
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_first_match_wins() {
        let config = PollingConfig::default();
        let strategies = default_strategies();

        let job = polling_job(JobStatus::Processing);
        assert_eq!(select(&strategies, &job, &config).map(|s| s.name), Some("fast-active"));

        let job = polling_job(JobStatus::Queued);
        assert_eq!(select(&strategies, &job, &config).map(|s| s.name), Some("normal-queued"));

        let mut job = polling_job(JobStatus::Processing);
        job.consecutive_no_changes = config.no_change_threshold;
        assert_eq!(select(&strategies, &job, &config).map(|s| s.name), Some("slow-stable"));

        let mut job = polling_job(JobStatus::Processing);
        job.consecutive_errors = 2;
        let strategy = select(&strategies, &job, &config).expect("strategy");
        assert_eq!(strategy.name, "adaptive-on-errors");
        assert_eq!(strategy.interval(&job, &config), Duration::from_secs(20));
    }

    #[test]
    fn test_terminal_status_matches_nothing_active() {
        let config = PollingConfig::default();
        let strategies = default_strategies();
        let job = polling_job(JobStatus::Completed);
        assert!(select(&strategies, &job, &config).is_none());
    }

    #[test]
    fn test_custom_strategy() {
        let config = PollingConfig::default();
        let strategies = vec![PollingStrategy::new(
            "steady",
            JobPriority::Urgent,
            |job, _| !job.last_status.is_terminal(),
            |_, _| Duration::from_millis(250),
        )];

        let job = polling_job(JobStatus::Pending);
        let strategy = select(&strategies, &job, &config).expect("strategy");
        assert_eq!(strategy.name, "steady");
        assert_eq!(strategy.priority, JobPriority::Urgent);
        assert_eq!(strategy.interval(&job, &config), Duration::from_millis(250));
    }
}
