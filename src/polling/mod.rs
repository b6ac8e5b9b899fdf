//! Adaptive status polling for jobs without push notifications.
//!
//! A fixed-tick scheduler polls each watched job once its interval has
//! elapsed. Intervals stretch while a job sits still, shrink when it moves,
//! and back off exponentially on poll failures. Observed changes are written
//! to the [`JobStore`] first and then mirrored into the [`StatusTracker`].

mod job;
mod strategy;

pub use job::PollingJob;
pub use strategy::{PollingStrategy, default_strategies};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

use crate::client::{JobStatusSource, RemoteStatus};
use crate::config::{ConfigError, invalid};
use crate::events::{JobEvent, PollingStopReason};
use crate::jobs::{
    ErrorCode, ErrorInfo, Job, JobId, JobPatch, JobProgress, JobResult, JobStatus, JobStore,
    ProgressStage,
};
use crate::observability::{MetricsRegistry, poll_span};
use crate::tracking::StatusTracker;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub tick_interval_ms: u64,
    pub base_interval_ms: u64,
    pub fast_interval_ms: u64,
    pub slow_interval_ms: u64,
    pub max_backoff_ms: u64,
    pub max_concurrent_polls: usize,
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    /// Upper bound on a single status fetch; an overrun counts as a poll error.
    pub poll_timeout_ms: u64,
    /// Consecutive failures before a job is dropped from polling.
    pub max_errors: u32,
    /// Jobs whose status has not moved for this long are dropped.
    pub stale_job_timeout_ms: u64,
    pub cleanup_interval_ms: u64,
    pub slowdown_factor: f64,
    pub speedup_factor: f64,
    pub no_change_threshold: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            base_interval_ms: 5_000,
            fast_interval_ms: 2_000,
            slow_interval_ms: 30_000,
            max_backoff_ms: 60_000,
            max_concurrent_polls: 10,
            batch_size: 5,
            batch_delay_ms: 100,
            poll_timeout_ms: 30_000,
            max_errors: 5,
            stale_job_timeout_ms: 30 * 60 * 1_000,
            cleanup_interval_ms: 60_000,
            slowdown_factor: 1.5,
            speedup_factor: 0.5,
            no_change_threshold: 5,
        }
    }
}

impl PollingConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn base_interval(&self) -> Duration {
        Duration::from_millis(self.base_interval_ms)
    }

    pub fn fast_interval(&self) -> Duration {
        Duration::from_millis(self.fast_interval_ms)
    }

    pub fn slow_interval(&self) -> Duration {
        Duration::from_millis(self.slow_interval_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn stale_job_timeout(&self) -> Duration {
        Duration::from_millis(self.stale_job_timeout_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    /// `min(max_backoff, base * 2^errors)`.
    pub fn error_backoff(&self, errors: u32) -> Duration {
        let factor = 1u64.checked_shl(errors).unwrap_or(u64::MAX);
        Duration::from_millis(
            self.base_interval_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }

    pub(crate) fn collect_errors(&self, errors: &mut Vec<ConfigError>) {
        for (key, value) in [
            ("polling.tick_interval_ms", self.tick_interval_ms),
            ("polling.fast_interval_ms", self.fast_interval_ms),
            ("polling.poll_timeout_ms", self.poll_timeout_ms),
            ("polling.cleanup_interval_ms", self.cleanup_interval_ms),
        ] {
            if value == 0 {
                errors.push(invalid(key, "must be positive"));
            }
        }
        if self.fast_interval_ms > self.base_interval_ms {
            errors.push(invalid("polling.fast_interval_ms", "must not exceed base_interval_ms"));
        }
        if self.base_interval_ms > self.slow_interval_ms {
            errors.push(invalid("polling.base_interval_ms", "must not exceed slow_interval_ms"));
        }
        if self.max_backoff_ms < self.base_interval_ms {
            errors.push(invalid("polling.max_backoff_ms", "must be at least base_interval_ms"));
        }
        if self.max_concurrent_polls == 0 {
            errors.push(invalid("polling.max_concurrent_polls", "must be at least 1"));
        }
        if self.batch_size == 0 {
            errors.push(invalid("polling.batch_size", "must be at least 1"));
        }
        if self.max_errors == 0 {
            errors.push(invalid("polling.max_errors", "must be at least 1"));
        }
        if self.no_change_threshold == 0 {
            errors.push(invalid("polling.no_change_threshold", "must be at least 1"));
        }
        if self.slowdown_factor.is_nan() || self.slowdown_factor < 1.0 {
            errors.push(invalid("polling.slowdown_factor", "must be at least 1.0"));
        }
        if !(self.speedup_factor > 0.0 && self.speedup_factor <= 1.0) {
            errors.push(invalid("polling.speedup_factor", "must be within (0.0, 1.0]"));
        }
    }
}

/// Reads job status straight from a [`JobStore`], for deployments where
/// workers write progress into the store rather than exposing an API.
#[derive(Clone)]
pub struct StoreStatusSource {
    store: Arc<dyn JobStore>,
}

impl StoreStatusSource {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl JobStatusSource for StoreStatusSource {
    async fn fetch_status(&self, job_id: &JobId) -> Result<RemoteStatus> {
        self.store
            .find_by_id(job_id)
            .await?
            .map(|job| RemoteStatus::from_job(&job))
            .ok_or_else(|| Error::JobNotFound { id: job_id.clone() })
    }
}

#[derive(Clone)]
pub struct PollingService {
    config: Arc<PollingConfig>,
    source: Arc<dyn JobStatusSource>,
    store: Arc<dyn JobStore>,
    tracker: StatusTracker,
    metrics: Arc<MetricsRegistry>,
    strategies: Arc<[PollingStrategy]>,
    jobs: Arc<DashMap<JobId, PollingJob>>,
    shutdown: CancellationToken,
}

impl PollingService {
    pub fn new(
        config: PollingConfig,
        source: Arc<dyn JobStatusSource>,
        store: Arc<dyn JobStore>,
        tracker: StatusTracker,
    ) -> Self {
        Self {
            config: Arc::new(config),
            source,
            store,
            tracker,
            metrics: Arc::new(MetricsRegistry::new()),
            strategies: default_strategies().into(),
            jobs: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_strategies(mut self, strategies: Vec<PollingStrategy>) -> Self {
        self.strategies = strategies.into();
        self
    }

    pub fn config(&self) -> &PollingConfig {
        &self.config
    }

    pub fn is_polling(&self, id: &JobId) -> bool {
        self.jobs.contains_key(id)
    }

    pub fn polling_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn polling_job(&self, id: &JobId) -> Option<PollingJob> {
        self.jobs.get(id).map(|j| j.clone())
    }

    /// Starts watching `job`. Returns false for terminal jobs, jobs already
    /// being polled, or after shutdown.
    pub fn start_polling(&self, job: &Job) -> bool {
        if job.is_terminal() || self.shutdown.is_cancelled() {
            return false;
        }
        let mut polling = PollingJob::new(
            job.id.clone(),
            job.status,
            job.priority,
            self.config.base_interval(),
        );
        self.select_strategy(&mut polling);
        let interval_ms = polling.interval.as_millis() as u64;

        match self.jobs.entry(job.id.clone()) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(slot) => {
                slot.insert(polling);
            }
        }
        self.metrics.polled_jobs.set(self.jobs.len() as i64);

        tracing::info!(job_id = %job.id, interval_ms, "Polling started");
        self.tracker.events().publish(JobEvent::PollingStarted {
            job_id: job.id.clone(),
            interval_ms,
        });
        true
    }

    pub fn stop_polling(&self, id: &JobId, reason: PollingStopReason) -> Option<PollingJob> {
        let (_, job) = self.jobs.remove(id)?;
        self.metrics.polled_jobs.set(self.jobs.len() as i64);

        tracing::info!(job_id = %id, ?reason, polls = job.poll_count, "Polling stopped");
        self.tracker.events().publish(JobEvent::PollingStopped {
            job_id: id.clone(),
            reason,
        });
        Some(job)
    }

    /// One scheduler pass. Returns the number of polls dispatched.
    pub async fn tick(&self) -> usize {
        let now = Instant::now();
        let mut due = self
            .jobs
            .iter()
            .filter(|j| j.is_due(now))
            .map(|j| (j.job_id.clone(), j.priority, j.staleness(now)))
            .collect::<Vec<_>>();
        if due.is_empty() {
            return 0;
        }
        due.sort_by(|a, b| b.1.cmp(&a.1).then(b.2.cmp(&a.2)));
        due.truncate(self.config.max_concurrent_polls);

        let claimed = due
            .into_iter()
            .filter_map(|(id, ..)| {
                let mut job = self.jobs.get_mut(&id)?;
                if job.in_flight {
                    return None;
                }
                job.in_flight = true;
                Some(id)
            })
            .collect::<Vec<_>>();

        tracing::debug!(
            dispatched = claimed.len(),
            watched = self.jobs.len(),
            "Polling tick"
        );

        // Polls run as their own tasks so a slow fetch never holds up the
        // next tick. Chunks after the first start `batch_delay` apart.
        let chunk_size = self.config.batch_size.max(1);
        for (i, id) in claimed.iter().enumerate() {
            let delay = self.config.batch_delay() * (i / chunk_size) as u32;
            let service = self.clone();
            let id = id.clone();
            tokio::spawn(async move {
                if !delay.is_zero() {
                    tokio::select! {
                        _ = service.shutdown.cancelled() => {
                            service.release(std::slice::from_ref(&id));
                            return;
                        }
                        _ = time::sleep(delay) => {}
                    }
                }
                service.poll_job(&id).await;
            });
        }
        claimed.len()
    }

    /// Polls one watched job immediately, whatever its interval.
    pub async fn poll_now(&self, id: &JobId) -> bool {
        match self.jobs.get_mut(id) {
            Some(mut job) if !job.in_flight => job.in_flight = true,
            _ => return false,
        }
        self.poll_job(id).await;
        true
    }

    async fn poll_job(&self, id: &JobId) {
        let Some(poll_count) = self.jobs.get(id).map(|j| j.poll_count + 1) else {
            return;
        };
        self.poll_inner(id)
            .instrument(poll_span(id, poll_count))
            .await
    }

    async fn poll_inner(&self, id: &JobId) {
        let fetched = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                self.release(std::slice::from_ref(id));
                return;
            }
            result = time::timeout(self.config.poll_timeout(), self.source.fetch_status(id)) => {
                result.unwrap_or_else(|_| Err(Error::Timeout(self.config.poll_timeout())))
            }
        };
        let now = Instant::now();

        match fetched {
            Ok(remote) => self.handle_status(id, remote, now).await,
            Err(Error::JobNotFound { .. }) => {
                self.metrics.record_poll(false);
                self.stop_polling(id, PollingStopReason::Removed);
            }
            Err(error) => self.handle_error(id, &error, now),
        }
    }

    async fn handle_status(&self, id: &JobId, remote: RemoteStatus, now: Instant) {
        self.metrics.record_poll(true);
        let tracked = self.tracker.get_job_status(id);

        let (changed, strategy_changed) = {
            let Some(mut job) = self.jobs.get_mut(id) else {
                return;
            };
            let known = tracked.as_ref().map_or(job.last_status, |t| t.status);
            let changed = remote.status != known;
            if changed {
                job.record_changed(remote.status, &self.config, now);
            } else {
                job.record_unchanged(&self.config, now);
                job.last_status = remote.status;
            }
            let event = self.select_strategy(&mut job).then(|| strategy_event(&job));
            (changed, event)
        };
        Span::current().record("changed", changed);
        if let Some(event) = strategy_changed {
            self.tracker.events().publish(event);
        }

        let progress_moved = remote.progress.is_some_and(|p| {
            tracked
                .as_ref()
                .is_none_or(|t| t.progress.percentage != p)
        });
        if !changed && !progress_moved {
            if remote.status.is_terminal() {
                self.stop_polling(id, PollingStopReason::Terminal);
            }
            return;
        }

        match self.reconcile(id, &remote).await {
            Ok(Some(job)) if job.is_terminal() => {
                self.stop_polling(id, PollingStopReason::Terminal);
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                self.stop_polling(id, PollingStopReason::Removed);
            }
            Err(error) => self.handle_error(id, &error, now),
        }
    }

    fn handle_error(&self, id: &JobId, error: &Error, now: Instant) {
        self.metrics.record_poll(false);
        let (errors, exhausted, strategy_changed) = {
            let Some(mut job) = self.jobs.get_mut(id) else {
                return;
            };
            job.record_error(&self.config, now);
            let event = self.select_strategy(&mut job).then(|| strategy_event(&job));
            (job.consecutive_errors, job.is_exhausted(&self.config), event)
        };

        tracing::warn!(job_id = %id, error = %error, consecutive_errors = errors, "Poll failed");
        let events = self.tracker.events();
        events.publish(JobEvent::PollingError {
            job_id: id.clone(),
            error: error.to_string(),
            consecutive_errors: errors,
        });
        if let Some(event) = strategy_changed {
            events.publish(event);
        }
        if exhausted {
            events.publish(JobEvent::PollingMaxErrors {
                job_id: id.clone(),
                errors,
            });
            self.stop_polling(id, PollingStopReason::MaxErrors);
        }
    }

    /// Writes an observed remote status into the store, then mirrors the
    /// stored result into the tracker. Returns the stored job, or `None`
    /// if the store no longer has it.
    async fn reconcile(&self, id: &JobId, remote: &RemoteStatus) -> Result<Option<Job>> {
        let Some(stored) = self.store.find_by_id(id).await? else {
            return Ok(None);
        };
        if stored.is_terminal() {
            self.tracker.sync_from_store(&stored);
            return Ok(Some(stored));
        }

        let mut target = remote.status;
        if target != stored.status && !stored.status.can_transition_to(target) {
            if target.is_terminal() && stored.status.can_transition_to(JobStatus::Processing) {
                // The remote side finished before we saw it start.
                self.store
                    .update(id, JobPatch::status(JobStatus::Processing))
                    .await?;
            } else {
                tracing::warn!(
                    job_id = %id,
                    stored = %stored.status,
                    remote = %target,
                    "Ignoring remote status that is not a legal transition"
                );
                target = stored.status;
            }
        }

        let mut patch = JobPatch::new();
        if target != stored.status {
            patch = patch.with_status(target);
        }
        if let Some(percentage) = remote.progress {
            patch = patch.with_progress(JobProgress::new(
                percentage,
                stage_for(target),
                remote.message.clone().unwrap_or_default(),
            ));
        }
        match target {
            JobStatus::Completed => {
                patch = patch.with_progress(JobProgress::done());
                if let Some(output) = &remote.output {
                    patch = patch.with_result(JobResult {
                        images: output.images.clone(),
                        external_id: output.external_id.clone(),
                        retry_attempts: 0,
                        fallback_used: false,
                        duration_ms: output.elapsed_ms.unwrap_or_default(),
                    });
                }
            }
            JobStatus::Failed => {
                let message = remote
                    .error
                    .clone()
                    .unwrap_or_else(|| "generation failed upstream".to_string());
                patch = patch.with_error(ErrorInfo::new(ErrorCode::ServerError, message));
            }
            _ => {}
        }

        let updated = self.store.update(id, patch).await?;
        if let Some(job) = &updated {
            self.tracker.sync_from_store(job);
        }
        Ok(updated)
    }

    /// Drops terminal, stale, and error-exhausted jobs.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let stale_after = self.config.stale_job_timeout();
        let doomed = self
            .jobs
            .iter()
            .filter(|j| !j.in_flight)
            .filter_map(|j| {
                let terminal = j.last_status.is_terminal()
                    || self
                        .tracker
                        .last_known_status(&j.job_id)
                        .is_some_and(|s| s.is_terminal());
                let reason = if terminal {
                    PollingStopReason::Terminal
                } else if j.is_exhausted(&self.config) {
                    PollingStopReason::MaxErrors
                } else if j.is_stale(now, stale_after) {
                    PollingStopReason::Stale
                } else {
                    return None;
                };
                Some((j.job_id.clone(), reason))
            })
            .collect::<Vec<_>>();

        for (id, reason) in &doomed {
            self.stop_polling(id, *reason);
        }
        doomed.len()
    }

    /// Spawns the scheduler loop. It runs until [`shutdown`](Self::shutdown).
    pub fn start(&self) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move { service.run().await })
    }

    async fn run(&self) {
        let mut ticker = time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let every = self.config.cleanup_interval();
        let mut cleanup = time::interval_at(Instant::now() + every, every);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut events = self.tracker.subscribe();

        tracing::info!(
            tick_ms = self.config.tick_interval_ms,
            max_concurrent = self.config.max_concurrent_polls,
            "Polling service started"
        );
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = cleanup.tick() => {
                    self.cleanup();
                }
                event = events.recv() => match event {
                    Ok(event) if event.is_terminal() => {
                        self.stop_polling(event.job_id(), PollingStopReason::Terminal);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Polling service lagged behind job events");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        tracing::info!("Polling service stopped");
    }

    /// Stops the scheduler and drops every watched job.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let ids = self
            .jobs
            .iter()
            .map(|j| j.key().clone())
            .collect::<Vec<_>>();
        for id in ids {
            self.stop_polling(&id, PollingStopReason::Shutdown);
        }
    }

    /// Applies the first matching strategy. Returns whether it changed.
    fn select_strategy(&self, job: &mut PollingJob) -> bool {
        let Some(strategy) = strategy::select(&self.strategies, job, &self.config) else {
            return false;
        };
        if job.strategy == Some(strategy.name) {
            return false;
        }
        job.strategy = Some(strategy.name);
        job.interval = strategy.interval(job, &self.config);
        job.priority = strategy.priority.max(job.base_priority);
        tracing::debug!(
            job_id = %job.job_id,
            strategy = strategy.name,
            interval_ms = job.interval.as_millis() as u64,
            "Polling strategy changed"
        );
        true
    }

    fn release(&self, ids: &[JobId]) {
        for id in ids {
            if let Some(mut job) = self.jobs.get_mut(id) {
                job.in_flight = false;
            }
        }
    }
}

fn strategy_event(job: &PollingJob) -> JobEvent {
    JobEvent::StrategyChanged {
        job_id: job.job_id.clone(),
        strategy: job.strategy.unwrap_or_default().to_string(),
        interval_ms: job.interval.as_millis() as u64,
        priority: job.priority,
    }
}

fn stage_for(status: JobStatus) -> ProgressStage {
    match status {
        JobStatus::Pending | JobStatus::Queued => ProgressStage::Queued,
        JobStatus::Processing => ProgressStage::Generating,
        JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => ProgressStage::Done,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let mut errors = Vec::new();
        PollingConfig::default().collect_errors(&mut errors);
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn test_invalid_config_collects_every_problem() {
        let config = PollingConfig {
            batch_size: 0,
            max_errors: 0,
            speedup_factor: 1.5,
            ..Default::default()
        };
        let mut errors = Vec::new();
        config.collect_errors(&mut errors);
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_error_backoff_is_capped() {
        let config = PollingConfig::default();
        assert_eq!(config.error_backoff(0), Duration::from_secs(5));
        assert_eq!(config.error_backoff(3), Duration::from_secs(40));
        assert_eq!(config.error_backoff(4), Duration::from_secs(60));
        assert_eq!(config.error_backoff(200), Duration::from_secs(60));
    }

    #[test]
    fn test_stage_for_status() {
        assert_eq!(stage_for(JobStatus::Queued), ProgressStage::Queued);
        assert_eq!(stage_for(JobStatus::Processing), ProgressStage::Generating);
        assert_eq!(stage_for(JobStatus::Completed), ProgressStage::Done);
    }
}
