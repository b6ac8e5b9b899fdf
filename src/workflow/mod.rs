//! Job workflow: drives a job from submission to a terminal state.
//!
//! A processing attempt runs preprocessing, the generation call (wrapped by
//! [`ErrorRecovery`]) and postprocessing. Failures that survive the recovery
//! layer's own retries are re-queued with a delay while the job has retries
//! left; anything else fails the job exactly once. At most one processing
//! attempt per job is in flight at any time.

mod batch;

pub use batch::{BatchConfig, BatchProcessor};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::client::{GenerationClient, GenerationRequest, GenerationResponse};
use crate::config::{ConfigError, invalid};
use crate::events::EventBus;
use crate::jobs::{
    ErrorInfo, Job, JobId, JobKind, JobPatch, JobProgress, JobResult, JobSpec, JobStatus,
    JobStore, ProgressStage,
};
use crate::observability::{MetricsRegistry, job_span};
use crate::resilience::ErrorRecovery;
use crate::tracking::{ProgressUpdate, StatusTracker};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Re-queues allowed per job, on top of the recovery layer's retries.
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub retry_backoff_multiplier: f64,
    pub max_retry_delay_ms: u64,
    pub auto_retry: bool,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 30_000,
            retry_backoff_multiplier: 2.0,
            max_retry_delay_ms: 300_000,
            auto_retry: true,
        }
    }
}

impl WorkflowConfig {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_auto_retry(mut self, enabled: bool) -> Self {
        self.auto_retry = enabled;
        self
    }

    /// Delay before re-queue number `retry` (1-based).
    pub fn retry_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let ms = self.retry_delay_ms as f64 * self.retry_backoff_multiplier.powi(exponent);
        Duration::from_millis(ms.min(self.max_retry_delay_ms as f64) as u64)
    }

    pub(crate) fn collect_errors(&self, errors: &mut Vec<ConfigError>) {
        if self.retry_delay_ms > self.max_retry_delay_ms {
            errors.push(invalid(
                "workflow.retry_delay_ms",
                "must not exceed max_retry_delay_ms",
            ));
        }
        if self.retry_backoff_multiplier.is_nan() || self.retry_backoff_multiplier < 1.0 {
            errors.push(invalid(
                "workflow.retry_backoff_multiplier",
                "must be at least 1.0",
            ));
        }
    }
}

#[derive(Default)]
pub struct GenerationWorkflowBuilder {
    store: Option<Arc<dyn JobStore>>,
    client: Option<Arc<dyn GenerationClient>>,
    recovery: Option<ErrorRecovery>,
    tracker: Option<StatusTracker>,
    config: WorkflowConfig,
}

impl GenerationWorkflowBuilder {
    pub fn store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn client(mut self, client: Arc<dyn GenerationClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn recovery(mut self, recovery: ErrorRecovery) -> Self {
        self.recovery = Some(recovery);
        self
    }

    pub fn tracker(mut self, tracker: StatusTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn config(mut self, config: WorkflowConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<GenerationWorkflow> {
        let store = self
            .store
            .ok_or_else(|| invalid("workflow.store", "a job store is required"))?;
        let client = self
            .client
            .ok_or_else(|| invalid("workflow.client", "a generation client is required"))?;

        let mut errors = Vec::new();
        self.config.collect_errors(&mut errors);
        if let Some(first) = errors.into_iter().next() {
            return Err(first.into());
        }

        Ok(GenerationWorkflow {
            store,
            client,
            recovery: self.recovery.unwrap_or_default(),
            tracker: self
                .tracker
                .unwrap_or_else(|| StatusTracker::new(EventBus::default())),
            config: Arc::new(self.config),
            in_flight: Arc::new(DashMap::new()),
            scheduled: Arc::new(DashMap::new()),
        })
    }
}

#[derive(Clone)]
pub struct GenerationWorkflow {
    store: Arc<dyn JobStore>,
    client: Arc<dyn GenerationClient>,
    recovery: ErrorRecovery,
    tracker: StatusTracker,
    config: Arc<WorkflowConfig>,
    /// Cancellation handles of processing attempts in flight.
    in_flight: Arc<DashMap<JobId, CancellationToken>>,
    /// Cancellation handles of delayed re-attempts.
    scheduled: Arc<DashMap<JobId, CancellationToken>>,
}

impl GenerationWorkflow {
    pub fn builder() -> GenerationWorkflowBuilder {
        GenerationWorkflowBuilder::default()
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn tracker(&self) -> &StatusTracker {
        &self.tracker
    }

    pub fn recovery(&self) -> &ErrorRecovery {
        &self.recovery
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    fn metrics(&self) -> &MetricsRegistry {
        self.recovery.metrics()
    }

    pub fn is_in_flight(&self, id: &JobId) -> bool {
        self.in_flight.contains_key(id)
    }

    pub fn has_scheduled_retry(&self, id: &JobId) -> bool {
        self.scheduled.contains_key(id)
    }

    /// Creates a pending job and starts tracking it.
    pub async fn submit(&self, spec: JobSpec) -> Result<Job> {
        if let Some(request) = &spec.request {
            request.validate()?;
        }
        let job = self.store.create(spec).await?;
        self.advisory(&job.id, self.tracker.track_job(job.clone()));
        self.metrics().jobs_submitted.inc();
        tracing::info!(job_id = %job.id, kind = ?job.kind, priority = ?job.priority, "Job submitted");
        Ok(job)
    }

    pub async fn submit_single(&self, request: GenerationRequest) -> Result<Job> {
        self.submit(JobSpec::single(request)).await
    }

    pub async fn submit_character(&self, request: GenerationRequest) -> Result<Job> {
        if request.character_id.is_none() {
            return Err(Error::InvalidRequest(
                "character jobs need a character_id".into(),
            ));
        }
        self.submit(JobSpec::character(request)).await
    }

    /// `pending -> queued`.
    pub async fn enqueue(&self, id: &JobId) -> Result<Job> {
        let job = self.update(id, JobPatch::status(JobStatus::Queued)).await?;
        self.advisory(id, self.tracker.transition(id, JobStatus::Queued));
        Ok(job)
    }

    pub async fn job(&self, id: &JobId) -> Result<Job> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or_else(|| Error::JobNotFound { id: id.clone() })
    }

    /// Runs one processing attempt and returns the job as it stands after.
    ///
    /// Generation failures are not errors here: they show up as a `failed`
    /// job, or a `pending` one with a retry scheduled. Errors are reserved
    /// for lifecycle violations and store failures.
    pub async fn process(&self, id: &JobId) -> Result<Job> {
        let (guard, cancel) = self.claim(id)?;
        if let Some((_, pending)) = self.scheduled.remove(id) {
            pending.cancel();
        }

        let job = self.job(id).await?;
        let span = job_span(id, job.kind, job.retry_count);
        let result = self.run(job, cancel).instrument(span).await;
        // Follow-ups may process this job again, so the slot goes first.
        drop(guard);

        if let Ok(job) = &result {
            self.follow_up(job).await;
        }
        result
    }

    /// Takes the job's in-flight slot. The slot is released when the guard
    /// drops; the token aborts whatever runs under it.
    pub(crate) fn claim(&self, id: &JobId) -> Result<(InFlightGuard, CancellationToken)> {
        let cancel = CancellationToken::new();
        match self.in_flight.entry(id.clone()) {
            Entry::Occupied(_) => return Err(Error::AlreadyInFlight { id: id.clone() }),
            Entry::Vacant(slot) => {
                slot.insert(cancel.clone());
            }
        }
        Ok((InFlightGuard::new(self, id), cancel))
    }

    /// Starts an armed retry, or settles the parent batch once a child is
    /// done.
    async fn follow_up(&self, job: &Job) {
        if job.status == JobStatus::Pending
            && let Some(token) = self.scheduled.get(&job.id).map(|t| t.clone())
        {
            self.spawn_retry(job.id.clone(), token, self.config.retry_delay(job.retry_count));
        }
        if job.is_terminal()
            && let Some(parent_id) = &job.parent_id
            && let Err(error) = self.settle_batch(parent_id).await
        {
            tracing::warn!(job_id = %parent_id, error = %error, "Batch could not be settled");
        }
    }

    async fn run(&self, job: Job, cancel: CancellationToken) -> Result<Job> {
        let id = job.id.clone();
        if job.is_terminal() {
            return Err(Error::JobTerminal {
                id,
                status: job.status,
            });
        }
        if !matches!(job.status, JobStatus::Pending | JobStatus::Queued) {
            return Err(Error::InvalidTransition {
                id,
                from: job.status,
                to: JobStatus::Processing,
            });
        }
        let Some(request) = job.request.clone() else {
            return Err(Error::InvalidRequest(format!(
                "job {id} has no generation request"
            )));
        };

        if !self.tracker.is_tracked(&id) {
            self.advisory(&id, self.tracker.track_job(job.clone()));
        }
        let job = self
            .update(
                &id,
                JobPatch::status(JobStatus::Processing).with_scheduled_at(None),
            )
            .await?;
        self.advisory(&id, self.tracker.transition(&id, JobStatus::Processing));
        self.report(&id, ProgressStage::Preprocessing, 10, "Preparing request")
            .await;

        if let Err(error) = request.validate() {
            return self.handle_failure(job, error).await;
        }

        self.report(&id, ProgressStage::Generating, 30, "Generating images")
            .await;
        let client = &self.client;
        let outcome = self
            .recovery
            .execute_generation_call("generate", &cancel, || {
                let (id, request, cancel) = (id.clone(), request.clone(), cancel.clone());
                async move {
                    client
                        .generate(&id, &request, &cancel)
                        .await
                        .map_err(Error::from)
                }
            })
            .await;

        let attempts = outcome.retry_attempts;
        let fallback_used = outcome.fallback_used;
        let duration_ms = outcome.duration.as_millis() as u64;
        match outcome.result {
            Ok(response) if response.images.is_empty() => {
                let error = Error::InvalidResponse("generation returned no images".into());
                self.handle_failure(job, error).await
            }
            Ok(response) => {
                self.complete(job, response, attempts, fallback_used, duration_ms)
                    .await
            }
            // Cancelled from outside; `cancel` owns the transition.
            Err(error) if error.is_cancelled() || cancel.is_cancelled() => self.job(&id).await,
            Err(error) => self.handle_failure(job, error).await,
        }
    }

    async fn complete(
        &self,
        job: Job,
        response: GenerationResponse,
        retry_attempts: u32,
        fallback_used: bool,
        duration_ms: u64,
    ) -> Result<Job> {
        let id = job.id;
        self.report(&id, ProgressStage::Postprocessing, 90, "Saving results")
            .await;

        let images = response.images.len();
        let result = JobResult {
            images: response.images,
            external_id: response.external_id,
            retry_attempts,
            fallback_used,
            duration_ms,
        };
        let job = self
            .update(
                &id,
                JobPatch::status(JobStatus::Completed)
                    .with_progress(JobProgress::done())
                    .with_result(result)
                    .clear_error(),
            )
            .await?;
        self.advisory(&id, self.tracker.complete_tracking(&id, &job));
        self.metrics().jobs_completed.inc();
        tracing::info!(job_id = %id, images, retry_attempts, duration_ms, "Job completed");
        Ok(job)
    }

    /// Re-queues the job while it has retries left and the failure may clear
    /// by itself; otherwise fails it.
    async fn handle_failure(&self, job: Job, error: Error) -> Result<Job> {
        let id = job.id;
        let retry_count = job.retry_count;

        if self.config.auto_retry && error.is_transient() && retry_count < self.config.max_retries
        {
            let next = retry_count + 1;
            let delay = self.config.retry_delay(next);
            let at = chrono::Duration::from_std(delay)
                .ok()
                .map(|d| Utc::now() + d);
            let job = self
                .update(
                    &id,
                    JobPatch::status(JobStatus::Pending)
                        .with_retry_count(next)
                        .with_scheduled_at(at)
                        .with_error(ErrorInfo::from_error(&error, next))
                        .with_progress(JobProgress::new(
                            0,
                            ProgressStage::Queued,
                            format!("Retry {next} of {} scheduled", self.config.max_retries),
                        )),
                )
                .await?;
            self.advisory(&id, self.tracker.schedule_retry(&id, next, delay));
            self.metrics().jobs_requeued.inc();
            tracing::warn!(
                job_id = %id,
                retry_count = next,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Job re-queued after failure"
            );
            self.arm_retry(&id);
            return Ok(job);
        }

        let info = ErrorInfo::from_error(&error, retry_count);
        let job = self
            .update(
                &id,
                JobPatch::status(JobStatus::Failed).with_error(info.clone()),
            )
            .await?;
        self.advisory(&id, self.tracker.fail_tracking(&id, info));
        self.metrics().jobs_failed.inc();
        tracing::error!(job_id = %id, retry_count, error = %error, "Job failed");
        Ok(job)
    }

    /// Registers the retry so `cancel` can stop it. The timer starts once the
    /// current attempt has released the job.
    fn arm_retry(&self, id: &JobId) {
        if let Some(previous) = self.scheduled.insert(id.clone(), CancellationToken::new()) {
            previous.cancel();
        }
    }

    fn spawn_retry(&self, id: JobId, token: CancellationToken, delay: Duration) {
        let workflow = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            workflow.scheduled.remove(&id);
            if let Err(error) = workflow.process(&id).await {
                tracing::warn!(job_id = %id, error = %error, "Scheduled retry did not run");
            }
        });
    }

    /// Cancels a job from any non-terminal state. Stops a scheduled
    /// re-attempt and aborts an in-flight generation call.
    pub async fn cancel(&self, id: &JobId) -> Result<Job> {
        if let Some((_, token)) = self.scheduled.remove(id) {
            token.cancel();
        }
        let in_flight = self.in_flight.get(id).map(|t| t.clone());
        if let Some(token) = &in_flight {
            token.cancel();
        }

        let job = self.job(id).await?;
        if job.is_terminal() {
            return Err(Error::JobTerminal {
                id: id.clone(),
                status: job.status,
            });
        }
        if job.status == JobStatus::Processing
            && job.kind != JobKind::Batch
            && let Err(error) = self.client.cancel(id).await
        {
            tracing::debug!(job_id = %id, error = %error, "Upstream cancel failed");
        }

        let job = self
            .update(
                id,
                JobPatch::status(JobStatus::Cancelled).with_scheduled_at(None),
            )
            .await?;
        self.advisory(id, self.tracker.cancel_tracking(id));
        self.metrics().jobs_cancelled.inc();
        tracing::info!(job_id = %id, aborted_call = in_flight.is_some(), "Job cancelled");
        if let Some(parent_id) = &job.parent_id
            && let Err(error) = self.settle_batch(parent_id).await
        {
            tracing::warn!(job_id = %parent_id, error = %error, "Batch could not be settled");
        }
        Ok(job)
    }

    pub(crate) async fn update(&self, id: &JobId, patch: JobPatch) -> Result<Job> {
        self.store
            .update(id, patch)
            .await?
            .ok_or_else(|| Error::JobNotFound { id: id.clone() })
    }

    /// Progress goes to the store and the tracker; failures are only logged.
    pub(crate) async fn report(
        &self,
        id: &JobId,
        stage: ProgressStage,
        percentage: u8,
        message: &str,
    ) {
        let progress = JobProgress::new(percentage, stage, message);
        if let Err(error) = self
            .store
            .update(id, JobPatch::new().with_progress(progress))
            .await
        {
            tracing::warn!(job_id = %id, error = %error, "Failed to store progress");
        }
        let update = ProgressUpdate::stage(stage, percentage, message);
        self.advisory(id, self.tracker.update_progress(id, update).map(drop));
    }

    /// The tracker is a cache; its failures never fail the job.
    pub(crate) fn advisory(&self, id: &JobId, result: Result<()>) {
        if let Err(error) = result {
            tracing::warn!(job_id = %id, error = %error, "Status tracker out of sync");
        }
    }
}

/// Releases the in-flight slot when processing ends, however it ends.
pub(crate) struct InFlightGuard {
    in_flight: Arc<DashMap<JobId, CancellationToken>>,
    metrics: Arc<MetricsRegistry>,
    id: JobId,
}

impl InFlightGuard {
    fn new(workflow: &GenerationWorkflow, id: &JobId) -> Self {
        workflow.metrics().jobs_in_flight.inc();
        Self {
            in_flight: Arc::clone(&workflow.in_flight),
            metrics: Arc::clone(workflow.recovery.metrics()),
            id: id.clone(),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.id);
        self.metrics.jobs_in_flight.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_grows_and_caps() {
        let config = WorkflowConfig::default();
        assert_eq!(config.retry_delay(1), Duration::from_secs(30));
        assert_eq!(config.retry_delay(2), Duration::from_secs(60));
        assert_eq!(config.retry_delay(3), Duration::from_secs(120));
        assert_eq!(config.retry_delay(10), Duration::from_secs(300));
    }

    #[test]
    fn test_config_validation() {
        let mut errors = Vec::new();
        WorkflowConfig::default().collect_errors(&mut errors);
        assert!(errors.is_empty());

        let config = WorkflowConfig {
            retry_delay_ms: 500_000,
            retry_backoff_multiplier: 0.5,
            ..Default::default()
        };
        config.collect_errors(&mut errors);
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_builder_requires_store_and_client() {
        let err = GenerationWorkflow::builder().build().err().expect("missing store");
        assert!(matches!(err, Error::Config(_)));
    }
}
