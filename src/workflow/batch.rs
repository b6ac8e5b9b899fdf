//! Batch jobs: one parent job fanning out to single-image children.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;
use futures::{StreamExt, stream};
use serde::{Deserialize, Serialize};

use super::GenerationWorkflow;
use crate::client::GenerationRequest;
use crate::config::{ConfigError, invalid};
use crate::jobs::{
    ErrorCode, ErrorInfo, Job, JobId, JobKind, JobPatch, JobPriority, JobProgress, JobResult,
    JobSpec, JobStatus, ProgressStage,
};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    /// Children processed at the same time.
    pub max_concurrency: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            max_concurrency: 3,
        }
    }
}

impl BatchConfig {
    pub(crate) fn collect_errors(&self, errors: &mut Vec<ConfigError>) {
        if self.max_batch_size == 0 {
            errors.push(invalid("batch.max_batch_size", "must be at least 1"));
        }
        if self.max_concurrency == 0 {
            errors.push(invalid("batch.max_concurrency", "must be at least 1"));
        }
    }
}

#[derive(Clone)]
pub struct BatchProcessor {
    workflow: GenerationWorkflow,
    config: Arc<BatchConfig>,
}

impl BatchProcessor {
    pub fn new(workflow: GenerationWorkflow, config: BatchConfig) -> Self {
        Self {
            workflow,
            config: Arc::new(config),
        }
    }

    pub fn workflow(&self) -> &GenerationWorkflow {
        &self.workflow
    }

    /// Creates the parent job and one pending child per request. Every
    /// request is validated before anything is stored.
    pub async fn submit_batch(
        &self,
        requests: Vec<GenerationRequest>,
        priority: JobPriority,
    ) -> Result<Job> {
        if requests.is_empty() {
            return Err(Error::InvalidRequest("batch must not be empty".into()));
        }
        if requests.len() > self.config.max_batch_size {
            return Err(Error::BatchTooLarge {
                size: requests.len(),
                max: self.config.max_batch_size,
            });
        }
        for request in &requests {
            request.validate()?;
        }

        let parent = self
            .workflow
            .submit(JobSpec::batch().priority(priority))
            .await?;
        let mut children = Vec::with_capacity(requests.len());
        for request in requests {
            let child = self
                .workflow
                .submit(
                    JobSpec::single(request)
                        .priority(priority)
                        .parent(parent.id.clone()),
                )
                .await?;
            children.push(child.id);
        }

        let parent = self
            .workflow
            .update(&parent.id, JobPatch::new().with_children(children))
            .await?;
        self.workflow.tracker().sync_from_store(&parent);
        tracing::info!(job_id = %parent.id, children = parent.children.len(), "Batch submitted");
        Ok(parent)
    }

    /// Processes every child with bounded concurrency.
    ///
    /// The parent settles once every child is terminal: completed if any
    /// child completed, failed otherwise. Children re-queued for a retry keep
    /// the parent in `processing` until their retries finish, and the last
    /// one to finish settles it.
    pub async fn process_batch(&self, parent_id: &JobId) -> Result<Job> {
        let (_guard, _) = self.workflow.claim(parent_id)?;
        let parent = self.workflow.job(parent_id).await?;
        if parent.kind != JobKind::Batch {
            return Err(Error::InvalidRequest(format!(
                "job {parent_id} is not a batch"
            )));
        }
        if !matches!(parent.status, JobStatus::Pending | JobStatus::Queued) {
            return Err(Error::InvalidTransition {
                id: parent_id.clone(),
                from: parent.status,
                to: JobStatus::Processing,
            });
        }

        let parent = self
            .workflow
            .update(parent_id, JobPatch::status(JobStatus::Processing))
            .await?;
        self.workflow.tracker().sync_from_store(&parent);

        let total = parent.children.len();
        let done = AtomicUsize::new(0);
        stream::iter(parent.children.iter().cloned())
            .map(|child| {
                let done = &done;
                async move {
                    let child = &child;
                    if let Err(error) = self.workflow.process(child).await {
                        tracing::warn!(job_id = %child, error = %error, "Batch item could not run");
                    }
                    let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
                    // The last child may already have settled the parent.
                    if finished < total {
                        self.workflow
                            .report(
                                parent_id,
                                ProgressStage::Generating,
                                (finished * 100 / total) as u8,
                                &format!("{finished} of {total} items processed"),
                            )
                            .await;
                    }
                }
            })
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect::<Vec<_>>()
            .await;

        if let Some(settled) = self.workflow.settle_batch(parent_id).await? {
            return Ok(settled);
        }
        let parent = self.workflow.job(parent_id).await?;
        if !parent.is_terminal() {
            tracing::info!(job_id = %parent_id, total, "Batch waiting on re-queued items");
        }
        Ok(parent)
    }

    /// Cancels the parent, then every unfinished child.
    pub async fn cancel_batch(&self, parent_id: &JobId) -> Result<Job> {
        let parent = self.workflow.cancel(parent_id).await?;
        for child in &parent.children {
            match self.workflow.cancel(child).await {
                Ok(_) | Err(Error::JobTerminal { .. } | Error::JobNotFound { .. }) => {}
                Err(error) => return Err(error),
            }
        }
        Ok(parent)
    }
}

impl GenerationWorkflow {
    /// Settles a processing batch parent once all of its children are
    /// terminal. Returns the settled parent, or `None` if the batch is not
    /// ready or was settled already.
    pub(crate) async fn settle_batch(&self, parent_id: &JobId) -> Result<Option<Job>> {
        let parent = self.job(parent_id).await?;
        if parent.status != JobStatus::Processing {
            return Ok(None);
        }
        let mut children = Vec::with_capacity(parent.children.len());
        for id in &parent.children {
            match self.store.find_by_id(id).await? {
                Some(child) if !child.is_terminal() => return Ok(None),
                Some(child) => children.push(child),
                None => {}
            }
        }

        let id = parent.id;
        let total = parent.children.len();
        let duration_ms = (Utc::now() - parent.created_at).num_milliseconds().max(0) as u64;
        let completed = children
            .iter()
            .filter(|c| c.status == JobStatus::Completed)
            .collect::<Vec<_>>();

        let patch = if completed.is_empty() {
            let mut info = children
                .iter()
                .find_map(|c| c.error.clone())
                .unwrap_or_else(|| ErrorInfo::new(ErrorCode::Internal, "no batch item completed"));
            info.message = format!("all {total} batch items failed: {}", info.message);
            JobPatch::status(JobStatus::Failed).with_error(info)
        } else {
            let results = completed.iter().flat_map(|c| c.results.iter());
            let summary = JobResult {
                images: results.clone().flat_map(|r| r.images.clone()).collect(),
                external_id: None,
                retry_attempts: results.clone().map(|r| r.retry_attempts).sum(),
                fallback_used: results.clone().any(|r| r.fallback_used),
                duration_ms,
            };
            JobPatch::status(JobStatus::Completed)
                .with_progress(JobProgress::new(
                    100,
                    ProgressStage::Done,
                    format!("{} of {total} items completed", completed.len()),
                ))
                .with_result(summary)
        };

        let job = match self.update(&id, patch).await {
            Ok(job) => job,
            // A sibling finishing at the same moment got there first.
            Err(Error::JobTerminal { .. }) => return Ok(None),
            Err(error) => return Err(error),
        };
        match &job.error {
            Some(info) if job.status == JobStatus::Failed => {
                self.advisory(&id, self.tracker.fail_tracking(&id, info.clone()));
                tracing::error!(job_id = %id, total, "Batch failed");
            }
            _ => {
                self.advisory(&id, self.tracker.complete_tracking(&id, &job));
                tracing::info!(job_id = %id, completed = completed.len(), total, "Batch completed");
            }
        }
        Ok(Some(job))
    }
}
