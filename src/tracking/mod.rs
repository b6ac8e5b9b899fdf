//! In-memory view of job progress.
//!
//! The tracker mirrors jobs for fast reads and is the component that turns
//! lifecycle transitions into [`JobEvent`]s. Its records are advisory: when
//! the store disagrees, [`StatusTracker::sync_from_store`] lets the store win.
//! A record that reached a terminal status is frozen until it is removed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::events::{EventBus, JobEvent};
use crate::jobs::{ErrorInfo, Job, JobId, JobProgress, JobStatus, ProgressStage};
use crate::{Error, Result};

/// Partial progress change; `None` keeps the current value.
#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    pub percentage: Option<u8>,
    pub stage: Option<ProgressStage>,
    pub message: Option<String>,
}

impl ProgressUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(stage: ProgressStage, percentage: u8, message: impl Into<String>) -> Self {
        Self {
            percentage: Some(percentage),
            stage: Some(stage),
            message: Some(message.into()),
        }
    }

    pub fn percentage(mut self, percentage: u8) -> Self {
        self.percentage = Some(percentage);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    fn merge_into(self, progress: &mut JobProgress) {
        if let Some(p) = self.percentage {
            progress.percentage = p.min(100);
        }
        if let Some(stage) = self.stage {
            progress.stage = stage;
        }
        if let Some(message) = self.message {
            progress.message = message;
        }
    }
}

#[derive(Clone)]
pub struct StatusTracker {
    jobs: Arc<DashMap<JobId, Job>>,
    events: EventBus,
}

impl StatusTracker {
    pub fn new(events: EventBus) -> Self {
        Self {
            jobs: Arc::new(DashMap::new()),
            events,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Starts tracking `job`. Re-tracking an active job refreshes its record;
    /// re-tracking a terminal one is rejected.
    pub fn track_job(&self, job: Job) -> Result<()> {
        let id = job.id.clone();
        let event = JobEvent::JobCreated {
            job_id: id.clone(),
            kind: job.kind,
            priority: job.priority,
        };

        let is_new = match self.jobs.get(&id) {
            Some(existing) if existing.is_terminal() => {
                return Err(Error::JobTerminal {
                    id,
                    status: existing.status,
                });
            }
            Some(_) => false,
            None => true,
        };
        self.jobs.insert(id.clone(), job);

        if is_new {
            tracing::debug!(job_id = %id, "Tracking job");
            self.events.publish(event);
        }
        Ok(())
    }

    pub fn get_job_status(&self, id: &JobId) -> Option<Job> {
        self.jobs.get(id).map(|j| j.clone())
    }

    pub fn last_known_status(&self, id: &JobId) -> Option<JobStatus> {
        self.jobs.get(id).map(|j| j.status)
    }

    pub fn is_tracked(&self, id: &JobId) -> bool {
        self.jobs.contains_key(id)
    }

    pub fn tracked_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn active_jobs(&self) -> Vec<JobId> {
        self.jobs
            .iter()
            .filter(|e| !e.is_terminal())
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn update_progress(&self, id: &JobId, update: ProgressUpdate) -> Result<JobProgress> {
        let progress = self.mutate(id, |job| {
            update.merge_into(&mut job.progress);
            Ok(job.progress.clone())
        })?;
        self.events.publish(JobEvent::JobProgress {
            job_id: id.clone(),
            progress: progress.clone(),
        });
        Ok(progress)
    }

    /// Moves a non-terminal record along a legal lifecycle edge.
    pub fn transition(&self, id: &JobId, to: JobStatus) -> Result<()> {
        let from = self.mutate(id, |job| {
            let from = job.status;
            if from != to && !from.can_transition_to(to) {
                return Err(Error::InvalidTransition {
                    id: job.id.clone(),
                    from,
                    to,
                });
            }
            job.status = to;
            Ok(from)
        })?;
        if from != to {
            self.events.publish(JobEvent::JobStatusChanged {
                job_id: id.clone(),
                from,
                to,
            });
        }
        Ok(())
    }

    /// Records that the job went back to `pending` for a delayed re-attempt.
    pub fn schedule_retry(&self, id: &JobId, retry_count: u32, delay: Duration) -> Result<()> {
        self.transition(id, JobStatus::Pending)?;
        self.mutate(id, |job| {
            job.retry_count = retry_count;
            job.scheduled_at = chrono::Duration::from_std(delay)
                .ok()
                .map(|d| Utc::now() + d);
            Ok(())
        })?;
        self.events.publish(JobEvent::JobRetryScheduled {
            job_id: id.clone(),
            retry_count,
            delay_ms: delay.as_millis() as u64,
        });
        Ok(())
    }

    /// Freezes the record as completed, taking results from `job`.
    pub fn complete_tracking(&self, id: &JobId, job: &Job) -> Result<()> {
        let images = job.results.iter().map(|r| r.images.len()).sum();
        self.finish(id, JobStatus::Completed, |tracked| {
            tracked.results.clone_from(&job.results);
            tracked.retry_count = job.retry_count;
            tracked.progress = JobProgress::done();
        })?;
        self.events.publish(JobEvent::JobCompleted {
            job_id: id.clone(),
            images,
        });
        Ok(())
    }

    pub fn fail_tracking(&self, id: &JobId, error: ErrorInfo) -> Result<()> {
        let event = JobEvent::JobFailed {
            job_id: id.clone(),
            error: error.clone(),
        };
        self.finish(id, JobStatus::Failed, |tracked| {
            tracked.error = Some(error);
        })?;
        self.events.publish(event);
        Ok(())
    }

    pub fn cancel_tracking(&self, id: &JobId) -> Result<()> {
        self.finish(id, JobStatus::Cancelled, |_| {})?;
        self.events.publish(JobEvent::JobCancelled { job_id: id.clone() });
        Ok(())
    }

    /// Removes the record. This is the only way a terminal record changes.
    pub fn stop_tracking(&self, id: &JobId) -> Option<Job> {
        self.jobs.remove(id).map(|(_, job)| job)
    }

    /// Reconciles the tracked record with the store's copy.
    ///
    /// The store wins for active records and absent ones. A terminal tracked
    /// record that disagrees is left alone and logged. Returns whether the
    /// tracked view changed.
    pub fn sync_from_store(&self, stored: &Job) -> bool {
        let id = stored.id.clone();
        let previous = self.jobs.get(&id).map(|j| j.clone());

        let previous_status = match &previous {
            Some(tracked) if tracked.is_terminal() => {
                if tracked.status != stored.status {
                    tracing::warn!(
                        job_id = %id,
                        tracked = %tracked.status,
                        stored = %stored.status,
                        "Tracked terminal status disagrees with store"
                    );
                }
                return false;
            }
            Some(tracked) if tracked == stored => return false,
            Some(tracked) => Some(tracked.status),
            None => None,
        };

        self.jobs.insert(id.clone(), stored.clone());

        if let Some(from) = previous_status.filter(|from| *from != stored.status) {
            self.events.publish(JobEvent::JobStatusChanged {
                job_id: id.clone(),
                from,
                to: stored.status,
            });
        }
        if previous.as_ref().is_some_and(|p| p.progress != stored.progress) {
            self.events.publish(JobEvent::JobProgress {
                job_id: id.clone(),
                progress: stored.progress.clone(),
            });
        }
        if previous_status != Some(stored.status)
            && let Some(event) = terminal_event(stored)
        {
            self.events.publish(event);
        }
        true
    }

    /// Drops terminal records that finished more than `older_than` ago.
    pub fn cleanup(&self, older_than: Duration) -> usize {
        let Ok(age) = chrono::Duration::from_std(older_than) else {
            return 0;
        };
        let cutoff = Utc::now() - age;
        let before = self.jobs.len();
        self.jobs.retain(|_, job| {
            !(job.is_terminal() && job.completed_at.unwrap_or(job.updated_at) <= cutoff)
        });
        let removed = before.saturating_sub(self.jobs.len());
        if removed > 0 {
            tracing::debug!(removed, "Cleaned up finished job records");
        }
        removed
    }

    fn mutate<T>(&self, id: &JobId, f: impl FnOnce(&mut Job) -> Result<T>) -> Result<T> {
        let mut entry = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| Error::JobNotFound { id: id.clone() })?;
        if entry.is_terminal() {
            return Err(Error::JobTerminal {
                id: id.clone(),
                status: entry.status,
            });
        }
        let job = entry.value_mut();
        let value = f(job)?;
        job.updated_at = Utc::now();
        Ok(value)
    }

    fn finish(&self, id: &JobId, status: JobStatus, f: impl FnOnce(&mut Job)) -> Result<()> {
        let from = self.mutate(id, |job| {
            let from = job.status;
            if !from.can_transition_to(status) {
                return Err(Error::InvalidTransition {
                    id: job.id.clone(),
                    from,
                    to: status,
                });
            }
            f(job);
            job.status = status;
            job.completed_at = Some(Utc::now());
            Ok(from)
        })?;
        tracing::info!(job_id = %id, from = %from, to = %status, "Job finished");
        self.events.publish(JobEvent::JobStatusChanged {
            job_id: id.clone(),
            from,
            to: status,
        });
        Ok(())
    }
}

fn terminal_event(job: &Job) -> Option<JobEvent> {
    let job_id = job.id.clone();
    match job.status {
        JobStatus::Completed => Some(JobEvent::JobCompleted {
            job_id,
            images: job.results.iter().map(|r| r.images.len()).sum(),
        }),
        JobStatus::Failed => Some(JobEvent::JobFailed {
            job_id,
            error: job
                .error
                .clone()
                .unwrap_or_else(|| ErrorInfo::new(crate::jobs::ErrorCode::Internal, "failed")),
        }),
        JobStatus::Cancelled => Some(JobEvent::JobCancelled { job_id }),
        _ => None,
    }
}
