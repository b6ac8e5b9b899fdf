//! Job data model and lifecycle rules.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::client::{GeneratedImage, GenerationRequest};
use crate::{Error, Result};

#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Single,
    Character,
    Batch,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Legal lifecycle edges. `Processing -> Pending` is the requeue edge used
    /// for bounded retries.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (from, Cancelled) => !from.is_terminal(),
            (Pending, Queued | Processing) => true,
            (Queued, Processing | Pending) => true,
            (Processing, Completed | Failed | Pending) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    #[default]
    Queued,
    Preprocessing,
    Generating,
    Postprocessing,
    Done,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub percentage: u8,
    pub stage: ProgressStage,
    pub message: String,
}

impl JobProgress {
    pub fn new(percentage: u8, stage: ProgressStage, message: impl Into<String>) -> Self {
        Self {
            percentage: percentage.min(100),
            stage,
            message: message.into(),
        }
    }

    pub fn done() -> Self {
        Self::new(100, ProgressStage::Done, "Completed")
    }
}

/// Closed set of failure codes recorded on a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NetworkError,
    Timeout,
    UpstreamRateLimited,
    ServiceUnavailable,
    Unauthorized,
    Forbidden,
    QuotaExceeded,
    ValidationError,
    NotFound,
    ServerError,
    CircuitBreakerOpen,
    RateLimitExceeded,
    InvalidResponse,
    Cancelled,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_retry_at: Option<DateTime<Utc>>,
    /// Rendered source error, kept for diagnostics only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: false,
            retry_count: 0,
            last_retry_at: None,
            cause: None,
        }
    }

    pub fn from_error(error: &Error, retry_count: u32) -> Self {
        Self {
            code: error.code(),
            message: error.to_string(),
            retryable: error.is_transient(),
            retry_count,
            last_retry_at: (retry_count > 0).then(Utc::now),
            cause: Some(format!("{error:?}")),
        }
    }
}

/// Output of one successful generation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub images: Vec<GeneratedImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    /// Attempts the recovery layer spent on the call that produced this.
    pub retry_attempts: u32,
    pub fallback_used: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub priority: JobPriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<GenerationRequest>,
    pub progress: JobProgress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default)]
    pub results: Vec<JobResult>,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<JobId>,
    #[serde(default)]
    pub children: Vec<JobId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn from_spec(spec: JobSpec) -> Self {
        let now = Utc::now();
        Self {
            id: spec.id.unwrap_or_default(),
            kind: spec.kind,
            status: JobStatus::Pending,
            priority: spec.priority,
            request: spec.request,
            progress: JobProgress::new(0, ProgressStage::Queued, "Waiting to start"),
            error: None,
            results: Vec::new(),
            retry_count: 0,
            parent_id: spec.parent_id,
            children: Vec::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
            scheduled_at: spec.scheduled_at,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Applies a patch, enforcing the lifecycle rules.
    ///
    /// Terminal jobs reject every patch, and a status change must follow a
    /// legal edge. Setting `processing` on a job that is already processing
    /// is rejected too. On error the job is left untouched.
    pub fn apply(&mut self, patch: JobPatch) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::JobTerminal {
                id: self.id.clone(),
                status: self.status,
            });
        }
        // Re-entering `processing` would let a second worker claim the job.
        if let Some(next) = patch.status
            && (next == JobStatus::Processing || next != self.status)
            && !self.status.can_transition_to(next)
        {
            return Err(Error::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        if let Some(next) = patch.status {
            self.status = next;
            if next.is_terminal() {
                self.completed_at = Some(now);
            }
        }
        if let Some(priority) = patch.priority {
            self.priority = priority;
        }
        if let Some(progress) = patch.progress {
            self.progress = progress;
        }
        if let Some(error) = patch.error {
            self.error = error;
        }
        if let Some(retry_count) = patch.retry_count {
            self.retry_count = retry_count;
        }
        if let Some(scheduled_at) = patch.scheduled_at {
            self.scheduled_at = scheduled_at;
        }
        if let Some(children) = patch.children {
            self.children = children;
        }
        self.results.extend(patch.results);
        self.updated_at = now;
        Ok(())
    }
}

/// Everything needed to create a job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub id: Option<JobId>,
    pub kind: JobKind,
    pub priority: JobPriority,
    pub request: Option<GenerationRequest>,
    pub parent_id: Option<JobId>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl JobSpec {
    fn with_kind(kind: JobKind, request: Option<GenerationRequest>) -> Self {
        Self {
            id: None,
            kind,
            priority: JobPriority::Normal,
            request,
            parent_id: None,
            scheduled_at: None,
        }
    }

    pub fn single(request: GenerationRequest) -> Self {
        Self::with_kind(JobKind::Single, Some(request))
    }

    pub fn character(request: GenerationRequest) -> Self {
        Self::with_kind(JobKind::Character, Some(request))
    }

    pub fn batch() -> Self {
        Self::with_kind(JobKind::Batch, None)
    }

    pub fn id(mut self, id: impl Into<JobId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn parent(mut self, parent_id: JobId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }
}

/// Partial update of a job. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub priority: Option<JobPriority>,
    pub progress: Option<JobProgress>,
    pub error: Option<Option<ErrorInfo>>,
    pub retry_count: Option<u32>,
    pub scheduled_at: Option<Option<DateTime<Utc>>>,
    pub children: Option<Vec<JobId>>,
    /// Appended to the job's results.
    pub results: Vec<JobResult>,
}

impl JobPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_progress(mut self, progress: JobProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_error(mut self, error: ErrorInfo) -> Self {
        self.error = Some(Some(error));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error = Some(None);
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn with_scheduled_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn with_children(mut self, children: Vec<JobId>) -> Self {
        self.children = Some(children);
        self
    }

    pub fn with_result(mut self, result: JobResult) -> Self {
        self.results.push(result);
        self
    }
}

/// Criteria for [`JobStore::find`](super::JobStore::find).
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub statuses: Option<Vec<JobStatus>>,
    pub kind: Option<JobKind>,
    pub parent_id: Option<JobId>,
    pub updated_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.statuses.get_or_insert_with(Vec::new).push(status);
        self
    }

    pub fn kind(mut self, kind: JobKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn parent(mut self, parent_id: JobId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn updated_before(mut self, at: DateTime<Utc>) -> Self {
        self.updated_before = Some(at);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.statuses
            .as_ref()
            .is_none_or(|s| s.contains(&job.status))
            && self.kind.is_none_or(|k| k == job.kind)
            && self
                .parent_id
                .as_ref()
                .is_none_or(|p| job.parent_id.as_ref() == Some(p))
            && self.updated_before.is_none_or(|t| job.updated_at < t)
    }
}
