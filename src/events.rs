//! Typed lifecycle events and the bus that fans them out.
//!
//! Publishing never blocks: the bus is a bounded `tokio::sync::broadcast`
//! channel. A receiver that falls more than the channel capacity behind
//! loses the oldest events and sees `RecvError::Lagged` on its next receive.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::jobs::{ErrorInfo, JobId, JobKind, JobPriority, JobProgress, JobStatus};

pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollingStopReason {
    Terminal,
    Stale,
    MaxErrors,
    Removed,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    JobCreated {
        job_id: JobId,
        kind: JobKind,
        priority: JobPriority,
    },
    JobStatusChanged {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    JobProgress {
        job_id: JobId,
        progress: JobProgress,
    },
    JobCompleted {
        job_id: JobId,
        images: usize,
    },
    JobFailed {
        job_id: JobId,
        error: ErrorInfo,
    },
    JobCancelled {
        job_id: JobId,
    },
    JobRetryScheduled {
        job_id: JobId,
        retry_count: u32,
        delay_ms: u64,
    },
    PollingStarted {
        job_id: JobId,
        interval_ms: u64,
    },
    PollingStopped {
        job_id: JobId,
        reason: PollingStopReason,
    },
    PollingError {
        job_id: JobId,
        error: String,
        consecutive_errors: u32,
    },
    PollingMaxErrors {
        job_id: JobId,
        errors: u32,
    },
    StrategyChanged {
        job_id: JobId,
        strategy: String,
        interval_ms: u64,
        priority: JobPriority,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> &JobId {
        match self {
            Self::JobCreated { job_id, .. }
            | Self::JobStatusChanged { job_id, .. }
            | Self::JobProgress { job_id, .. }
            | Self::JobCompleted { job_id, .. }
            | Self::JobFailed { job_id, .. }
            | Self::JobCancelled { job_id }
            | Self::JobRetryScheduled { job_id, .. }
            | Self::PollingStarted { job_id, .. }
            | Self::PollingStopped { job_id, .. }
            | Self::PollingError { job_id, .. }
            | Self::PollingMaxErrors { job_id, .. }
            | Self::StrategyChanged { job_id, .. } => job_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::JobCreated { .. } => "job_created",
            Self::JobStatusChanged { .. } => "job_status_changed",
            Self::JobProgress { .. } => "job_progress",
            Self::JobCompleted { .. } => "job_completed",
            Self::JobFailed { .. } => "job_failed",
            Self::JobCancelled { .. } => "job_cancelled",
            Self::JobRetryScheduled { .. } => "job_retry_scheduled",
            Self::PollingStarted { .. } => "polling_started",
            Self::PollingStopped { .. } => "polling_stopped",
            Self::PollingError { .. } => "polling_error",
            Self::PollingMaxErrors { .. } => "polling_max_errors",
            Self::StrategyChanged { .. } => "strategy_changed",
        }
    }

    /// True for events announcing that a job reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::JobCompleted { .. } | Self::JobFailed { .. } | Self::JobCancelled { .. }
        )
    }
}

/// Cloneable publish/subscribe handle.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Fire-and-forget. Returns the number of receivers the event reached.
    pub fn publish(&self, event: JobEvent) -> usize {
        tracing::trace!(event = event.name(), job_id = %event.job_id(), "Publishing event");
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
