//! # genflow
//!
//! Resilient orchestration core for long-running image generation jobs.
//!
//! Generation calls go through [`ErrorRecovery`], which layers a circuit
//! breaker, a rate limiter and retry with backoff around each call. Jobs move
//! through a bounded lifecycle driven by [`GenerationWorkflow`], are mirrored
//! by the [`StatusTracker`], and jobs without push notifications are watched
//! by the adaptive [`PollingService`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use genflow::{
//!     CoreConfig, ErrorRecovery, EventBus, GenerationRequest, GenerationWorkflow,
//!     HttpGenerationClient, MemoryJobStore, StatusTracker,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), genflow::Error> {
//!     let config = CoreConfig::default();
//!     let tracker = StatusTracker::new(EventBus::new(config.event_capacity));
//!     let workflow = GenerationWorkflow::builder()
//!         .store(Arc::new(MemoryJobStore::new()))
//!         .client(Arc::new(HttpGenerationClient::new("https://api.example.com")?))
//!         .recovery(ErrorRecovery::new(config.resilience.clone()))
//!         .tracker(tracker)
//!         .config(config.workflow.clone())
//!         .build()?;
//!
//!     let job = workflow
//!         .submit_character(GenerationRequest::new("a knight in silver armor").character("c-42"))
//!         .await?;
//!     let job = workflow.process(&job.id).await?;
//!     println!("{} is {}", job.id, job.status);
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod client;
pub mod config;
pub mod events;
pub mod jobs;
pub mod observability;
pub mod polling;
pub mod prelude;
pub mod resilience;
pub mod tracking;
pub mod workflow;

use std::time::Duration;

use chrono::{DateTime, Utc};

// Re-exports for convenience
pub use client::{
    ErrorKind, GeneratedImage, GenerationClient, GenerationError, GenerationRequest,
    GenerationResponse, HttpGenerationClient, JobStatusSource, RemoteStatus,
};
pub use config::{ConfigError, CoreConfig, EndpointClass, EndpointConfig, ResilienceSettings};
pub use events::{EventBus, JobEvent, PollingStopReason};
pub use jobs::{
    ErrorCode, ErrorInfo, Job, JobFilter, JobId, JobKind, JobPatch, JobPriority, JobProgress,
    JobResult, JobSpec, JobStatus, JobStore, MemoryJobStore, ProgressStage, StoreError,
};
pub use observability::{MetricsRegistry, MetricsSummary};
pub use polling::{PollingConfig, PollingService, StoreStatusSource};
pub use resilience::{
    CircuitBreakerRegistry, CircuitConfig, CircuitState, ErrorRecovery, RateLimitConfig,
    RateLimiterRegistry, RecoveryOptions, RecoveryResult, RetryPolicy,
};
pub use tracking::{ProgressUpdate, StatusTracker};
pub use workflow::{BatchConfig, BatchProcessor, GenerationWorkflow, WorkflowConfig};

/// Error type for genflow operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The generation API call failed.
    #[error("Generation API error: {0}")]
    Generation(#[from] GenerationError),

    /// Rejected locally because the operation's circuit is open.
    #[error("Circuit breaker open for {operation}, retry in {:.1}s", .retry_in.as_secs_f64())]
    CircuitOpen {
        operation: String,
        retry_in: Duration,
    },

    /// Rejected locally by the rate limiter.
    #[error("Rate limit exceeded for {key} ({limit} per window), retry in {:.1}s", .retry_after.as_secs_f64())]
    RateLimited {
        key: String,
        limit: u32,
        retry_after: Duration,
        reset_time: DateTime<Utc>,
    },

    /// Operation exceeded timeout.
    #[error("Operation timed out after {:.1}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Job not found: {id}")]
    JobNotFound { id: jobs::JobId },

    #[error("Job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: jobs::JobId,
        from: jobs::JobStatus,
        to: jobs::JobStatus,
    },

    /// The job already finished and can no longer change.
    #[error("Job {id} is already {status}")]
    JobTerminal {
        id: jobs::JobId,
        status: jobs::JobStatus,
    },

    /// A second processing attempt while the first is outstanding.
    #[error("Job {id} is already being processed")]
    AlreadyInFlight { id: jobs::JobId },

    #[error("Batch of {size} jobs exceeds the limit of {max}")]
    BatchTooLarge { size: usize, max: usize },

    /// Request parameters are invalid.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The API answered with something unusable.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Job store error: {0}")]
    Store(#[from] jobs::StoreError),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// JSON serialization or deserialization failed.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Error category for unified error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Authentication or authorization failures (401, 403, quota)
    Authorization,
    /// The request itself is wrong; retrying will not help
    Validation,
    /// Network, timeout, or upstream overload; may succeed on retry
    Transient,
    /// Refused locally by a circuit breaker or rate limiter
    Rejected,
    /// Job lifecycle violations
    Lifecycle,
    Cancelled,
    /// Store, configuration, or unexpected errors
    Internal,
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Generation(e) => match e.kind {
                ErrorKind::Unauthorized | ErrorKind::Forbidden | ErrorKind::QuotaExceeded => {
                    ErrorCategory::Authorization
                }
                ErrorKind::Validation | ErrorKind::NotFound => ErrorCategory::Validation,
                ErrorKind::Cancelled => ErrorCategory::Cancelled,
                _ if e.is_retryable() => ErrorCategory::Transient,
                _ => ErrorCategory::Internal,
            },
            Error::Timeout(_) => ErrorCategory::Transient,
            Error::CircuitOpen { .. } | Error::RateLimited { .. } => ErrorCategory::Rejected,
            Error::Cancelled => ErrorCategory::Cancelled,
            Error::InvalidRequest(_) | Error::BatchTooLarge { .. } => ErrorCategory::Validation,
            Error::JobNotFound { .. }
            | Error::InvalidTransition { .. }
            | Error::JobTerminal { .. }
            | Error::AlreadyInFlight { .. } => ErrorCategory::Lifecycle,
            Error::InvalidResponse(_) | Error::Store(_) | Error::Config(_) | Error::Json(_) => {
                ErrorCategory::Internal
            }
        }
    }

    /// Worth another attempt within the same call.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Generation(e) => e.is_retryable(),
            Error::Timeout(_) => true,
            _ => false,
        }
    }

    /// Counts as a failure for the circuit breaker.
    pub fn trips_circuit(&self) -> bool {
        match self {
            Error::Generation(e) => e.trips_circuit(),
            Error::Timeout(_) => true,
            _ => false,
        }
    }

    /// Refused or abandoned before the dependency produced an answer.
    pub fn is_local_rejection(&self) -> bool {
        match self {
            Error::CircuitOpen { .. } | Error::RateLimited { .. } | Error::Cancelled => true,
            Error::Generation(e) => e.kind == ErrorKind::Cancelled,
            _ => false,
        }
    }

    /// Worth re-queueing the job for a later attempt: retryable failures
    /// plus local overload rejections.
    pub fn is_transient(&self) -> bool {
        self.is_retryable() || matches!(self, Error::CircuitOpen { .. } | Error::RateLimited { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        self.category() == ErrorCategory::Cancelled
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::Generation(e) => e.status,
            _ => None,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::Generation(e) => e.retry_after,
            Error::RateLimited { retry_after, .. } => Some(*retry_after),
            Error::CircuitOpen { retry_in, .. } => Some(*retry_in),
            _ => None,
        }
    }

    /// Closed code recorded on a failed job.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Generation(e) => match e.kind {
                ErrorKind::Network => ErrorCode::NetworkError,
                ErrorKind::Timeout => ErrorCode::Timeout,
                ErrorKind::RateLimited => ErrorCode::UpstreamRateLimited,
                ErrorKind::ServiceUnavailable => ErrorCode::ServiceUnavailable,
                ErrorKind::Unauthorized => ErrorCode::Unauthorized,
                ErrorKind::Forbidden => ErrorCode::Forbidden,
                ErrorKind::QuotaExceeded => ErrorCode::QuotaExceeded,
                ErrorKind::Validation => ErrorCode::ValidationError,
                ErrorKind::NotFound => ErrorCode::NotFound,
                ErrorKind::Server => ErrorCode::ServerError,
                ErrorKind::Decode => ErrorCode::InvalidResponse,
                ErrorKind::Cancelled => ErrorCode::Cancelled,
                ErrorKind::Unknown => ErrorCode::Internal,
            },
            Error::CircuitOpen { .. } => ErrorCode::CircuitBreakerOpen,
            Error::RateLimited { .. } => ErrorCode::RateLimitExceeded,
            Error::Timeout(_) => ErrorCode::Timeout,
            Error::Cancelled => ErrorCode::Cancelled,
            Error::InvalidRequest(_) | Error::BatchTooLarge { .. } => ErrorCode::ValidationError,
            Error::InvalidResponse(_) => ErrorCode::InvalidResponse,
            Error::JobNotFound { .. } => ErrorCode::NotFound,
            _ => ErrorCode::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
