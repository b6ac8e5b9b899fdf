//! Jobs: the unit of work and its persistence boundary.

mod store;
mod types;

pub use store::{JobStore, MemoryJobStore};
pub use types::{
    ErrorCode, ErrorInfo, Job, JobFilter, JobId, JobKind, JobPatch, JobPriority, JobProgress,
    JobResult, JobSpec, JobStatus, ProgressStage,
};

use thiserror::Error;

/// Errors raised by a [`JobStore`] backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store backend error: {message}")]
    Backend { message: String },

    #[error("Store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}
