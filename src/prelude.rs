//! Prelude module for convenient imports.
//!
//! # Usage
//!
//! ```rust
//! use genflow::prelude::*;
//! ```

pub use crate::Error;
pub use crate::Result;

// Jobs
pub use crate::jobs::{
    ErrorInfo, Job, JobFilter, JobId, JobKind, JobPatch, JobPriority, JobSpec, JobStatus,
    JobStore, MemoryJobStore,
};

// Client
pub use crate::client::{GenerationClient, GenerationRequest, GenerationResponse};

// Orchestration
pub use crate::events::{EventBus, JobEvent};
pub use crate::polling::PollingService;
pub use crate::resilience::{ErrorRecovery, RecoveryOptions};
pub use crate::tracking::{ProgressUpdate, StatusTracker};
pub use crate::workflow::{BatchProcessor, GenerationWorkflow};

pub use crate::config::CoreConfig;
