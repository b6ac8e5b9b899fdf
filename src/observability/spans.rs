//! Structured span definitions for tracing.

use tracing::{Level, Span, field, span};

use crate::jobs::{JobId, JobKind};

/// Span around one recovered call. `success` and `attempts` are filled in
/// when the call finishes.
pub fn recovery_span(operation: &str, endpoint: &str) -> Span {
    span!(
        Level::INFO,
        "recovery.execute",
        operation = operation,
        endpoint = endpoint,
        success = field::Empty,
        attempts = field::Empty,
    )
}

/// Span around one processing attempt of a job.
pub fn job_span(job_id: &JobId, kind: JobKind, retry_count: u32) -> Span {
    span!(
        Level::INFO,
        "job.process",
        job_id = %job_id,
        kind = ?kind,
        retry_count = retry_count,
    )
}

pub fn poll_span(job_id: &JobId, poll_count: u64) -> Span {
    span!(
        Level::DEBUG,
        "polling.poll",
        job_id = %job_id,
        poll_count = poll_count,
        changed = field::Empty,
    )
}
