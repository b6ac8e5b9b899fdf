//! Observability: structured spans and in-process metrics.
//!
//! The crate logs through `tracing` and never installs a subscriber; the
//! embedding service decides where events go. Counters live in a
//! [`MetricsRegistry`] shared by the recovery layer, the workflow and the
//! polling service.

mod metrics;
mod spans;

pub use metrics::{Counter, Gauge, Histogram, MetricsRegistry, MetricsSummary, RecoveryRecord};
pub use spans::{job_span, poll_span, recovery_span};
