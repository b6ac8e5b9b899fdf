//! Job store backends.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::{Job, JobFilter, JobId, JobPatch, JobSpec};
use crate::Result;

/// Persistence touchpoint of the core. The store is the system of record for
/// job state; every other copy reconciles against it.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    fn name(&self) -> &str;

    async fn create(&self, spec: JobSpec) -> Result<Job>;

    async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>>;

    /// Applies `patch` through [`Job::apply`]. Returns `Ok(None)` when no job
    /// has this id.
    async fn update(&self, id: &JobId, patch: JobPatch) -> Result<Option<Job>>;

    async fn find(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    async fn delete(&self, id: &JobId) -> Result<bool>;
}

/// In-memory store (for testing and single-instance deployments)
#[derive(Debug, Default, Clone)]
pub struct MemoryJobStore {
    jobs: Arc<RwLock<HashMap<JobId, Job>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn clear(&self) {
        self.jobs.write().await.clear();
    }
}

#[async_trait::async_trait]
impl JobStore for MemoryJobStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create(&self, spec: JobSpec) -> Result<Job> {
        let job = Job::from_spec(spec);
        self.jobs.write().await.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn update(&self, id: &JobId, patch: JobPatch) -> Result<Option<Job>> {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(id) else {
            return Ok(None);
        };
        job.apply(patch)?;
        Ok(Some(job.clone()))
    }

    async fn find(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let jobs = self.jobs.read().await;
        let mut found: Vec<Job> = jobs.values().filter(|j| filter.matches(j)).cloned().collect();
        found.sort_by_key(|j| j.created_at);
        if let Some(limit) = filter.limit {
            found.truncate(limit);
        }
        Ok(found)
    }

    async fn delete(&self, id: &JobId) -> Result<bool> {
        Ok(self.jobs.write().await.remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::client::GenerationRequest;
    use crate::jobs::{JobKind, JobStatus};

    fn spec() -> JobSpec {
        JobSpec::character(GenerationRequest::new("a pirate captain"))
    }

    #[tokio::test]
    async fn test_create_and_find() {
        let store = MemoryJobStore::new();
        let job = store.create(spec()).await.unwrap();

        let loaded = store.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.status, JobStatus::Pending);
        assert_eq!(store.count().await, 1);
    }

    #[tokio::test]
    async fn test_update_missing_returns_none() {
        let store = MemoryJobStore::new();
        let updated = store
            .update(&JobId::from("missing"), JobPatch::status(JobStatus::Processing))
            .await
            .unwrap();
        assert!(updated.is_none());
    }

    #[tokio::test]
    async fn test_update_rejects_terminal_jobs() {
        let store = MemoryJobStore::new();
        let job = store.create(spec()).await.unwrap();
        store
            .update(&job.id, JobPatch::status(JobStatus::Cancelled))
            .await
            .unwrap();

        let err = store
            .update(&job.id, JobPatch::status(JobStatus::Processing))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::JobTerminal { .. }));
    }

    #[tokio::test]
    async fn test_find_with_filter() {
        let store = MemoryJobStore::new();
        let parent = store.create(JobSpec::batch()).await.unwrap();
        store.create(spec().parent(parent.id.clone())).await.unwrap();
        store.create(spec().parent(parent.id.clone())).await.unwrap();
        store.create(spec()).await.unwrap();

        let children = store
            .find(&JobFilter::new().parent(parent.id.clone()))
            .await
            .unwrap();
        assert_eq!(children.len(), 2);

        let batches = store
            .find(&JobFilter::new().kind(JobKind::Batch))
            .await
            .unwrap();
        assert_eq!(batches.len(), 1);

        let limited = store.find(&JobFilter::new().limit(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MemoryJobStore::new();
        let job = store.create(spec()).await.unwrap();
        assert!(store.delete(&job.id).await.unwrap());
        assert!(!store.delete(&job.id).await.unwrap());
        assert!(store.find_by_id(&job.id).await.unwrap().is_none());
    }
}
