//! Polling Tests
//!
//! Adaptive intervals, strategy selection, reconciliation with the store,
//! error exhaustion and the scheduler loop.
//!
//! Run: cargo nextest run --test polling_tests

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{images, request};
use genflow::{
    Error, ErrorKind, EventBus, GenerationError, Job, JobEvent, JobId, JobPatch, JobPriority,
    JobSpec, JobStatus, JobStatusSource, JobStore, MemoryJobStore, PollingConfig,
    PollingService, PollingStopReason, RemoteStatus, StatusTracker, StoreStatusSource,
};

/// Remote side whose answer the test controls.
struct ControlledSource {
    status: Mutex<RemoteStatus>,
    down: AtomicBool,
}

impl ControlledSource {
    fn new(status: JobStatus) -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(RemoteStatus::new(status)),
            down: AtomicBool::new(false),
        })
    }

    fn set(&self, status: RemoteStatus) {
        *self.status.lock().unwrap() = status;
    }

    fn go_down(&self) {
        self.down.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobStatusSource for ControlledSource {
    async fn fetch_status(&self, _job_id: &JobId) -> genflow::Result<RemoteStatus> {
        if self.down.load(Ordering::SeqCst) {
            return Err(GenerationError::new(ErrorKind::Network, "connection reset").into());
        }
        Ok(self.status.lock().unwrap().clone())
    }
}

struct Fixture {
    store: Arc<MemoryJobStore>,
    tracker: StatusTracker,
    service: PollingService,
}

fn fixture(source: Arc<dyn JobStatusSource>, config: PollingConfig) -> Fixture {
    common::init_tracing();
    let store = Arc::new(MemoryJobStore::new());
    let tracker = StatusTracker::new(EventBus::default());
    let service = PollingService::new(config, source, store.clone(), tracker.clone());
    Fixture {
        store,
        tracker,
        service,
    }
}

/// Creates a job in the store at `status` and tracks it.
async fn job_at(f: &Fixture, status: JobStatus, priority: JobPriority) -> Job {
    let mut job = f
        .store
        .create(JobSpec::single(request()).priority(priority))
        .await
        .unwrap();
    if status != JobStatus::Pending {
        job = f
            .store
            .update(&job.id, JobPatch::status(status))
            .await
            .unwrap()
            .unwrap();
    }
    f.tracker.track_job(job.clone()).unwrap();
    job
}

/// Answers at once for every job but one, which never answers.
struct SplitSource {
    hung: Mutex<Option<JobId>>,
}

#[async_trait]
impl JobStatusSource for SplitSource {
    async fn fetch_status(&self, job_id: &JobId) -> genflow::Result<RemoteStatus> {
        let hung = self.hung.lock().unwrap().as_ref() == Some(job_id);
        if hung {
            tokio::time::sleep(Duration::from_secs(120)).await;
        }
        Ok(RemoteStatus::new(JobStatus::Processing))
    }
}

/// Lets spawned poll tasks run to completion.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<JobEvent>) -> Vec<JobEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// =============================================================================
// Adaptive intervals
// =============================================================================

mod interval_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_status_slows_polling() {
        let source = ControlledSource::new(JobStatus::Processing);
        let f = fixture(source, PollingConfig::default());
        let job = job_at(&f, JobStatus::Processing, JobPriority::Normal).await;

        assert!(f.service.start_polling(&job));
        let start = f.service.polling_job(&job.id).unwrap();
        assert_eq!(start.strategy, Some("fast-active"));
        assert_eq!(start.interval, f.service.config().fast_interval());

        for _ in 0..5 {
            assert!(f.service.poll_now(&job.id).await);
        }

        let polled = f.service.polling_job(&job.id).unwrap();
        assert_eq!(polled.consecutive_no_changes, 5);
        assert_eq!(polled.poll_count, 5);
        assert!(polled.interval > start.interval);
        assert!(polled.interval <= f.service.config().slow_interval());
        assert_eq!(polled.strategy, Some("slow-stable"));
        // Strategies never drop below the job's own priority.
        assert_eq!(polled.priority, JobPriority::Normal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_change_resets_and_speeds_up() {
        let source = ControlledSource::new(JobStatus::Pending);
        let f = fixture(source.clone(), PollingConfig::default());
        let job = job_at(&f, JobStatus::Pending, JobPriority::Normal).await;
        let mut rx = f.tracker.subscribe();

        f.service.start_polling(&job);
        for _ in 0..3 {
            f.service.poll_now(&job.id).await;
        }
        let before = f.service.polling_job(&job.id).unwrap();
        assert_eq!(before.consecutive_no_changes, 3);

        source.set(RemoteStatus::new(JobStatus::Processing).with_progress(40));
        f.service.poll_now(&job.id).await;

        let after = f.service.polling_job(&job.id).unwrap();
        assert_eq!(after.consecutive_no_changes, 0);
        assert!(after.interval < before.interval);
        assert!(after.interval >= f.service.config().fast_interval());
        assert_eq!(after.strategy, Some("fast-active"));
        assert_eq!(after.priority, JobPriority::High);

        let stored = f.store.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Processing);
        assert_eq!(stored.progress.percentage, 40);
        assert_eq!(
            f.tracker.last_known_status(&job.id),
            Some(JobStatus::Processing)
        );

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            JobEvent::JobStatusChanged {
                from: JobStatus::Pending,
                to: JobStatus::Processing,
                ..
            }
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            JobEvent::StrategyChanged { strategy, .. } if strategy == "fast-active"
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_errors_back_off_then_drop_job() {
        let source = ControlledSource::new(JobStatus::Processing);
        source.go_down();
        let config = PollingConfig {
            max_errors: 3,
            ..Default::default()
        };
        let f = fixture(source, config);
        let job = job_at(&f, JobStatus::Processing, JobPriority::Normal).await;
        let mut rx = f.tracker.subscribe();

        f.service.start_polling(&job);
        f.service.poll_now(&job.id).await;
        let polled = f.service.polling_job(&job.id).unwrap();
        assert_eq!(polled.consecutive_errors, 1);
        assert_eq!(polled.interval, Duration::from_secs(10));
        assert_eq!(polled.strategy, Some("adaptive-on-errors"));

        f.service.poll_now(&job.id).await;
        f.service.poll_now(&job.id).await;
        assert!(!f.service.is_polling(&job.id));

        let events = drain(&mut rx);
        let errors = events
            .iter()
            .filter(|e| matches!(e, JobEvent::PollingError { .. }))
            .count();
        assert_eq!(errors, 3);
        assert!(
            events
                .iter()
                .any(|e| matches!(e, JobEvent::PollingMaxErrors { errors: 3, .. }))
        );
        assert!(events.iter().any(|e| matches!(
            e,
            JobEvent::PollingStopped {
                reason: PollingStopReason::MaxErrors,
                ..
            }
        )));
        // The job itself is untouched; only polling gave up.
        let stored = f.store.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Processing);
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

mod reconcile_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_remote_completion_is_written_to_store() {
        let source = ControlledSource::new(JobStatus::Queued);
        let f = fixture(source.clone(), PollingConfig::default());
        let job = job_at(&f, JobStatus::Queued, JobPriority::Normal).await;
        let mut rx = f.tracker.subscribe();
        f.service.start_polling(&job);

        // Finished before we ever saw it processing.
        source.set(RemoteStatus::new(JobStatus::Completed).with_output(images("remote", 2)));
        f.service.poll_now(&job.id).await;

        let stored = f.store.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.results.len(), 1);
        assert_eq!(stored.results[0].images.len(), 2);
        assert!(!f.service.is_polling(&job.id));
        assert_eq!(
            f.tracker.last_known_status(&job.id),
            Some(JobStatus::Completed)
        );

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(e, JobEvent::JobCompleted { .. })));
        assert!(events.iter().any(|e| matches!(
            e,
            JobEvent::PollingStopped {
                reason: PollingStopReason::Terminal,
                ..
            }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_failure_records_error() {
        let source = ControlledSource::new(JobStatus::Processing);
        let f = fixture(source.clone(), PollingConfig::default());
        let job = job_at(&f, JobStatus::Processing, JobPriority::Normal).await;
        f.service.start_polling(&job);

        source.set(RemoteStatus::new(JobStatus::Failed).with_error("model crashed"));
        f.service.poll_now(&job.id).await;

        let stored = f.store.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error.unwrap().message, "model crashed");
        assert!(!f.service.is_polling(&job.id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_backed_source_syncs_tracker() {
        let store = Arc::new(MemoryJobStore::new());
        let source = Arc::new(StoreStatusSource::new(store.clone()));
        let tracker = StatusTracker::new(EventBus::default());
        let service = PollingService::new(
            PollingConfig::default(),
            source.clone(),
            store.clone(),
            tracker.clone(),
        );

        let job = store.create(JobSpec::single(request())).await.unwrap();
        let job = store
            .update(&job.id, JobPatch::status(JobStatus::Processing))
            .await
            .unwrap()
            .unwrap();
        tracker.track_job(job.clone()).unwrap();
        service.start_polling(&job);

        // A worker finishes the job by writing to the store directly.
        store
            .update(&job.id, JobPatch::status(JobStatus::Completed))
            .await
            .unwrap();
        service.poll_now(&job.id).await;

        assert_eq!(tracker.last_known_status(&job.id), Some(JobStatus::Completed));
        assert!(!service.is_polling(&job.id));

        let missing = source.fetch_status(&JobId::from("missing")).await;
        assert!(matches!(missing, Err(Error::JobNotFound { .. })));
    }
}

// =============================================================================
// Scheduling
// =============================================================================

mod scheduler_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_tick_respects_interval_and_concurrency() {
        let source = ControlledSource::new(JobStatus::Pending);
        let config = PollingConfig {
            max_concurrent_polls: 2,
            batch_size: 1,
            batch_delay_ms: 0,
            ..Default::default()
        };
        let f = fixture(source, config);
        let low = job_at(&f, JobStatus::Pending, JobPriority::Low).await;
        let urgent = job_at(&f, JobStatus::Pending, JobPriority::Urgent).await;
        let normal = job_at(&f, JobStatus::Pending, JobPriority::Normal).await;
        for job in [&low, &urgent, &normal] {
            assert!(f.service.start_polling(job));
        }
        assert!(!f.service.start_polling(&urgent));
        assert_eq!(f.service.polling_count(), 3);

        assert_eq!(f.service.tick().await, 0);

        tokio::time::advance(f.service.config().base_interval()).await;
        assert_eq!(f.service.tick().await, 2);
        // Dispatched polls are still in flight until their tasks run.
        assert_eq!(f.service.tick().await, 1);
        settle().await;
        assert_eq!(f.service.polling_job(&urgent.id).unwrap().poll_count, 1);

        // Everyone has just polled.
        assert_eq!(f.service.tick().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_fetch_does_not_stall_other_jobs() {
        let source = Arc::new(SplitSource {
            hung: Mutex::new(None),
        });
        let config = PollingConfig {
            poll_timeout_ms: 20_000,
            ..Default::default()
        };
        let f = fixture(source.clone(), config);
        let hung = job_at(&f, JobStatus::Processing, JobPriority::Normal).await;
        let quick = job_at(&f, JobStatus::Processing, JobPriority::Normal).await;
        *source.hung.lock().unwrap() = Some(hung.id.clone());
        f.service.start_polling(&hung);
        f.service.start_polling(&quick);

        let handle = f.service.start();
        tokio::time::sleep(Duration::from_secs(60)).await;

        // 2s, growing by 1.5x while nothing changes, then 30s once stable.
        let polls = f.service.polling_job(&quick.id).unwrap().poll_count;
        assert!(polls >= 5, "quick job polled {polls} times");
        // The hung fetch was cut off and counted as a poll error.
        let stuck = f.service.polling_job(&hung.id).unwrap();
        assert!(stuck.consecutive_errors >= 1);

        f.service.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_drops_stale_jobs() {
        let source = ControlledSource::new(JobStatus::Processing);
        let config = PollingConfig {
            stale_job_timeout_ms: 10_000,
            ..Default::default()
        };
        let f = fixture(source, config);
        let job = job_at(&f, JobStatus::Processing, JobPriority::Normal).await;
        f.service.start_polling(&job);

        assert_eq!(f.service.cleanup(), 0);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(f.service.cleanup(), 1);
        assert!(!f.service.is_polling(&job.id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_event_stops_polling() {
        let source = ControlledSource::new(JobStatus::Processing);
        let f = fixture(source, PollingConfig::default());
        let job = job_at(&f, JobStatus::Processing, JobPriority::Normal).await;
        f.service.start_polling(&job);

        let handle = f.service.start();
        tokio::time::sleep(Duration::from_millis(10)).await;

        f.tracker.complete_tracking(&job.id, &job).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!f.service.is_polling(&job.id));

        f.service.shutdown();
        handle.await.unwrap();
        assert!(!f.service.start_polling(&job));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drops_every_job() {
        let source = ControlledSource::new(JobStatus::Pending);
        let f = fixture(source, PollingConfig::default());
        for _ in 0..3 {
            let job = job_at(&f, JobStatus::Pending, JobPriority::Normal).await;
            f.service.start_polling(&job);
        }
        let mut rx = f.tracker.subscribe();

        f.service.shutdown();
        assert_eq!(f.service.polling_count(), 0);
        let stopped = drain(&mut rx)
            .into_iter()
            .filter(|e| {
                matches!(
                    e,
                    JobEvent::PollingStopped {
                        reason: PollingStopReason::Shutdown,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(stopped, 3);
    }
}
