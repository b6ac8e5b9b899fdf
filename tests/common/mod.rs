//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use genflow::config::{CircuitOverride, EndpointConfig, EndpointOverride, RetryOverride};
use genflow::{
    ErrorRecovery, EventBus, GeneratedImage, GenerationClient, GenerationError,
    GenerationRequest, GenerationResponse, GenerationWorkflow, JobId, MemoryJobStore,
    ResilienceSettings, RetryPolicy, StatusTracker, WorkflowConfig,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub enum Step {
    Respond(GenerationResponse),
    Fail(GenerationError),
    /// Blocks until the call is cancelled.
    Hang,
}

/// Generation client that plays back a script, then succeeds.
#[derive(Default)]
pub struct ScriptedClient {
    script: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
    cancels: AtomicUsize,
}

impl ScriptedClient {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            script: Mutex::new(steps.into_iter().collect()),
            ..Default::default()
        }
    }

    pub fn failing(status: u16, times: usize) -> Self {
        Self::new((0..times).map(|_| Step::Fail(GenerationError::from_status(status, "scripted"))))
    }

    pub fn push(&self, step: Step) {
        self.script.lock().unwrap().push_back(step);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationClient for ScriptedClient {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(
        &self,
        job_id: &JobId,
        _request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationResponse, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(Step::Respond(response)) => Ok(response),
            Some(Step::Fail(error)) => Err(error),
            Some(Step::Hang) => {
                cancel.cancelled().await;
                Err(GenerationError::cancelled())
            }
            None => Ok(images(job_id.as_str(), 1)),
        }
    }

    async fn cancel(&self, _job_id: &JobId) -> Result<(), GenerationError> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn images(external_id: &str, count: usize) -> GenerationResponse {
    GenerationResponse {
        external_id: Some(external_id.to_string()),
        images: (0..count)
            .map(|i| GeneratedImage {
                url: format!("https://cdn.example.com/{external_id}/{i}.png"),
                width: 1024,
                height: 1024,
                seed: Some(i as u64),
            })
            .collect(),
        model: Some("test-model".into()),
        elapsed_ms: Some(1200),
    }
}

pub fn request() -> GenerationRequest {
    GenerationRequest::new("portrait of a knight").character("c-1")
}

/// Fast retries and a 3-of-3 breaker on the generation API.
pub fn settings() -> ResilienceSettings {
    let defaults = EndpointConfig::default().with_retry(RetryPolicy::default().with_jitter(0.0));
    ResilienceSettings::new(defaults).with_endpoint(
        "generation_api",
        EndpointOverride {
            retry: RetryOverride {
                base_delay_ms: Some(10),
                max_delay_ms: Some(100),
                ..Default::default()
            },
            circuit_breaker: CircuitOverride {
                failure_threshold: Some(3),
                minimum_throughput: Some(3),
                ..Default::default()
            },
            ..Default::default()
        },
    )
}

pub struct Harness {
    pub store: Arc<MemoryJobStore>,
    pub client: Arc<ScriptedClient>,
    pub tracker: StatusTracker,
    pub workflow: GenerationWorkflow,
}

pub fn harness(client: ScriptedClient, config: WorkflowConfig) -> Harness {
    init_tracing();
    let store = Arc::new(MemoryJobStore::new());
    let client = Arc::new(client);
    let tracker = StatusTracker::new(EventBus::default());
    let workflow = GenerationWorkflow::builder()
        .store(store.clone())
        .client(client.clone())
        .recovery(ErrorRecovery::new(settings()))
        .tracker(tracker.clone())
        .config(config)
        .build()
        .expect("workflow");
    Harness {
        store,
        client,
        tracker,
        workflow,
    }
}

pub fn quick_retries(max_retries: u32) -> WorkflowConfig {
    WorkflowConfig::default()
        .with_max_retries(max_retries)
        .with_retry_delay(Duration::from_secs(1))
}
