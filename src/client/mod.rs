//! Generation API boundary.
//!
//! The core never talks to the network directly: workflows call a
//! [`GenerationClient`] through the error recovery layer, and the polling
//! service asks a [`JobStatusSource`] what the outside world thinks a job is
//! doing. [`HttpGenerationClient`] implements both over HTTP.

mod error;
mod http;
mod types;

pub use error::{ErrorKind, GenerationError, RETRYABLE_STATUS_CODES};
pub use http::{HttpGenerationClient, HttpGenerationClientBuilder};
pub use types::{
    GeneratedImage, GenerationRequest, GenerationResponse, MAX_DIMENSION, MAX_IMAGES_PER_REQUEST,
    MIN_DIMENSION, RemoteStatus,
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::jobs::JobId;

/// Third-party image generation API.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    fn name(&self) -> &str;

    /// Runs one generation. Implementations must stop promptly once `cancel`
    /// fires and report [`ErrorKind::Cancelled`].
    async fn generate(
        &self,
        job_id: &JobId,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationResponse, GenerationError>;

    /// Asks the provider to abandon work for `job_id`.
    async fn cancel(&self, job_id: &JobId) -> Result<(), GenerationError>;
}

/// Source of truth for jobs that are not pushed to us.
#[async_trait]
pub trait JobStatusSource: Send + Sync {
    async fn fetch_status(&self, job_id: &JobId) -> crate::Result<RemoteStatus>;
}
