//! HTTP implementation of the generation API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{
    ErrorKind, GenerationClient, GenerationError, GenerationRequest, GenerationResponse,
    JobStatusSource, RemoteStatus,
};
use crate::jobs::JobId;
use crate::{Error, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const GENERATIONS_PATH: &str = "v1/generations";

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    message: String,
}

#[derive(Clone, Debug)]
pub struct HttpGenerationClient {
    http: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
}

impl HttpGenerationClient {
    pub fn builder(base_url: impl AsRef<str>) -> HttpGenerationClientBuilder {
        HttpGenerationClientBuilder {
            base_url: base_url.as_ref().to_string(),
            api_key: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn new(base_url: impl AsRef<str>) -> Result<Self> {
        Self::builder(base_url).build()
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, suffix: &str) -> std::result::Result<Url, GenerationError> {
        let path = if suffix.is_empty() {
            GENERATIONS_PATH.to_string()
        } else {
            format!("{GENERATIONS_PATH}/{suffix}")
        };
        self.base_url
            .join(&path)
            .map_err(|e| GenerationError::new(ErrorKind::Validation, e.to_string()))
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let request = self.http.request(method, url);
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
    ) -> std::result::Result<reqwest::Response, GenerationError> {
        let response = request.send().await?;
        if response.status().is_success() {
            return Ok(response);
        }
        Err(into_error(response).await)
    }
}

async fn into_error(response: reqwest::Response) -> GenerationError {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);

    let body = response.text().await.unwrap_or_default();
    let envelope = serde_json::from_str::<ErrorEnvelope>(&body).ok();
    let message = match &envelope {
        Some(e) => e.error.message.clone(),
        None if body.is_empty() => status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string(),
        None => body,
    };

    let mut error = GenerationError::from_status(status.as_u16(), message);
    if status == StatusCode::TOO_MANY_REQUESTS
        && envelope
            .as_ref()
            .and_then(|e| e.error.code.as_deref())
            .is_some_and(|c| c == "quota_exceeded")
    {
        error = error.with_kind(ErrorKind::QuotaExceeded);
    }
    if let Some(delay) = retry_after {
        error = error.with_retry_after(delay);
    }
    error
}

pub struct HttpGenerationClientBuilder {
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpGenerationClientBuilder {
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Result<HttpGenerationClient> {
        let mut base_url = Url::parse(&self.base_url)
            .map_err(|e| Error::InvalidRequest(format!("invalid base url: {e}")))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let http = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(GenerationError::from)?;

        Ok(HttpGenerationClient {
            http,
            base_url,
            api_key: self.api_key,
        })
    }
}

#[derive(serde::Serialize)]
struct GenerateBody<'a> {
    job_id: &'a str,
    #[serde(flatten)]
    request: &'a GenerationRequest,
}

#[async_trait]
impl GenerationClient for HttpGenerationClient {
    fn name(&self) -> &str {
        "http"
    }

    async fn generate(
        &self,
        job_id: &JobId,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> std::result::Result<GenerationResponse, GenerationError> {
        let url = self.endpoint("")?;
        let body = GenerateBody {
            job_id: job_id.as_str(),
            request,
        };
        let call = async {
            let response = self
                .send(self.request(reqwest::Method::POST, url).json(&body))
                .await?;
            Ok::<_, GenerationError>(response.json::<GenerationResponse>().await?)
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GenerationError::cancelled()),
            result = call => result,
        }
    }

    async fn cancel(&self, job_id: &JobId) -> std::result::Result<(), GenerationError> {
        let url = self.endpoint(&format!("{job_id}/cancel"))?;
        self.send(self.request(reqwest::Method::POST, url)).await?;
        tracing::debug!(job_id = %job_id, "Cancellation sent to generation API");
        Ok(())
    }
}

#[async_trait]
impl JobStatusSource for HttpGenerationClient {
    async fn fetch_status(&self, job_id: &JobId) -> Result<RemoteStatus> {
        let url = self.endpoint(job_id.as_str())?;
        let response = self.send(self.request(reqwest::Method::GET, url)).await?;
        response
            .json::<RemoteStatus>()
            .await
            .map_err(|e| Error::Generation(e.into()))
    }
}
