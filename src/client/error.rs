//! Generation API error types.
//!
//! Every failure observed at the API boundary is classified into a closed
//! [`ErrorKind`] here, so retry and circuit-breaker decisions never have to
//! inspect status codes or message text further up the stack.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// HTTP statuses that are worth retrying after a delay.
pub const RETRYABLE_STATUS_CODES: &[u16] = &[408, 429, 502, 503, 504, 520, 521, 522, 523, 524];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection refused, reset, DNS failure.
    Network,
    Timeout,
    /// Upstream said slow down (HTTP 429 without a quota marker).
    RateLimited,
    ServiceUnavailable,
    Unauthorized,
    Forbidden,
    QuotaExceeded,
    Validation,
    NotFound,
    /// Any other 5xx.
    Server,
    /// Response arrived but could not be decoded.
    Decode,
    Cancelled,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::ServiceUnavailable => "service_unavailable",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::QuotaExceeded => "quota_exceeded",
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Server => "server",
            Self::Decode => "decode",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed call to the generation API.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind} ({}): {message}", .status.map(|s| format!("HTTP {s}")).unwrap_or_else(|| "no status".into()))]
pub struct GenerationError {
    pub kind: ErrorKind,
    pub status: Option<u16>,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl GenerationError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Classifies an HTTP error status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            400 | 422 => ErrorKind::Validation,
            401 => ErrorKind::Unauthorized,
            402 => ErrorKind::QuotaExceeded,
            403 => ErrorKind::Forbidden,
            404 => ErrorKind::NotFound,
            408 => ErrorKind::Timeout,
            429 => ErrorKind::RateLimited,
            503 => ErrorKind::ServiceUnavailable,
            500..=599 => ErrorKind::Server,
            _ => ErrorKind::Unknown,
        };
        Self {
            kind,
            status: Some(status),
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "request cancelled")
    }

    pub fn is_retryable(&self) -> bool {
        // Quota errors may arrive as 429 but will not clear by waiting.
        if matches!(self.kind, ErrorKind::QuotaExceeded | ErrorKind::Cancelled) {
            return false;
        }
        matches!(
            self.kind,
            ErrorKind::Network
                | ErrorKind::Timeout
                | ErrorKind::RateLimited
                | ErrorKind::ServiceUnavailable
        ) || self
            .status
            .is_some_and(|s| RETRYABLE_STATUS_CODES.contains(&s))
    }

    /// Whether this failure should count against the circuit breaker.
    pub fn trips_circuit(&self) -> bool {
        self.is_retryable()
            || matches!(
                self.kind,
                ErrorKind::Unauthorized
                    | ErrorKind::Forbidden
                    | ErrorKind::QuotaExceeded
                    | ErrorKind::Validation
            )
    }
}

impl From<reqwest::Error> for GenerationError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(status.as_u16(), err.to_string());
        }
        let kind = if err.is_timeout() {
            ErrorKind::Timeout
        } else if err.is_decode() {
            ErrorKind::Decode
        } else if err.is_builder() {
            ErrorKind::Validation
        } else {
            ErrorKind::Network
        };
        Self::new(kind, err.to_string())
    }
}
