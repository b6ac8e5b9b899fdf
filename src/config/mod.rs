//! Configuration for the orchestration core.
//!
//! ```rust,no_run
//! use genflow::config::CoreConfig;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CoreConfig::from_file("genflow.json")?;
//! let api = config.resilience.resolve("generation_api");
//! println!("generation timeout: {:?}", api.timeout());
//! # Ok(())
//! # }
//! ```

mod resilience;

pub use resilience::{
    CircuitOverride, EndpointClass, EndpointConfig, EndpointOverride, RateLimitOverride,
    ResilienceSettings, RetryOverride,
};

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::events::DEFAULT_EVENT_CAPACITY;
use crate::polling::PollingConfig;
use crate::workflow::{BatchConfig, WorkflowConfig};

/// Errors that can occur in configuration operations
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid value for {key}: {message}")]
    InvalidValue {
        /// The key with invalid value
        key: String,
        /// Error message
        message: String,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Multiple validation errors
    #[error("{0}")]
    ValidationErrors(ValidationErrors),
}

#[derive(Debug)]
pub struct ValidationErrors(pub Vec<ConfigError>);

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Validation failed: ")?;
        let msgs: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", msgs.join("; "))
    }
}

/// Result type for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

pub(crate) fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

/// Everything the core reads at startup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub resilience: ResilienceSettings,
    pub polling: PollingConfig,
    pub workflow: WorkflowConfig,
    pub batch: BatchConfig,
    pub event_capacity: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            resilience: ResilienceSettings::default(),
            polling: PollingConfig::default(),
            workflow: WorkflowConfig::default(),
            batch: BatchConfig::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl CoreConfig {
    /// Parses and validates a JSON document. Missing fields take defaults.
    pub fn from_json(json: &str) -> ConfigResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn with_resilience(mut self, resilience: ResilienceSettings) -> Self {
        self.resilience = resilience;
        self
    }

    pub fn with_polling(mut self, polling: PollingConfig) -> Self {
        self.polling = polling;
        self
    }

    pub fn with_workflow(mut self, workflow: WorkflowConfig) -> Self {
        self.workflow = workflow;
        self
    }

    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    /// Checks every section and reports all problems at once.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        self.resilience.collect_errors(&mut errors);
        self.polling.collect_errors(&mut errors);
        self.workflow.collect_errors(&mut errors);
        self.batch.collect_errors(&mut errors);
        if self.event_capacity == 0 {
            errors.push(invalid("event_capacity", "must be at least 1"));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::ValidationErrors(ValidationErrors(errors)))
        }
    }
}
