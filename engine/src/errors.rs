//! Error types for the deployment engine

use std::time::Duration;

use thiserror::Error;

/// Main error type for the deployment engine
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Missing environment, secret or tool, or an invalid cluster context.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Disk or memory above the hard threshold.
    #[error("Resource error: {0}")]
    Resource(String),

    #[error("Deployment {0} is already in progress")]
    DeploymentInProgress(String),

    #[error("Command `{command}` exited with code {code:?}: {output}")]
    Command {
        command: String,
        code: Option<i32>,
        output: String,
    },

    #[error("Command `{command}` timed out after {timeout:?}")]
    CommandTimeout { command: String, timeout: Duration },

    #[error("{resource} not ready after {timeout:?}")]
    ReadinessTimeout { resource: String, timeout: Duration },

    #[error("Health checks failed: {}", failed.join(", "))]
    HealthCheck { failed: Vec<String> },

    #[error("Canary violation: {0}")]
    CanaryViolation(String),

    #[error("Error rate {rate:.4} exceeds maximum {max:.4}")]
    ErrorRateExceeded { rate: f64, max: f64 },

    #[error("Metrics error: {0}")]
    Metrics(String),

    #[error("No previous version to roll back to ({0} recorded)")]
    NoPreviousVersion(usize),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeployError {
    /// Failures that pre-deployment checks raise. They are fatal and never retried.
    pub fn is_precheck_class(&self) -> bool {
        matches!(
            self,
            DeployError::Configuration(_)
                | DeployError::Resource(_)
                | DeployError::DeploymentInProgress(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DeployError::Cancelled(_))
    }
}
