//! Metrics and dashboard backends

pub mod prometheus;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::deploy::strategy::StrategyKind;
use crate::errors::DeployError;

pub use prometheus::HttpMetricsBackend;

/// Dashboard annotation marking a deployment
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentAnnotation {
    pub environment: String,
    pub version: String,
    pub strategy: StrategyKind,
    pub text: String,
    pub tags: Vec<String>,
}

impl DeploymentAnnotation {
    pub fn new(environment: &str, version: &str, strategy: StrategyKind) -> Self {
        Self {
            environment: environment.to_string(),
            version: version.to_string(),
            strategy,
            text: format!("Deployed {} to {} ({})", version, environment, strategy),
            tags: vec![
                "deployment".to_string(),
                environment.to_string(),
                version.to_string(),
            ],
        }
    }
}

/// Source of service error rates and latency
#[async_trait]
pub trait MetricsBackend: Send + Sync {
    /// Fraction of failed requests in `window`, between 0 and 1.
    /// A query with no samples is an error, never a zero rate.
    async fn error_rate(
        &self,
        service: &str,
        version: &str,
        window: Duration,
    ) -> Result<f64, DeployError>;

    /// 99th percentile latency in milliseconds, `None` when not configured
    async fn p99_latency_ms(
        &self,
        service: &str,
        version: &str,
        window: Duration,
    ) -> Result<Option<f64>, DeployError>;

    async fn annotate(&self, annotation: &DeploymentAnnotation) -> Result<(), DeployError>;
}
