//! Health check probes with bounded retries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DeploymentConfig;
use crate::errors::DeployError;

/// One named health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Service name reported on failure
    pub service: String,

    /// URL to GET. `{target}` is replaced by the probed variant.
    pub endpoint: String,

    #[serde(default = "default_expected_status")]
    pub expected_status: u16,

    /// Per-probe timeout; falls back to `timeouts.health_check_secs`
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Attempts before the check is considered failed
    #[serde(default = "default_retries")]
    pub retries: u32,
}

fn default_expected_status() -> u16 {
    200
}

fn default_retries() -> u32 {
    3
}

impl HealthCheck {
    pub fn new(service: &str, endpoint: &str) -> Self {
        Self {
            service: service.to_string(),
            endpoint: endpoint.to_string(),
            expected_status: default_expected_status(),
            timeout_ms: None,
            retries: default_retries(),
        }
    }

    /// Endpoint for a target variant.
    ///
    /// Without a target the placeholder and a leading dash are dropped, so
    /// `http://api-{target}.svc/health` probes `http://api.svc/health`.
    pub fn url_for(&self, target: Option<&str>) -> String {
        match target {
            Some(target) => self.endpoint.replace("{target}", target),
            None => self.endpoint.replace("-{target}", "").replace("{target}", ""),
        }
    }
}

/// Issues a GET and reports the status code
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, url: &str, timeout: Duration) -> Result<u16, DeployError>;
}

/// HTTP probe backed by reqwest
pub struct ReqwestProbe {
    client: reqwest::Client,
}

impl ReqwestProbe {
    pub fn new() -> Result<Self, DeployError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("cutover/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Probe for ReqwestProbe {
    async fn probe(&self, url: &str, timeout: Duration) -> Result<u16, DeployError> {
        let response = self.client.get(url).timeout(timeout).send().await?;
        Ok(response.status().as_u16())
    }
}

/// Runs the configured health checks
pub struct HealthChecker {
    checks: Vec<HealthCheck>,
    probe: Arc<dyn Probe>,
    retry_delay: Duration,
    default_timeout: Duration,
}

impl HealthChecker {
    pub fn new(
        checks: Vec<HealthCheck>,
        probe: Arc<dyn Probe>,
        retry_delay: Duration,
        default_timeout: Duration,
    ) -> Self {
        Self {
            checks,
            probe,
            retry_delay,
            default_timeout,
        }
    }

    pub fn from_config(config: &DeploymentConfig, probe: Arc<dyn Probe>) -> Self {
        Self::new(
            config.health_checks.clone(),
            probe,
            config.health_retry_delay(),
            config.timeouts.health_check(),
        )
    }

    pub fn checks(&self) -> &[HealthCheck] {
        &self.checks
    }

    /// Probe every check against `target`.
    ///
    /// Returns `HealthCheck` naming every check that never succeeded, or
    /// `Cancelled` if the token fires first.
    pub async fn check_all(
        &self,
        target: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(), DeployError> {
        if self.checks.is_empty() {
            debug!("no health checks configured");
            return Ok(());
        }

        let results = join_all(
            self.checks
                .iter()
                .map(|check| self.check_one(check, target, cancel)),
        )
        .await;

        let mut failed = Vec::new();
        for (check, result) in self.checks.iter().zip(results) {
            if !result? {
                failed.push(check.service.clone());
            }
        }

        if failed.is_empty() {
            info!(variant = target.unwrap_or("live"), checks = self.checks.len(), "health checks passed");
            Ok(())
        } else {
            warn!(variant = target.unwrap_or("live"), failed = ?failed, "health checks failed");
            Err(DeployError::HealthCheck { failed })
        }
    }

    async fn check_one(
        &self,
        check: &HealthCheck,
        target: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<bool, DeployError> {
        let url = check.url_for(target);
        let timeout = check
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);
        let attempts = check.retries.max(1);

        for attempt in 1..=attempts {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(DeployError::Cancelled(format!("health check {}", check.service)));
                }
                outcome = tokio::time::timeout(timeout, self.probe.probe(&url, timeout)) => outcome,
            };

            match outcome {
                Ok(Ok(status)) if status == check.expected_status => {
                    debug!(service = %check.service, %url, attempt, "health check passed");
                    return Ok(true);
                }
                Ok(Ok(status)) => {
                    debug!(service = %check.service, %url, attempt, status, expected = check.expected_status, "unexpected status");
                }
                Ok(Err(e)) => {
                    debug!(service = %check.service, %url, attempt, error = %e, "probe failed");
                }
                Err(_) => {
                    debug!(service = %check.service, %url, attempt, "probe timed out");
                }
            }

            if attempt < attempts {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return Err(DeployError::Cancelled(format!("health check {}", check.service)));
                    }
                    _ = tokio::time::sleep(self.retry_delay) => {}
                }
            }
        }

        Ok(false)
    }
}
