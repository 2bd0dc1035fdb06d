//! Canary observation
//!
//! Samples health and error rate of the canary variant at a fixed interval
//! for the whole observation window and fails on the first bad sample.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DeploymentConfig;
use crate::errors::DeployError;
use crate::health::checker::HealthChecker;
use crate::metrics::MetricsBackend;

/// Health checks of the canary use this as `{target}`
pub const CANARY_TARGET: &str = "canary";

#[derive(Debug, Clone, PartialEq)]
pub enum CanaryVerdict {
    Healthy,
    Unhealthy(String),
}

impl CanaryVerdict {
    pub fn is_healthy(&self) -> bool {
        matches!(self, CanaryVerdict::Healthy)
    }
}

pub struct CanaryMonitor {
    health: Arc<HealthChecker>,
    metrics: Arc<dyn MetricsBackend>,
    service: String,
    interval: Duration,
    max_error_rate: f64,
}

impl CanaryMonitor {
    pub fn new(
        health: Arc<HealthChecker>,
        metrics: Arc<dyn MetricsBackend>,
        service: &str,
        interval: Duration,
        max_error_rate: f64,
    ) -> Self {
        Self {
            health,
            metrics,
            service: service.to_string(),
            interval,
            max_error_rate,
        }
    }

    pub fn from_config(
        config: &DeploymentConfig,
        health: Arc<HealthChecker>,
        metrics: Arc<dyn MetricsBackend>,
    ) -> Self {
        Self::new(
            health,
            metrics,
            config.metrics_service(),
            config.monitoring.observation_interval(),
            config.rollback.max_error_rate,
        )
    }

    /// Observe `version` for `duration`.
    ///
    /// The first sample is taken immediately. An unreachable metrics backend
    /// counts as a failed sample.
    pub async fn observe(
        &self,
        version: &str,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<CanaryVerdict, DeployError> {
        let deadline = Instant::now() + duration;
        let mut samples = 0u32;

        loop {
            samples += 1;
            if let Some(reason) = self.sample(version, cancel).await? {
                warn!(%version, samples, %reason, "canary unhealthy");
                return Ok(CanaryVerdict::Unhealthy(reason));
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wait = self.interval.min(deadline - now);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(DeployError::Cancelled(format!("canary observation of {}", version)));
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!(%version, samples, "canary observation passed");
        Ok(CanaryVerdict::Healthy)
    }

    /// One sample; `Some(reason)` when unhealthy
    async fn sample(
        &self,
        version: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, DeployError> {
        match self.health.check_all(Some(CANARY_TARGET), cancel).await {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => return Ok(Some(e.to_string())),
        }

        match self
            .metrics
            .error_rate(&self.service, version, self.interval)
            .await
        {
            Ok(rate) if rate > self.max_error_rate => Ok(Some(format!(
                "error rate {:.4} above {:.4}",
                rate, self.max_error_rate
            ))),
            Ok(rate) => {
                debug!(%version, rate, "canary error rate");
                Ok(None)
            }
            Err(e) => Ok(Some(format!("error rate unavailable: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::checker::Probe;
    use crate::metrics::DeploymentAnnotation;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct AlwaysUp;

    #[async_trait]
    impl Probe for AlwaysUp {
        async fn probe(&self, _url: &str, _timeout: Duration) -> Result<u16, DeployError> {
            Ok(200)
        }
    }

    /// Returns scripted error rates in order; `None` is an outage
    struct ScriptedRates {
        rates: Mutex<Vec<Option<f64>>>,
        queries: Mutex<u32>,
    }

    impl ScriptedRates {
        fn new(rates: &[Option<f64>]) -> Self {
            Self {
                rates: Mutex::new(rates.to_vec()),
                queries: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl MetricsBackend for ScriptedRates {
        async fn error_rate(&self, _s: &str, _v: &str, _w: Duration) -> Result<f64, DeployError> {
            *self.queries.lock().unwrap() += 1;
            let mut rates = self.rates.lock().unwrap();
            let next = if rates.len() > 1 { rates.remove(0) } else { rates[0] };
            next.ok_or_else(|| DeployError::Metrics("Prometheus unreachable".to_string()))
        }

        async fn p99_latency_ms(&self, _s: &str, _v: &str, _w: Duration) -> Result<Option<f64>, DeployError> {
            Ok(None)
        }

        async fn annotate(&self, _a: &DeploymentAnnotation) -> Result<(), DeployError> {
            Ok(())
        }
    }

    fn monitor(metrics: Arc<ScriptedRates>) -> CanaryMonitor {
        let health = Arc::new(HealthChecker::new(
            vec![crate::health::checker::HealthCheck::new("api", "http://api-{target}/health")],
            Arc::new(AlwaysUp),
            Duration::from_secs(1),
            Duration::from_secs(1),
        ));
        CanaryMonitor::new(health, metrics, "api", Duration::from_secs(10), 0.05)
    }

    #[tokio::test(start_paused = true)]
    async fn test_samples_whole_window() {
        let metrics = Arc::new(ScriptedRates::new(&[Some(0.01)]));
        let verdict = monitor(metrics.clone())
            .observe("v2", Duration::from_secs(60), &CancellationToken::new())
            .await
            .unwrap();

        assert!(verdict.is_healthy());
        // t = 0, 10, .., 60
        assert_eq!(*metrics.queries.lock().unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_fast_on_high_error_rate() {
        let metrics = Arc::new(ScriptedRates::new(&[Some(0.01), Some(0.2), Some(0.01)]));
        let verdict = monitor(metrics.clone())
            .observe("v2", Duration::from_secs(300), &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(verdict, CanaryVerdict::Unhealthy(ref r) if r.contains("error rate")));
        assert_eq!(*metrics.queries.lock().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_outage_is_unhealthy() {
        let metrics = Arc::new(ScriptedRates::new(&[None]));
        let verdict = monitor(metrics)
            .observe("v2", Duration::from_secs(30), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!verdict.is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_observation() {
        let metrics = Arc::new(ScriptedRates::new(&[Some(0.0)]));
        let monitor = monitor(metrics);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(25)).await;
            trigger.cancel();
        });

        let err = monitor
            .observe("v2", Duration::from_secs(300), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
