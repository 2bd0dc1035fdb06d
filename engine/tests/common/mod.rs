//! Fakes shared by the integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use cutover::config::DeploymentConfig;
use cutover::deploy::command::{CommandOutput, CommandRunner, CommandSpec};
use cutover::deploy::Orchestrator;
use cutover::errors::DeployError;
use cutover::health::{HealthCheck, Probe};
use cutover::metrics::{DeploymentAnnotation, MetricsBackend};
use cutover::telemetry::{ResourceProbe, ResourceUsage};

/// Command runner standing in for docker, kubectl and shell tools.
///
/// Records every command. `kubectl get deployment` reports ready unless the
/// deployment is listed in `never_ready`; `kubectl get service` reports the
/// colour in `selector`. Commands containing a `fail_on` pattern exit 1,
/// commands containing a `slow_on` pattern take that long.
#[derive(Default)]
pub struct ScriptedRunner {
    pub commands: Mutex<Vec<CommandSpec>>,
    pub selector: Mutex<Option<String>>,
    pub never_ready: Mutex<Vec<String>>,
    pub fail_on: Mutex<Vec<String>>,
    pub slow_on: Mutex<Vec<(String, Duration)>>,
}

impl ScriptedRunner {
    pub fn lines(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.line.clone())
            .collect()
    }

    pub fn count(&self, pattern: &str) -> usize {
        self.lines().iter().filter(|l| l.contains(pattern)).count()
    }

    pub fn fail_on(&self, pattern: &str) {
        self.fail_on.lock().unwrap().push(pattern.to_string());
    }

    pub fn slow_on(&self, pattern: &str, delay: Duration) {
        self.slow_on.lock().unwrap().push((pattern.to_string(), delay));
    }

    pub fn never_ready(&self, deployment: &str) {
        self.never_ready.lock().unwrap().push(deployment.to_string());
    }

    pub fn clear(&self) {
        self.commands.lock().unwrap().clear();
    }

    /// Kind/name of every applied resource, in order
    pub fn applied(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.line.contains(" apply "))
            .flat_map(|c| {
                let payload: serde_json::Value =
                    serde_json::from_str(c.stdin.as_deref().unwrap_or("{}")).unwrap();
                payload["items"]
                    .as_array()
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .map(|item| {
                        format!(
                            "{}/{}",
                            item["kind"].as_str().unwrap_or_default(),
                            item["metadata"]["name"].as_str().unwrap_or_default()
                        )
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Image of the last applied deployment with this name
    pub fn applied_image(&self, deployment: &str) -> Option<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| c.stdin.as_deref())
            .filter_map(|stdin| serde_json::from_str::<serde_json::Value>(stdin).ok())
            .flat_map(|payload| payload["items"].as_array().cloned().unwrap_or_default())
            .filter(|item| item["kind"] == "Deployment" && item["metadata"]["name"] == deployment)
            .last()
            .and_then(|item| {
                item["spec"]["template"]["spec"]["containers"][0]["image"]
                    .as_str()
                    .map(String::from)
            })
    }

    /// Canary weights (percent) of every applied TrafficSplit, in order
    pub fn split_weights(&self) -> Vec<u64> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| c.stdin.as_deref())
            .filter_map(|stdin| {
                let payload: serde_json::Value = serde_json::from_str(stdin).ok()?;
                let split = payload["items"]
                    .as_array()?
                    .iter()
                    .find(|i| i["kind"] == "TrafficSplit")?
                    .clone();
                split["spec"]["backends"][1]["weight"].as_u64()
            })
            .collect()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, DeployError> {
        self.commands.lock().unwrap().push(spec.clone());

        let delay = self
            .slow_on
            .lock()
            .unwrap()
            .iter()
            .find(|(p, _)| spec.line.contains(p.as_str()))
            .map(|(_, d)| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self
            .fail_on
            .lock()
            .unwrap()
            .iter()
            .any(|p| spec.line.contains(p.as_str()))
        {
            return Err(DeployError::Command {
                command: spec.line.clone(),
                code: Some(1),
                output: "scripted failure".to_string(),
            });
        }

        let words: Vec<&str> = spec.line.split_whitespace().collect();
        match (words.get(1), words.get(2)) {
            (Some(&"get"), Some(&"service")) => {
                let selector = self.selector.lock().unwrap().clone().unwrap_or_default();
                Ok(CommandOutput::from_stdout(selector))
            }
            (Some(&"get"), Some(&"deployment")) => {
                let name = words.get(3).copied().unwrap_or_default();
                let ready = if self.never_ready.lock().unwrap().iter().any(|n| n == name) {
                    0
                } else {
                    3
                };
                let state = json!({
                    "metadata": { "generation": 2 },
                    "spec": { "replicas": 3 },
                    "status": {
                        "observedGeneration": 2,
                        "replicas": 3,
                        "updatedReplicas": 3,
                        "readyReplicas": ready
                    }
                });
                Ok(CommandOutput::from_stdout(state.to_string()))
            }
            _ => Ok(CommandOutput::default()),
        }
    }
}

/// Probe returning per-URL status codes, 200 otherwise
#[derive(Default)]
pub struct FakeProbe {
    pub codes: Mutex<HashMap<String, u16>>,
    pub urls: Mutex<Vec<String>>,
}

impl FakeProbe {
    pub fn respond(&self, url: &str, code: u16) {
        self.codes.lock().unwrap().insert(url.to_string(), code);
    }

    pub fn probed(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Probe for FakeProbe {
    async fn probe(&self, url: &str, _timeout: Duration) -> Result<u16, DeployError> {
        self.urls.lock().unwrap().push(url.to_string());
        Ok(*self.codes.lock().unwrap().get(url).unwrap_or(&200))
    }
}

/// Metrics backend with per-version error rates
pub struct FakeMetrics {
    pub default_rate: Mutex<f64>,
    pub rates: Mutex<HashMap<String, f64>>,
    pub unreachable: Mutex<bool>,
    pub latency_ms: Mutex<Option<f64>>,
    pub annotations: Mutex<Vec<DeploymentAnnotation>>,
    pub fail_annotations: Mutex<bool>,
}

impl Default for FakeMetrics {
    fn default() -> Self {
        Self {
            default_rate: Mutex::new(0.001),
            rates: Mutex::new(HashMap::new()),
            unreachable: Mutex::new(false),
            latency_ms: Mutex::new(None),
            annotations: Mutex::new(Vec::new()),
            fail_annotations: Mutex::new(false),
        }
    }
}

impl FakeMetrics {
    pub fn set_rate(&self, version: &str, rate: f64) {
        self.rates.lock().unwrap().insert(version.to_string(), rate);
    }
}

#[async_trait]
impl MetricsBackend for FakeMetrics {
    async fn error_rate(&self, _service: &str, version: &str, _window: Duration) -> Result<f64, DeployError> {
        if *self.unreachable.lock().unwrap() {
            return Err(DeployError::Metrics("Prometheus unreachable".to_string()));
        }
        let rates = self.rates.lock().unwrap();
        Ok(rates
            .get(version)
            .copied()
            .unwrap_or(*self.default_rate.lock().unwrap()))
    }

    async fn p99_latency_ms(&self, _service: &str, _version: &str, _window: Duration) -> Result<Option<f64>, DeployError> {
        Ok(*self.latency_ms.lock().unwrap())
    }

    async fn annotate(&self, annotation: &DeploymentAnnotation) -> Result<(), DeployError> {
        if *self.fail_annotations.lock().unwrap() {
            return Err(DeployError::Metrics("Grafana returned 500".to_string()));
        }
        self.annotations.lock().unwrap().push(annotation.clone());
        Ok(())
    }
}

/// Fixed host usage
pub struct FakeResources {
    pub disk_percent: Mutex<f32>,
    pub memory_percent: Mutex<f32>,
}

impl Default for FakeResources {
    fn default() -> Self {
        Self {
            disk_percent: Mutex::new(40.0),
            memory_percent: Mutex::new(50.0),
        }
    }
}

impl ResourceProbe for FakeResources {
    fn usage(&self) -> ResourceUsage {
        let disk_percent = *self.disk_percent.lock().unwrap();
        let memory_percent = *self.memory_percent.lock().unwrap();
        ResourceUsage {
            disk_used: (disk_percent * 10.0) as u64,
            disk_total: 1000,
            disk_percent,
            memory_used: (memory_percent * 10.0) as u64,
            memory_total: 1000,
            memory_percent,
        }
    }
}

/// Fakes wired into one orchestrator
pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub runner: Arc<ScriptedRunner>,
    pub probe: Arc<FakeProbe>,
    pub metrics: Arc<FakeMetrics>,
    pub resources: Arc<FakeResources>,
}

impl Harness {
    pub fn new(config: DeploymentConfig) -> Self {
        let runner = Arc::new(ScriptedRunner::default());
        let probe = Arc::new(FakeProbe::default());
        let metrics = Arc::new(FakeMetrics::default());
        let resources = Arc::new(FakeResources::default());
        let orchestrator = Arc::new(Orchestrator::new(
            config,
            runner.clone(),
            probe.clone(),
            metrics.clone(),
            resources.clone(),
        ));
        Self {
            orchestrator,
            runner,
            probe,
            metrics,
            resources,
        }
    }
}

/// Staging config for image `api` with short timeouts and one health check
pub fn config() -> DeploymentConfig {
    let mut config = DeploymentConfig::new("staging", "api");
    config.registry.url = "registry.local/acme".to_string();
    config.health_checks = vec![HealthCheck::new(
        "api",
        "http://api-{target}.staging.svc/health",
    )];
    config.health_retry_delay_ms = 100;
    config.timeouts.readiness_secs = 60;
    config.timeouts.readiness_poll_ms = 1_000;
    config.canary.observation_secs = 30;
    config.monitoring.observation_interval_secs = 10;
    config.tests.command = Some("docker run --rm {image} make test".to_string());
    config
}
