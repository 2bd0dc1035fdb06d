//! Deployment configuration

use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::deploy::strategy::StrategyKind;
use crate::errors::DeployError;
use crate::filesys::file::File;
use crate::health::checker::HealthCheck;
use crate::logs::LogLevel;

/// Immutable configuration of one deployment target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Environment identifier (e.g. `staging`, `production`)
    pub environment: String,

    /// Rollout strategy
    #[serde(default)]
    pub strategy: StrategyKind,

    /// Log level for the binary
    #[serde(default)]
    pub log_level: LogLevel,

    #[serde(default)]
    pub timeouts: TimeoutSettings,

    #[serde(default)]
    pub registry: RegistrySettings,

    #[serde(default)]
    pub cluster: ClusterSettings,

    #[serde(default)]
    pub migrations: MigrationSettings,

    #[serde(default)]
    pub tests: TestSettings,

    #[serde(default)]
    pub monitoring: MonitoringSettings,

    /// Health checks run during verification and canary observation
    #[serde(default)]
    pub health_checks: Vec<HealthCheck>,

    /// Fixed delay between attempts of a single health check
    #[serde(default = "default_health_retry_delay_ms")]
    pub health_retry_delay_ms: u64,

    #[serde(default)]
    pub canary: CanarySettings,

    #[serde(default)]
    pub rollback: RollbackSettings,

    #[serde(default)]
    pub resources: ResourceSettings,

    #[serde(default)]
    pub preflight: PreflightSettings,

    #[serde(default)]
    pub server: ServerSettings,
}

fn default_health_retry_delay_ms() -> u64 {
    5_000
}

impl DeploymentConfig {
    /// Minimal configuration for an environment and image; everything else defaulted
    pub fn new(environment: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            strategy: StrategyKind::default(),
            log_level: LogLevel::default(),
            timeouts: TimeoutSettings::default(),
            registry: RegistrySettings {
                image: image.into(),
                ..Default::default()
            },
            cluster: ClusterSettings::default(),
            migrations: MigrationSettings::default(),
            tests: TestSettings::default(),
            monitoring: MonitoringSettings::default(),
            health_checks: Vec::new(),
            health_retry_delay_ms: default_health_retry_delay_ms(),
            canary: CanarySettings::default(),
            rollback: RollbackSettings::default(),
            resources: ResourceSettings::default(),
            preflight: PreflightSettings::default(),
            server: ServerSettings::default(),
        }
    }

    /// Load and validate a JSON settings file
    pub async fn load(file: &File) -> Result<Self, DeployError> {
        let config: DeploymentConfig = file.read_json().await?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants the orchestrator relies on
    pub fn validate(&self) -> Result<(), DeployError> {
        if self.environment.trim().is_empty() {
            return Err(DeployError::Configuration(
                "environment must not be empty".to_string(),
            ));
        }
        if self.registry.image.trim().is_empty() {
            return Err(DeployError::Configuration(
                "registry.image must not be empty".to_string(),
            ));
        }
        if self.timeouts.readiness_secs == 0 {
            return Err(DeployError::Configuration(
                "timeouts.readiness_secs must be greater than zero".to_string(),
            ));
        }

        self.canary.validate()?;

        if !(0.0..=1.0).contains(&self.rollback.max_error_rate) {
            return Err(DeployError::Configuration(format!(
                "rollback.max_error_rate must be within [0, 1], got {}",
                self.rollback.max_error_rate
            )));
        }
        if self.rollback.keep_previous_versions == 0 {
            return Err(DeployError::Configuration(
                "rollback.keep_previous_versions must be at least 1".to_string(),
            ));
        }
        if self.rollback.keep_previous_versions == 1 {
            warn!("rollback.keep_previous_versions is 1; rollback will never have a previous version");
        }

        if self.resources.disk_warning_percent > self.resources.disk_max_percent {
            return Err(DeployError::Configuration(format!(
                "resources.disk_warning_percent ({}) exceeds disk_max_percent ({})",
                self.resources.disk_warning_percent, self.resources.disk_max_percent
            )));
        }

        if self.migrations.enabled && self.migrations.command.is_none() {
            return Err(DeployError::Configuration(
                "migrations.enabled requires migrations.command".to_string(),
            ));
        }
        if self.migrations.enabled
            && self.migrations.backup_first
            && self.migrations.backup_command.is_none()
        {
            return Err(DeployError::Configuration(
                "migrations.backup_first requires migrations.backup_command".to_string(),
            ));
        }

        Ok(())
    }

    /// Base name of the cluster resources
    pub fn app_name(&self) -> &str {
        self.cluster.app.as_deref().unwrap_or(&self.registry.image)
    }

    /// Service label used in metrics queries
    pub fn metrics_service(&self) -> &str {
        self.monitoring.service.as_deref().unwrap_or_else(|| self.app_name())
    }

    pub fn health_retry_delay(&self) -> Duration {
        Duration::from_millis(self.health_retry_delay_ms)
    }
}

/// Timeouts applied across the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    /// Default per-probe health check timeout
    #[serde(default = "default_health_check_secs")]
    pub health_check_secs: u64,

    /// Maximum wait for a rollout to become ready
    #[serde(default = "default_readiness_secs")]
    pub readiness_secs: u64,

    /// Wait for old instances to terminate (recreate)
    #[serde(default = "default_graceful_shutdown_secs")]
    pub graceful_shutdown_secs: u64,

    /// Default timeout of any external command
    #[serde(default = "default_command_secs")]
    pub command_secs: u64,

    /// Interval between rollout state queries
    #[serde(default = "default_readiness_poll_ms")]
    pub readiness_poll_ms: u64,
}

fn default_health_check_secs() -> u64 {
    30
}

fn default_readiness_secs() -> u64 {
    300
}

fn default_graceful_shutdown_secs() -> u64 {
    30
}

fn default_command_secs() -> u64 {
    600
}

fn default_readiness_poll_ms() -> u64 {
    2_000
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            health_check_secs: default_health_check_secs(),
            readiness_secs: default_readiness_secs(),
            graceful_shutdown_secs: default_graceful_shutdown_secs(),
            command_secs: default_command_secs(),
            readiness_poll_ms: default_readiness_poll_ms(),
        }
    }
}

impl TimeoutSettings {
    pub fn health_check(&self) -> Duration {
        Duration::from_secs(self.health_check_secs)
    }

    pub fn readiness(&self) -> Duration {
        Duration::from_secs(self.readiness_secs)
    }

    pub fn graceful_shutdown(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_secs)
    }

    pub fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    pub fn readiness_poll(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_ms)
    }
}

/// Container registry and image coordinates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySettings {
    /// Registry prefix, e.g. `ghcr.io/acme`. Empty for local images.
    #[serde(default)]
    pub url: String,

    /// Image repository name
    #[serde(default)]
    pub image: String,

    /// Registry user for `docker login`
    #[serde(default)]
    pub username: Option<String>,

    /// Name of the environment variable holding the registry password
    #[serde(default)]
    pub password_env: Option<String>,

    /// Docker build context
    #[serde(default = "default_build_context")]
    pub build_context: String,

    /// Dockerfile path relative to the build context
    #[serde(default = "default_dockerfile")]
    pub dockerfile: String,
}

fn default_build_context() -> String {
    ".".to_string()
}

fn default_dockerfile() -> String {
    "Dockerfile".to_string()
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            image: String::new(),
            username: None,
            password_env: None,
            build_context: default_build_context(),
            dockerfile: default_dockerfile(),
        }
    }
}

impl RegistrySettings {
    /// Fully qualified image reference for a version
    pub fn image_ref(&self, version: &str) -> String {
        let url = self.url.trim_end_matches('/');
        if url.is_empty() {
            format!("{}:{}", self.image, version)
        } else {
            format!("{}/{}:{}", url, self.image, version)
        }
    }

    /// Registry host used for `docker login`
    pub fn host(&self) -> &str {
        self.url.split('/').next().unwrap_or_default()
    }

    /// Read the registry password from the environment.
    ///
    /// `Ok(None)` when no password is configured; an error when it is
    /// configured but absent.
    pub fn password(&self) -> Result<Option<SecretString>, DeployError> {
        match &self.password_env {
            None => Ok(None),
            Some(name) => std::env::var(name)
                .ok()
                .filter(|v| !v.is_empty())
                .map(|v| Some(SecretString::from(v)))
                .ok_or_else(|| {
                    DeployError::Configuration(format!(
                        "registry password variable {} is not set",
                        name
                    ))
                }),
        }
    }
}

/// Cluster identity and sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSettings {
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Resource base name; defaults to the image name
    #[serde(default)]
    pub app: Option<String>,

    #[serde(default = "default_container_port")]
    pub container_port: u16,

    #[serde(default = "default_min_replicas")]
    pub min_replicas: u32,

    #[serde(default = "default_max_replicas")]
    pub max_replicas: u32,

    #[serde(default = "default_target_cpu_percent")]
    pub target_cpu_percent: u32,

    /// Rolling update surge, absolute or percentage (e.g. `25%`)
    #[serde(default = "default_max_surge")]
    pub max_surge: String,

    /// Rolling update unavailability, absolute or percentage
    #[serde(default = "default_max_unavailable")]
    pub max_unavailable: String,

    #[serde(default = "default_canary_replicas")]
    pub canary_replicas: u32,

    /// kubectl binary
    #[serde(default = "default_kubectl")]
    pub kubectl: String,
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_container_port() -> u16 {
    8080
}

fn default_min_replicas() -> u32 {
    2
}

fn default_max_replicas() -> u32 {
    10
}

fn default_target_cpu_percent() -> u32 {
    70
}

fn default_max_surge() -> String {
    "25%".to_string()
}

fn default_max_unavailable() -> String {
    "0".to_string()
}

fn default_canary_replicas() -> u32 {
    1
}

fn default_kubectl() -> String {
    "kubectl".to_string()
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            app: None,
            container_port: default_container_port(),
            min_replicas: default_min_replicas(),
            max_replicas: default_max_replicas(),
            target_cpu_percent: default_target_cpu_percent(),
            max_surge: default_max_surge(),
            max_unavailable: default_max_unavailable(),
            canary_replicas: default_canary_replicas(),
            kubectl: default_kubectl(),
        }
    }
}

/// Database migration policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_true")]
    pub backup_first: bool,

    /// Migration runner command, `{version}` is substituted
    #[serde(default)]
    pub command: Option<String>,

    /// Backup command, `{version}` is substituted
    #[serde(default)]
    pub backup_command: Option<String>,

    #[serde(default = "default_migration_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_migration_timeout_secs() -> u64 {
    600
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            backup_first: true,
            command: None,
            backup_command: None,
            timeout_secs: default_migration_timeout_secs(),
        }
    }
}

impl MigrationSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Test step settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSettings {
    /// Test command, `{image}` and `{version}` are substituted. Absent skips the step.
    #[serde(default)]
    pub command: Option<String>,

    #[serde(default = "default_test_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_test_timeout_secs() -> u64 {
    900
}

impl Default for TestSettings {
    fn default() -> Self {
        Self {
            command: None,
            timeout_secs: default_test_timeout_secs(),
        }
    }
}

impl TestSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Monitoring endpoints and queries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringSettings {
    #[serde(default = "default_prometheus_url")]
    pub prometheus_url: String,

    /// Grafana base URL for deployment annotations
    #[serde(default)]
    pub grafana_url: Option<String>,

    /// Name of the environment variable holding the Grafana API token
    #[serde(default)]
    pub grafana_token_env: Option<String>,

    /// Service label in metrics queries; defaults to the app name
    #[serde(default)]
    pub service: Option<String>,

    /// PromQL returning the error rate as a fraction
    #[serde(default = "default_error_rate_query")]
    pub error_rate_query: String,

    /// PromQL returning the p99 latency in milliseconds
    #[serde(default = "default_latency_query")]
    pub latency_query: String,

    /// p99 latency above this during verification is recorded as a warning
    #[serde(default)]
    pub max_latency_ms: Option<f64>,

    /// Canary sample interval
    #[serde(default = "default_observation_interval_secs")]
    pub observation_interval_secs: u64,
}

fn default_prometheus_url() -> String {
    "http://localhost:9090".to_string()
}

fn default_error_rate_query() -> String {
    concat!(
        "sum(rate(http_requests_total{service=\"{service}\",version=\"{version}\",code=~\"5..\"}[{window}]))",
        " / sum(rate(http_requests_total{service=\"{service}\",version=\"{version}\"}[{window}]))"
    )
    .to_string()
}

fn default_latency_query() -> String {
    concat!(
        "histogram_quantile(0.99, sum(rate(http_request_duration_seconds_bucket",
        "{service=\"{service}\",version=\"{version}\"}[{window}])) by (le)) * 1000"
    )
    .to_string()
}

fn default_observation_interval_secs() -> u64 {
    10
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            prometheus_url: default_prometheus_url(),
            grafana_url: None,
            grafana_token_env: None,
            service: None,
            error_rate_query: default_error_rate_query(),
            latency_query: default_latency_query(),
            max_latency_ms: None,
            observation_interval_secs: default_observation_interval_secs(),
        }
    }
}

impl MonitoringSettings {
    pub fn observation_interval(&self) -> Duration {
        Duration::from_secs(self.observation_interval_secs)
    }
}

/// Canary traffic schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanarySettings {
    /// Traffic weights applied in order; the last must be 1.0
    #[serde(default = "default_increments")]
    pub increments: Vec<f64>,

    /// Observation window before the first shift and after each increment
    #[serde(default = "default_canary_observation_secs")]
    pub observation_secs: u64,
}

fn default_increments() -> Vec<f64> {
    vec![0.25, 0.5, 0.75, 1.0]
}

fn default_canary_observation_secs() -> u64 {
    300
}

impl Default for CanarySettings {
    fn default() -> Self {
        Self {
            increments: default_increments(),
            observation_secs: default_canary_observation_secs(),
        }
    }
}

impl CanarySettings {
    pub fn observation(&self) -> Duration {
        Duration::from_secs(self.observation_secs)
    }

    fn validate(&self) -> Result<(), DeployError> {
        let Some(last) = self.increments.last() else {
            return Err(DeployError::Configuration(
                "canary.increments must not be empty".to_string(),
            ));
        };
        if self.increments.iter().any(|w| !(*w > 0.0 && *w <= 1.0)) {
            return Err(DeployError::Configuration(
                "canary.increments must lie within (0, 1]".to_string(),
            ));
        }
        if self.increments.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(DeployError::Configuration(
                "canary.increments must be strictly increasing".to_string(),
            ));
        }
        if (*last - 1.0).abs() > f64::EPSILON {
            return Err(DeployError::Configuration(
                "canary.increments must end at 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Rollback policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackSettings {
    #[serde(default = "default_true")]
    pub enable_auto_rollback: bool,

    /// Maximum tolerable error rate as a fraction
    #[serde(default = "default_max_error_rate")]
    pub max_error_rate: f64,

    /// Window the verification error rate is computed over
    #[serde(default = "default_monitoring_window_secs")]
    pub monitoring_window_secs: u64,

    /// Number of versions kept in the version history
    #[serde(default = "default_keep_previous_versions")]
    pub keep_previous_versions: usize,
}

fn default_max_error_rate() -> f64 {
    0.05
}

fn default_monitoring_window_secs() -> u64 {
    300
}

fn default_keep_previous_versions() -> usize {
    5
}

impl Default for RollbackSettings {
    fn default() -> Self {
        Self {
            enable_auto_rollback: true,
            max_error_rate: default_max_error_rate(),
            monitoring_window_secs: default_monitoring_window_secs(),
            keep_previous_versions: default_keep_previous_versions(),
        }
    }
}

impl RollbackSettings {
    pub fn monitoring_window(&self) -> Duration {
        Duration::from_secs(self.monitoring_window_secs)
    }
}

/// Host resource thresholds checked before deploying
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSettings {
    #[serde(default = "default_disk_warning_percent")]
    pub disk_warning_percent: f32,

    #[serde(default = "default_disk_max_percent")]
    pub disk_max_percent: f32,

    #[serde(default = "default_memory_max_percent")]
    pub memory_max_percent: f32,
}

fn default_disk_warning_percent() -> f32 {
    80.0
}

fn default_disk_max_percent() -> f32 {
    90.0
}

fn default_memory_max_percent() -> f32 {
    95.0
}

impl Default for ResourceSettings {
    fn default() -> Self {
        Self {
            disk_warning_percent: default_disk_warning_percent(),
            disk_max_percent: default_disk_max_percent(),
            memory_max_percent: default_memory_max_percent(),
        }
    }
}

/// Required environment and tooling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightSettings {
    /// Environment variables that must be set
    #[serde(default)]
    pub required_env: Vec<String>,

    /// Executables that must be on PATH
    #[serde(default = "default_required_tools")]
    pub required_tools: Vec<String>,
}

fn default_required_tools() -> Vec<String> {
    vec!["docker".to_string(), "kubectl".to_string()]
}

impl Default for PreflightSettings {
    fn default() -> Self {
        Self {
            required_env: Vec::new(),
            required_tools: default_required_tools(),
        }
    }
}

/// Read-only status server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_json() {
        let config: DeploymentConfig = serde_json::from_str(
            r#"{"environment": "staging", "registry": {"url": "ghcr.io/acme", "image": "api"}}"#,
        )
        .unwrap();

        assert_eq!(config.strategy, StrategyKind::Rolling);
        assert_eq!(config.canary.increments, vec![0.25, 0.5, 0.75, 1.0]);
        assert_eq!(config.rollback.keep_previous_versions, 5);
        assert_eq!(config.app_name(), "api");
        assert_eq!(config.registry.image_ref("v1.2.0"), "ghcr.io/acme/api:v1.2.0");
        assert_eq!(config.registry.host(), "ghcr.io");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_strategy_names() {
        let config: DeploymentConfig = serde_json::from_str(
            r#"{"environment": "prod", "strategy": "blue-green", "registry": {"image": "api"}}"#,
        )
        .unwrap();
        assert_eq!(config.strategy, StrategyKind::BlueGreen);
        assert_eq!(config.registry.image_ref("v1"), "api:v1");
    }

    #[test]
    fn test_rejects_unordered_increments() {
        let mut config = DeploymentConfig::new("prod", "api");
        config.canary.increments = vec![0.5, 0.25, 1.0];
        assert!(matches!(
            config.validate(),
            Err(DeployError::Configuration(_))
        ));

        config.canary.increments = vec![0.25, 0.5];
        assert!(config.validate().is_err());

        config.canary.increments = vec![];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_rollback_policy() {
        let mut config = DeploymentConfig::new("prod", "api");
        config.rollback.max_error_rate = 1.5;
        assert!(config.validate().is_err());

        let mut config = DeploymentConfig::new("prod", "api");
        config.rollback.keep_previous_versions = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_migrations_require_command() {
        let mut config = DeploymentConfig::new("prod", "api");
        config.migrations.enabled = true;
        assert!(config.validate().is_err());

        config.migrations.command = Some("migrate up".to_string());
        config.migrations.backup_first = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_registry_password_is_configuration_error() {
        let registry = RegistrySettings {
            password_env: Some("CUTOVER_TEST_UNSET_PASSWORD".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            registry.password(),
            Err(DeployError::Configuration(_))
        ));
        assert!(RegistrySettings::default().password().unwrap().is_none());
    }
}
