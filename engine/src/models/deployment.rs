//! Deployment records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::deploy::fsm::{DeploymentEvent, DeploymentFsm, DeploymentState};
use crate::deploy::strategy::StrategyKind;
use crate::errors::DeployError;
use crate::utils::generate_uuid;

/// Caller options for a single deploy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployOptions {
    /// Log mutating actions instead of performing them
    #[serde(default)]
    pub dry_run: bool,

    /// Bypass the in-progress check and auto-rollback
    #[serde(default)]
    pub force: bool,

    /// Mark the test step skipped
    #[serde(default)]
    pub skip_tests: bool,
}

/// Step status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// One pipeline step of a deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentStep {
    pub name: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeploymentStep {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: StepStatus::Pending,
            started_at: None,
            finished_at: None,
            output: None,
            error: None,
        }
    }

    pub fn start(&mut self) -> Result<(), DeployError> {
        self.expect(StepStatus::Pending, "start")?;
        self.status = StepStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn complete(&mut self, output: Option<String>) -> Result<(), DeployError> {
        self.expect(StepStatus::Running, "complete")?;
        self.status = StepStatus::Completed;
        self.finished_at = Some(Utc::now());
        self.output = output.filter(|o| !o.is_empty());
        Ok(())
    }

    pub fn fail(&mut self, error: String) -> Result<(), DeployError> {
        self.expect(StepStatus::Running, "fail")?;
        self.status = StepStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error);
        Ok(())
    }

    pub fn skip(&mut self, reason: &str) -> Result<(), DeployError> {
        self.expect(StepStatus::Pending, "skip")?;
        self.status = StepStatus::Skipped;
        self.output = Some(reason.to_string());
        Ok(())
    }

    fn expect(&self, status: StepStatus, action: &str) -> Result<(), DeployError> {
        if self.status == status {
            Ok(())
        } else {
            Err(DeployError::InvalidTransition(format!(
                "cannot {} step {} in status {:?}",
                action, self.name, self.status
            )))
        }
    }
}

/// Measurements recorded after the fact
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Time with no instance serving (recreate)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downtime_ms: Option<u64>,

    /// Canary traffic weights in the order they were applied
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traffic_weights: Vec<f64>,
}

/// Status of one deploy invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentStatus {
    pub id: String,
    pub environment: String,
    pub version: String,
    pub strategy: StrategyKind,
    #[serde(rename = "status")]
    fsm: DeploymentFsm,
    pub steps: Vec<DeploymentStep>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub metrics: DeploymentMetrics,
    pub dry_run: bool,
    /// Set on the deployment a rollback runs
    pub triggered_by_rollback: bool,
}

impl DeploymentStatus {
    pub fn new(environment: &str, version: &str, strategy: StrategyKind, dry_run: bool) -> Self {
        Self {
            id: generate_uuid(),
            environment: environment.to_string(),
            version: version.to_string(),
            strategy,
            fsm: DeploymentFsm::new(),
            steps: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
            errors: Vec::new(),
            warnings: Vec::new(),
            metrics: DeploymentMetrics::default(),
            dry_run,
            triggered_by_rollback: false,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> DeploymentState {
        self.fsm.state()
    }

    pub fn transition(&mut self, event: DeploymentEvent) -> Result<(), DeployError> {
        self.fsm
            .process(event)
            .map_err(DeployError::InvalidTransition)
    }

    pub fn step(&self, name: &str) -> Option<&DeploymentStep> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }

    /// `(name, status)` pairs, for comparing the shape of two runs
    pub fn step_outline(&self) -> Vec<(String, StepStatus)> {
        self.steps
            .iter()
            .map(|s| (s.name.clone(), s.status))
            .collect()
    }
}

/// One rollback action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackInfo {
    pub id: String,
    /// Deployment the rollback ran, if it got that far
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<String>,
    pub from_version: String,
    pub to_version: String,
    pub reason: String,
    pub automatic: bool,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryEntry {
    Deployment(DeploymentStatus),
    Rollback(RollbackInfo),
}

impl HistoryEntry {
    pub fn as_deployment(&self) -> Option<&DeploymentStatus> {
        match self {
            HistoryEntry::Deployment(status) => Some(status),
            HistoryEntry::Rollback(_) => None,
        }
    }

    pub fn as_rollback(&self) -> Option<&RollbackInfo> {
        match self {
            HistoryEntry::Rollback(info) => Some(info),
            HistoryEntry::Deployment(_) => None,
        }
    }
}
