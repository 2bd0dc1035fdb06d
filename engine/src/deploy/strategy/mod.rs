//! Rollout strategies
//!
//! A strategy turns a built image into running workloads. It receives a
//! [`StrategyContext`] bound to one deployment run and reports what it did
//! (traffic weights, downtime, notes) through the context's [`RolloutLog`].

pub mod blue_green;
pub mod canary;
pub mod recreate;
pub mod rolling;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::settings::CanarySettings;
use crate::deploy::cluster::Cluster;
use crate::deploy::events::EventBus;
use crate::deploy::manifest::ManifestBuilder;
use crate::errors::DeployError;
use crate::health::{CanaryMonitor, HealthChecker};

pub use blue_green::BlueGreenStrategy;
pub use canary::CanaryStrategy;
pub use recreate::RecreateStrategy;
pub use rolling::RollingStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    BlueGreen,
    #[default]
    Rolling,
    Canary,
    Recreate,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::BlueGreen => "blue-green",
            StrategyKind::Rolling => "rolling",
            StrategyKind::Canary => "canary",
            StrategyKind::Recreate => "recreate",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a strategy observed while rolling out
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RolloutReport {
    pub traffic_weights: Vec<f64>,
    pub downtime: Option<Duration>,
    pub notes: Vec<String>,
}

/// Shared recorder strategies write into while running
#[derive(Debug, Default)]
pub struct RolloutLog {
    report: Mutex<RolloutReport>,
}

impl RolloutLog {
    fn lock(&self) -> MutexGuard<'_, RolloutReport> {
        self.report.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_weight(&self, weight: f64) {
        self.lock().traffic_weights.push(weight);
    }

    pub fn record_downtime(&self, downtime: Duration) {
        self.lock().downtime = Some(downtime);
    }

    pub fn note(&self, note: impl Into<String>) {
        self.lock().notes.push(note.into());
    }

    pub fn snapshot(&self) -> RolloutReport {
        self.lock().clone()
    }
}

/// Everything a strategy may touch during one run
pub struct StrategyContext {
    pub deployment_id: String,
    pub version: String,
    pub cluster: Cluster,
    pub manifests: ManifestBuilder,
    pub health: Arc<HealthChecker>,
    pub canary: Arc<CanaryMonitor>,
    pub canary_settings: CanarySettings,
    pub events: EventBus,
    pub log: RolloutLog,
    pub cancel: CancellationToken,
}

impl StrategyContext {
    pub fn is_dry_run(&self) -> bool {
        self.cluster.executor().is_dry_run()
    }
}

#[async_trait]
pub trait Strategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Roll `ctx.version` out. Returns once the new version serves traffic.
    async fn execute(&self, ctx: &StrategyContext) -> Result<(), DeployError>;
}

pub fn for_kind(kind: StrategyKind) -> Box<dyn Strategy> {
    match kind {
        StrategyKind::BlueGreen => Box::new(BlueGreenStrategy),
        StrategyKind::Rolling => Box::new(RollingStrategy),
        StrategyKind::Canary => Box::new(CanaryStrategy),
        StrategyKind::Recreate => Box::new(RecreateStrategy),
    }
}
