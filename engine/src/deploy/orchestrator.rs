//! Deployment orchestration
//!
//! The [`Orchestrator`] runs the step pipeline for a version, records every
//! run in the audit history, keeps the list of successfully deployed
//! versions and performs manual and automatic rollbacks.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::DeploymentConfig;
use crate::deploy::command::{CommandRunner, Executor};
use crate::deploy::events::{DeployNotification, EventBus, EventRecord};
use crate::deploy::fsm::DeploymentEvent;
use crate::deploy::manifest::ManifestBuilder;
use crate::deploy::pipeline::Run;
use crate::errors::DeployError;
use crate::health::{CanaryMonitor, HealthChecker, Probe};
use crate::metrics::MetricsBackend;
use crate::models::deployment::{DeployOptions, DeploymentStatus, HistoryEntry, RollbackInfo};
use crate::telemetry::ResourceProbe;
use crate::utils::generate_uuid;

/// Persistable history of an orchestrator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistorySnapshot {
    /// Successfully deployed versions, oldest first
    pub versions: Vec<String>,
    /// Deployments and rollbacks, oldest first
    pub history: Vec<HistoryEntry>,
}

#[derive(Default)]
struct OrchestratorState {
    /// Deployments between start and finish, by id
    in_flight: HashMap<String, DeploymentStatus>,
    /// Most recent caller-initiated deployment
    current: Option<DeploymentStatus>,
    history: Vec<HistoryEntry>,
    /// Successfully deployed versions, oldest first
    versions: Vec<String>,
}

/// Split `versions` plus a newly deployed `version` into the retained
/// window of `keep` entries and the versions whose images can go.
///
/// A version still present in the window is never evicted.
pub(crate) fn retain_versions(
    versions: &[String],
    version: &str,
    keep: usize,
) -> (Vec<String>, Vec<String>) {
    let mut all = versions.to_vec();
    all.push(version.to_string());

    let excess = all.len().saturating_sub(keep.max(1));
    let retained = all.split_off(excess);
    let mut evicted: Vec<String> = Vec::new();
    for old in all {
        if !retained.contains(&old) && !evicted.contains(&old) {
            evicted.push(old);
        }
    }
    (retained, evicted)
}

/// Runs deployments and rollbacks for one environment.
///
/// Mutual exclusion between deployments is in-process only: a second
/// `deploy` is rejected by the pre-checks while another one is building,
/// deploying or verifying. Callers in separate processes must serialize
/// deployments of the same environment with an external lock.
pub struct Orchestrator {
    config: Arc<DeploymentConfig>,
    pub(super) executor: Executor,
    pub(super) health: Arc<HealthChecker>,
    pub(super) canary: Arc<CanaryMonitor>,
    pub(super) metrics: Arc<dyn MetricsBackend>,
    pub(super) resources: Arc<dyn ResourceProbe>,
    pub(super) manifests: ManifestBuilder,
    pub(super) events: EventBus,
    state: RwLock<OrchestratorState>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        config: DeploymentConfig,
        runner: Arc<dyn CommandRunner>,
        probe: Arc<dyn Probe>,
        metrics: Arc<dyn MetricsBackend>,
        resources: Arc<dyn ResourceProbe>,
    ) -> Self {
        let health = Arc::new(HealthChecker::from_config(&config, probe));
        let canary = Arc::new(CanaryMonitor::from_config(
            &config,
            health.clone(),
            metrics.clone(),
        ));

        Self {
            executor: Executor::new(runner, config.timeouts.command()),
            manifests: ManifestBuilder::new(&config),
            health,
            canary,
            metrics,
            resources,
            events: EventBus::new(),
            state: RwLock::new(OrchestratorState::default()),
            shutdown: CancellationToken::new(),
            config: Arc::new(config),
        }
    }

    /// Tie every deployment to `token`; cancelling it aborts in-flight runs
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn config(&self) -> &DeploymentConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.events.subscribe()
    }

    /// Deploy `version` through the full pipeline
    pub async fn deploy(
        &self,
        version: &str,
        options: DeployOptions,
    ) -> Result<DeploymentStatus, DeployError> {
        self.deploy_with_cancel(version, options, self.shutdown.child_token())
            .await
    }

    /// Deploy with a caller-supplied cancellation token
    pub async fn deploy_with_cancel(
        &self,
        version: &str,
        options: DeployOptions,
        cancel: CancellationToken,
    ) -> Result<DeploymentStatus, DeployError> {
        let (status, result) = self
            .run_deployment(version, options, cancel, true, false)
            .await;
        result.map(|()| status)
    }

    /// Roll back to the previously deployed version.
    ///
    /// Always targets the second-to-last entry of the version history. After
    /// a failed deploy of v3 on top of `[v1, v2]` that is v1, not the last
    /// successful v2, because a failed deploy never enters the history.
    pub async fn rollback(&self, reason: &str) -> Result<RollbackInfo, DeployError> {
        self.run_rollback(reason.to_string(), false).await
    }

    /// Snapshot of the most recent caller-initiated deployment
    pub async fn get_status(&self) -> Option<DeploymentStatus> {
        self.state.read().await.current.clone()
    }

    /// Deployments currently running
    pub async fn in_progress(&self) -> Vec<DeploymentStatus> {
        self.state.read().await.in_flight.values().cloned().collect()
    }

    /// Newest `limit` finished deployments, newest first
    pub async fn get_history(&self, limit: usize) -> Vec<DeploymentStatus> {
        self.state
            .read()
            .await
            .history
            .iter()
            .rev()
            .filter_map(HistoryEntry::as_deployment)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Newest `limit` deployments and rollbacks, newest first
    pub async fn audit_log(&self, limit: usize) -> Vec<HistoryEntry> {
        self.state
            .read()
            .await
            .history
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Successfully deployed versions, oldest first
    pub async fn version_history(&self) -> Vec<String> {
        self.state.read().await.versions.clone()
    }

    /// Every rollback performed, oldest first
    pub async fn rollback_history(&self) -> Vec<RollbackInfo> {
        self.state
            .read()
            .await
            .history
            .iter()
            .filter_map(HistoryEntry::as_rollback)
            .cloned()
            .collect()
    }

    /// Versions and audit history, for persisting between runs
    pub async fn snapshot(&self) -> HistorySnapshot {
        let state = self.state.read().await;
        HistorySnapshot {
            versions: state.versions.clone(),
            history: state.history.clone(),
        }
    }

    /// Replace versions and history with a persisted snapshot
    pub async fn restore(&self, snapshot: HistorySnapshot) {
        let mut state = self.state.write().await;
        info!(
            versions = snapshot.versions.len(),
            entries = snapshot.history.len(),
            "restored deployment history"
        );
        state.versions = snapshot.versions;
        state.history = snapshot.history;
    }

    pub(super) async fn publish(&self, status: &DeploymentStatus, track_current: bool) {
        let mut state = self.state.write().await;
        state.in_flight.insert(status.id.clone(), status.clone());
        if track_current {
            state.current = Some(status.clone());
        }
    }

    /// Register a starting run and, when `exclusive`, report another real
    /// run already holding the deploy slot.
    ///
    /// Check and insert happen under one write lock, so two overlapping
    /// runs can never both see a free slot.
    pub(super) async fn claim(
        &self,
        status: &DeploymentStatus,
        track_current: bool,
        exclusive: bool,
    ) -> Option<DeploymentStatus> {
        let mut state = self.state.write().await;
        let holder = if exclusive {
            state
                .in_flight
                .values()
                .find(|s| s.id != status.id && !s.dry_run && s.state().is_active())
                .cloned()
        } else {
            None
        };
        state.in_flight.insert(status.id.clone(), status.clone());
        if track_current {
            state.current = Some(status.clone());
        }
        holder
    }

    async fn run_deployment(
        &self,
        version: &str,
        options: DeployOptions,
        cancel: CancellationToken,
        track_current: bool,
        triggered_by_rollback: bool,
    ) -> (DeploymentStatus, Result<(), DeployError>) {
        let mut run = Run::new(
            self,
            version,
            options,
            cancel,
            track_current,
            triggered_by_rollback,
        );
        {
            let status = run.status();
            info!(
                deployment_id = %status.id,
                %version,
                strategy = %status.strategy,
                dry_run = options.dry_run,
                "deployment started"
            );
            self.events.emit(DeployNotification::DeploymentStarted {
                deployment_id: status.id.clone(),
                version: version.to_string(),
                dry_run: options.dry_run,
            });
        }

        let result = run.execute().await;
        let mut status = run.into_status();
        self.record(&status, track_current, result.is_ok() && !options.dry_run)
            .await;

        let error = match result {
            Ok(()) => {
                info!(deployment_id = %status.id, %version, "deployment completed");
                self.events.emit(DeployNotification::DeploymentCompleted {
                    deployment_id: status.id.clone(),
                    version: version.to_string(),
                });
                return (status, Ok(()));
            }
            Err(e) => e,
        };

        error!(deployment_id = %status.id, %version, error = %error, "deployment failed");
        self.events.emit(DeployNotification::DeploymentFailed {
            deployment_id: status.id.clone(),
            version: version.to_string(),
            error: error.to_string(),
        });

        // Nothing changed yet when a pre-check fails
        if self.config.rollback.enable_auto_rollback
            && !options.force
            && !options.dry_run
            && !error.is_cancelled()
            && !error.is_precheck_class()
        {
            let reason = format!("deployment of {} failed: {}", version, error);
            match self.run_rollback(reason, true).await {
                Ok(info) => {
                    if let Err(e) = status.transition(DeploymentEvent::RolledBack) {
                        warn!(error = %e, "could not mark deployment rolled back");
                    }
                    info!(to_version = %info.to_version, "automatic rollback completed");
                }
                Err(e) => {
                    // Logged and emitted by run_rollback
                    status.errors.push(format!("automatic rollback failed: {}", e));
                }
            }
            if track_current {
                self.state.write().await.current = Some(status.clone());
            }
        }

        (status, Err(error))
    }

    /// Move a finished run from in-flight into the history
    async fn record(&self, status: &DeploymentStatus, track_current: bool, succeeded: bool) {
        let mut state = self.state.write().await;
        state.in_flight.remove(&status.id);
        state.history.push(HistoryEntry::Deployment(status.clone()));
        if track_current {
            state.current = Some(status.clone());
        }

        if succeeded {
            let (retained, evicted) = retain_versions(
                &state.versions,
                &status.version,
                self.config.rollback.keep_previous_versions,
            );
            if !evicted.is_empty() {
                info!(evicted = ?evicted, "versions left the rollback window");
            }
            state.versions = retained;
        }
    }

    /// Boxed so the deploy → rollback → deploy recursion has a sized future
    fn run_rollback(
        &self,
        reason: String,
        automatic: bool,
    ) -> BoxFuture<'_, Result<RollbackInfo, DeployError>> {
        Box::pin(async move {
            let versions = self.version_history().await;
            if versions.len() < 2 {
                let err = DeployError::NoPreviousVersion(versions.len());
                error!(error = %err, automatic, "rollback impossible");
                self.events.emit(DeployNotification::RollbackFailed {
                    from_version: versions.last().cloned().unwrap_or_default(),
                    to_version: String::new(),
                    error: err.to_string(),
                });
                return Err(err);
            }

            let from_version = versions[versions.len() - 1].clone();
            let to_version = versions[versions.len() - 2].clone();
            info!(%from_version, %to_version, automatic, %reason, "rollback started");
            self.events.emit(DeployNotification::RollbackStarted {
                from_version: from_version.clone(),
                to_version: to_version.clone(),
                automatic,
            });

            let options = DeployOptions {
                dry_run: false,
                force: true,
                skip_tests: true,
            };
            let (status, result) = self
                .run_deployment(
                    &to_version,
                    options,
                    self.shutdown.child_token(),
                    !automatic,
                    true,
                )
                .await;

            let info = RollbackInfo {
                id: generate_uuid(),
                deployment_id: Some(status.id.clone()),
                from_version: from_version.clone(),
                to_version: to_version.clone(),
                reason,
                automatic,
                success: result.is_ok(),
                error: result.as_ref().err().map(|e| e.to_string()),
                timestamp: Utc::now(),
            };
            self.state
                .write()
                .await
                .history
                .push(HistoryEntry::Rollback(info.clone()));

            match result {
                Ok(()) => {
                    info!(%from_version, %to_version, "rollback completed");
                    self.events.emit(DeployNotification::RollbackCompleted {
                        from_version,
                        to_version,
                    });
                    Ok(info)
                }
                Err(e) => {
                    error!(%from_version, %to_version, error = %e, "rollback failed");
                    self.events.emit(DeployNotification::RollbackFailed {
                        from_version,
                        to_version,
                        error: e.to_string(),
                    });
                    Err(e)
                }
            }
        })
    }
}
