//! Container orchestrator access through kubectl

use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::deploy::command::{CommandSpec, Executor};
use crate::deploy::manifest::{Color, ManifestSet};
use crate::errors::DeployError;

/// Replica counts reported for a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RolloutState {
    pub desired: u64,
    pub replicas: u64,
    pub updated: u64,
    pub ready: u64,
    pub generation: u64,
    pub observed_generation: u64,
}

impl RolloutState {
    /// Parse `kubectl get deployment -o json` output
    pub fn from_json(value: &Value) -> Self {
        let field = |path: &[&str], default: u64| {
            path.iter()
                .fold(value, |v, key| &v[*key])
                .as_u64()
                .unwrap_or(default)
        };
        Self {
            desired: field(&["spec", "replicas"], 1),
            replicas: field(&["status", "replicas"], 0),
            updated: field(&["status", "updatedReplicas"], 0),
            ready: field(&["status", "readyReplicas"], 0),
            generation: field(&["metadata", "generation"], 0),
            observed_generation: field(&["status", "observedGeneration"], 0),
        }
    }

    /// All desired replicas run the latest template and are ready, and no old ones remain
    pub fn is_complete(&self) -> bool {
        self.observed_generation >= self.generation
            && self.updated >= self.desired
            && self.ready >= self.desired
            && self.replicas == self.updated
    }
}

/// Handle to one namespace of the cluster, bound to a deployment run
#[derive(Clone)]
pub struct Cluster {
    executor: Executor,
    kubectl: String,
    namespace: String,
    readiness_timeout: Duration,
    poll_interval: Duration,
}

impl Cluster {
    pub fn new(
        executor: Executor,
        kubectl: &str,
        namespace: &str,
        readiness_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            executor,
            kubectl: kubectl.to_string(),
            namespace: namespace.to_string(),
            readiness_timeout,
            poll_interval,
        }
    }

    /// Copy that ignores the run's cancellation, for restoring state after a cancel
    pub fn detached(&self) -> Self {
        let mut cluster = self.clone();
        cluster.executor = self
            .executor
            .for_run(self.executor.is_dry_run(), CancellationToken::new());
        cluster
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn readiness_timeout(&self) -> Duration {
        self.readiness_timeout
    }

    /// Apply a manifest set in one call
    pub async fn apply(&self, set: &ManifestSet) -> Result<(), DeployError> {
        info!(resources = ?set.names(), namespace = %self.namespace, "applying manifests");
        let spec = CommandSpec::new(format!("{} apply -n {} -f -", self.kubectl, self.namespace))
            .with_stdin(set.to_apply_payload());
        self.executor.mutate(spec).await?;
        Ok(())
    }

    /// Delete a deployment, waiting up to `wait` for its pods to terminate
    pub async fn delete_deployment(&self, name: &str, wait: Duration) -> Result<(), DeployError> {
        info!(deployment = %name, "deleting deployment");
        let spec = CommandSpec::new(format!(
            "{} delete deployment {} -n {} --ignore-not-found --wait=true --timeout={}s",
            self.kubectl,
            name,
            self.namespace,
            wait.as_secs().max(1)
        ))
        .with_timeout(wait + Duration::from_secs(30));
        self.executor.mutate(spec).await?;
        Ok(())
    }

    /// Current rollout state, `None` if the deployment does not exist
    pub async fn rollout_state(&self, name: &str) -> Result<Option<RolloutState>, DeployError> {
        let output = self
            .executor
            .query(CommandSpec::new(format!(
                "{} get deployment {} -n {} -o json --ignore-not-found",
                self.kubectl, name, self.namespace
            )))
            .await?;

        let raw = output.stdout.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        let value: Value = serde_json::from_str(raw)?;
        Ok(Some(RolloutState::from_json(&value)))
    }

    /// Poll until the deployment reports every desired replica updated and ready.
    ///
    /// Exceeding the readiness timeout is a hard failure.
    pub async fn wait_ready(&self, name: &str) -> Result<(), DeployError> {
        if self.executor.is_dry_run() {
            info!(deployment = %name, "[dry-run] would wait for readiness");
            return Ok(());
        }

        let deadline = Instant::now() + self.readiness_timeout;
        loop {
            if let Some(state) = self.rollout_state(name).await? {
                debug!(
                    deployment = %name,
                    desired = state.desired,
                    updated = state.updated,
                    ready = state.ready,
                    "rollout state"
                );
                if state.is_complete() {
                    info!(deployment = %name, "deployment ready");
                    return Ok(());
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(DeployError::ReadinessTimeout {
                    resource: format!("deployment/{}", name),
                    timeout: self.readiness_timeout,
                });
            }

            let wait = self.poll_interval.min(deadline - now);
            tokio::select! {
                _ = self.executor.cancel_token().cancelled() => {
                    return Err(DeployError::Cancelled(format!("waiting for deployment/{}", name)));
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Colour the routing service currently selects
    pub async fn active_color(&self, service: &str) -> Result<Option<Color>, DeployError> {
        let output = self
            .executor
            .query(CommandSpec::new(format!(
                "{} get service {} -n {} -o jsonpath={{.spec.selector.color}} --ignore-not-found",
                self.kubectl, service, self.namespace
            )))
            .await?;
        Ok(Color::parse(&output.stdout))
    }
}
