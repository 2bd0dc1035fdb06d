//! The fixed step sequence of one deployment run

use chrono::Utc;
use secrecy::ExposeSecret;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::deploy::cluster::Cluster;
use crate::deploy::command::{CommandSpec, Executor};
use crate::deploy::events::DeployNotification;
use crate::deploy::fsm::DeploymentEvent;
use crate::deploy::orchestrator::{retain_versions, Orchestrator};
use crate::deploy::strategy::{self, RolloutLog, StrategyContext};
use crate::errors::DeployError;
use crate::metrics::DeploymentAnnotation;
use crate::models::deployment::{DeployOptions, DeploymentStatus, DeploymentStep};
use crate::utils::{render_template, validate_version};

/// Lines of command output kept on a step
const OUTPUT_TAIL_LINES: usize = 20;

/// Pipeline steps in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    PreDeploymentChecks,
    BuildImage,
    RunTests,
    DatabaseMigration,
    DeployApplication,
    VerifyDeployment,
    UpdateMonitoring,
    Cleanup,
}

impl Step {
    pub const ALL: [Step; 8] = [
        Step::PreDeploymentChecks,
        Step::BuildImage,
        Step::RunTests,
        Step::DatabaseMigration,
        Step::DeployApplication,
        Step::VerifyDeployment,
        Step::UpdateMonitoring,
        Step::Cleanup,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Step::PreDeploymentChecks => "pre-deployment-checks",
            Step::BuildImage => "build-image",
            Step::RunTests => "run-tests",
            Step::DatabaseMigration => "database-migration",
            Step::DeployApplication => "deploy-application",
            Step::VerifyDeployment => "verify-deployment",
            Step::UpdateMonitoring => "update-monitoring",
            Step::Cleanup => "cleanup",
        }
    }

    /// Failure is recorded as a warning and the pipeline continues
    pub fn is_best_effort(&self) -> bool {
        matches!(self, Step::UpdateMonitoring | Step::Cleanup)
    }
}

/// One deployment run in progress
pub(super) struct Run<'a> {
    orchestrator: &'a Orchestrator,
    status: DeploymentStatus,
    options: DeployOptions,
    executor: Executor,
    cluster: Cluster,
    cancel: CancellationToken,
    track_current: bool,
    /// Run that already held the deploy slot when this one started
    conflict: Option<DeploymentStatus>,
}

impl<'a> Run<'a> {
    pub(super) fn new(
        orchestrator: &'a Orchestrator,
        version: &str,
        options: DeployOptions,
        cancel: CancellationToken,
        track_current: bool,
        triggered_by_rollback: bool,
    ) -> Self {
        let config = orchestrator.config();
        let mut status = DeploymentStatus::new(
            &config.environment,
            version,
            config.strategy,
            options.dry_run,
        );
        status.triggered_by_rollback = triggered_by_rollback;
        let executor = orchestrator
            .executor
            .for_run(options.dry_run, cancel.clone());
        let cluster = Cluster::new(
            executor.clone(),
            &config.cluster.kubectl,
            &config.cluster.namespace,
            config.timeouts.readiness(),
            config.timeouts.readiness_poll(),
        );

        Self {
            orchestrator,
            status,
            options,
            executor,
            cluster,
            cancel,
            track_current,
            conflict: None,
        }
    }

    pub(super) fn status(&self) -> &DeploymentStatus {
        &self.status
    }

    pub(super) fn into_status(self) -> DeploymentStatus {
        self.status
    }

    /// Run every step, leaving the status `completed` or `failed`
    pub(super) async fn execute(&mut self) -> Result<(), DeployError> {
        self.conflict = self
            .orchestrator
            .claim(&self.status, self.track_current, !self.options.force)
            .await;

        let result = match self.steps().await {
            Ok(()) => self.status.transition(DeploymentEvent::Complete),
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            self.status.errors.push(e.to_string());
            if let Err(invalid) = self.status.transition(DeploymentEvent::Fail(e.to_string())) {
                warn!(error = %invalid, "could not mark deployment failed");
            }
        }

        let finished = Utc::now();
        self.status.metrics.duration_ms =
            Some((finished - self.status.started_at).num_milliseconds().max(0) as u64);
        self.status.finished_at = Some(finished);
        result
    }

    async fn steps(&mut self) -> Result<(), DeployError> {
        self.step(Step::PreDeploymentChecks).await?;

        self.status.transition(DeploymentEvent::Build)?;
        self.step(Step::BuildImage).await?;
        self.step(Step::RunTests).await?;
        self.step(Step::DatabaseMigration).await?;

        self.status.transition(DeploymentEvent::Deploy)?;
        self.step(Step::DeployApplication).await?;

        self.status.transition(DeploymentEvent::Verify)?;
        self.step(Step::VerifyDeployment).await?;

        self.step(Step::UpdateMonitoring).await?;
        self.step(Step::Cleanup).await
    }

    async fn publish(&self) {
        self.orchestrator
            .publish(&self.status, self.track_current)
            .await;
    }

    fn emit(&self, notification: DeployNotification) {
        self.orchestrator.events.emit(notification);
    }

    /// Uniform step wrapper: mark running, execute, mark the outcome, notify
    async fn step(&mut self, step: Step) -> Result<(), DeployError> {
        let name = step.name();
        let deployment_id = self.status.id.clone();

        if let Some(reason) = self.skip_reason(step) {
            let mut record = DeploymentStep::new(name);
            record.skip(&reason)?;
            self.status.steps.push(record);
            info!(step = name, %reason, "step skipped");
            self.emit(DeployNotification::StepSkipped {
                deployment_id,
                step: name.to_string(),
                reason,
            });
            self.publish().await;
            return Ok(());
        }

        let mut record = DeploymentStep::new(name);
        record.start()?;
        self.status.steps.push(record);
        let index = self.status.steps.len() - 1;
        info!(step = name, version = %self.status.version, "step started");
        self.emit(DeployNotification::StepStarted {
            deployment_id: deployment_id.clone(),
            step: name.to_string(),
        });
        self.publish().await;

        let result = self.perform(step).await;

        let outcome = match result {
            Ok(output) => {
                self.status.steps[index].complete(output)?;
                info!(step = name, "step completed");
                self.emit(DeployNotification::StepCompleted {
                    deployment_id,
                    step: name.to_string(),
                });
                Ok(())
            }
            Err(e) => {
                self.status.steps[index].fail(e.to_string())?;
                self.emit(DeployNotification::StepFailed {
                    deployment_id,
                    step: name.to_string(),
                    error: e.to_string(),
                });
                if step.is_best_effort() && !e.is_cancelled() {
                    warn!(step = name, error = %e, "best-effort step failed");
                    self.status.warnings.push(format!("{}: {}", name, e));
                    Ok(())
                } else {
                    warn!(step = name, error = %e, "step failed");
                    Err(e)
                }
            }
        };

        self.publish().await;
        outcome
    }

    fn skip_reason(&self, step: Step) -> Option<String> {
        let config = self.orchestrator.config();
        match step {
            Step::RunTests if self.options.skip_tests => Some("skip_tests requested".to_string()),
            Step::RunTests if config.tests.command.is_none() => {
                Some("no test command configured".to_string())
            }
            Step::DatabaseMigration if !config.migrations.enabled => {
                Some("migrations disabled".to_string())
            }
            _ => None,
        }
    }

    async fn perform(&mut self, step: Step) -> Result<Option<String>, DeployError> {
        match step {
            Step::PreDeploymentChecks => self.pre_deployment_checks().await,
            Step::BuildImage => self.build_image().await,
            Step::RunTests => self.run_tests().await,
            Step::DatabaseMigration => self.database_migration().await,
            Step::DeployApplication => self.deploy_application().await,
            Step::VerifyDeployment => self.verify_deployment().await,
            Step::UpdateMonitoring => self.update_monitoring().await,
            Step::Cleanup => self.cleanup().await,
        }
    }

    /// Fail fast, before any side effect
    async fn pre_deployment_checks(&mut self) -> Result<Option<String>, DeployError> {
        let config = self.orchestrator.config();

        if let Some(other) = self.conflict.take() {
            return Err(DeployError::DeploymentInProgress(format!(
                "{} ({} is {})",
                other.id,
                other.version,
                other.state()
            )));
        }
        validate_version(&self.status.version)?;

        let usage = self.orchestrator.resources.usage();
        let limits = &config.resources;
        if usage.disk_percent > limits.disk_max_percent {
            return Err(DeployError::Resource(format!(
                "disk usage {:.1}% exceeds {:.1}%",
                usage.disk_percent, limits.disk_max_percent
            )));
        }
        if usage.disk_percent > limits.disk_warning_percent {
            let warning = format!(
                "disk usage {:.1}% above warning threshold {:.1}%",
                usage.disk_percent, limits.disk_warning_percent
            );
            warn!("{}", warning);
            self.status.warnings.push(warning);
        }
        if usage.memory_percent > limits.memory_max_percent {
            return Err(DeployError::Resource(format!(
                "memory usage {:.1}% exceeds {:.1}%",
                usage.memory_percent, limits.memory_max_percent
            )));
        }

        for name in &config.preflight.required_env {
            if std::env::var(name).map(|v| v.is_empty()).unwrap_or(true) {
                return Err(DeployError::Configuration(format!(
                    "required environment variable {} is not set",
                    name
                )));
            }
        }
        config.registry.password()?;

        for tool in &config.preflight.required_tools {
            self.executor
                .query(CommandSpec::new(format!("command -v {}", tool)))
                .await
                .map_err(|e| {
                    if e.is_cancelled() {
                        e
                    } else {
                        DeployError::Configuration(format!("required tool {} not found", tool))
                    }
                })?;
        }

        Ok(Some(format!(
            "disk {:.1}%, memory {:.1}%",
            usage.disk_percent, usage.memory_percent
        )))
    }

    async fn build_image(&mut self) -> Result<Option<String>, DeployError> {
        let registry = &self.orchestrator.config().registry;
        let image = registry.image_ref(&self.status.version);

        if let Some(password) = registry.password()? {
            let user = registry.username.as_deref().ok_or_else(|| {
                DeployError::Configuration("registry.username is required for login".to_string())
            })?;
            self.executor
                .mutate(
                    CommandSpec::new(format!(
                        "docker login {} -u {} --password-stdin",
                        registry.host(),
                        user
                    ))
                    .with_stdin(password.expose_secret()),
                )
                .await?;
        }

        self.executor
            .mutate(CommandSpec::new(format!(
                "docker build -t {} -f {}/{} {}",
                image, registry.build_context, registry.dockerfile, registry.build_context
            )))
            .await?;
        self.executor
            .mutate(CommandSpec::new(format!("docker push {}", image)))
            .await?;

        Ok(Some(image))
    }

    async fn run_tests(&mut self) -> Result<Option<String>, DeployError> {
        let config = self.orchestrator.config();
        let Some(template) = &config.tests.command else {
            return Ok(None);
        };
        let image = config.registry.image_ref(&self.status.version);
        let line = render_template(
            template,
            &[("image", image.as_str()), ("version", self.status.version.as_str())],
        );

        let output = self
            .executor
            .mutate(CommandSpec::new(line).with_timeout(config.tests.timeout()))
            .await?;
        Ok(Some(tail(&output.combined(), OUTPUT_TAIL_LINES)))
    }

    async fn database_migration(&mut self) -> Result<Option<String>, DeployError> {
        let config = self.orchestrator.config();
        let migrations = &config.migrations;
        let image = config.registry.image_ref(&self.status.version);
        let vars = [
            ("image", image.as_str()),
            ("version", self.status.version.as_str()),
        ];

        if migrations.backup_first {
            if let Some(backup) = &migrations.backup_command {
                info!("backing up database before migration");
                self.executor
                    .mutate(
                        CommandSpec::new(render_template(backup, &vars))
                            .with_timeout(migrations.timeout()),
                    )
                    .await?;
            }
        }

        let Some(command) = &migrations.command else {
            return Err(DeployError::Configuration(
                "migrations.enabled requires migrations.command".to_string(),
            ));
        };
        let output = self
            .executor
            .mutate(
                CommandSpec::new(render_template(command, &vars))
                    .with_timeout(migrations.timeout()),
            )
            .await?;
        Ok(Some(tail(&output.combined(), OUTPUT_TAIL_LINES)))
    }

    async fn deploy_application(&mut self) -> Result<Option<String>, DeployError> {
        let config = self.orchestrator.config();
        let ctx = StrategyContext {
            deployment_id: self.status.id.clone(),
            version: self.status.version.clone(),
            cluster: self.cluster.clone(),
            manifests: self.orchestrator.manifests.clone(),
            health: self.orchestrator.health.clone(),
            canary: self.orchestrator.canary.clone(),
            canary_settings: config.canary.clone(),
            events: self.orchestrator.events.clone(),
            log: RolloutLog::default(),
            cancel: self.cancel.clone(),
        };

        let strategy = strategy::for_kind(config.strategy);
        info!(strategy = %strategy.kind(), version = %self.status.version, "rolling out");
        let result = strategy.execute(&ctx).await;

        let report = ctx.log.snapshot();
        self.status.metrics.traffic_weights = report.traffic_weights;
        self.status.metrics.downtime_ms = report.downtime.map(|d| d.as_millis() as u64);

        match result {
            Ok(()) if report.notes.is_empty() => Ok(None),
            Ok(()) => Ok(Some(report.notes.join("; "))),
            Err(e) => {
                self.status.warnings.extend(report.notes);
                Err(e)
            }
        }
    }

    async fn verify_deployment(&mut self) -> Result<Option<String>, DeployError> {
        if self.options.dry_run {
            info!("[dry-run] would run health checks and verify error rate");
            return Ok(Some("dry-run".to_string()));
        }

        let config = self.orchestrator.config();
        let metrics = &self.orchestrator.metrics;
        let service = config.metrics_service();
        let window = config.rollback.monitoring_window();
        let max = config.rollback.max_error_rate;

        self.orchestrator.health.check_all(None, &self.cancel).await?;

        let mut summary = Vec::new();
        match metrics.error_rate(service, &self.status.version, window).await {
            Ok(rate) if rate > max => {
                return Err(DeployError::ErrorRateExceeded { rate, max });
            }
            Ok(rate) => summary.push(format!("error rate {:.4}", rate)),
            Err(e) => {
                let warning = format!("error rate unavailable: {}", e);
                warn!("{}", warning);
                self.status.warnings.push(warning);
            }
        }

        if let Some(max_latency) = config.monitoring.max_latency_ms {
            match metrics
                .p99_latency_ms(service, &self.status.version, window)
                .await
            {
                Ok(Some(p99)) if p99 > max_latency => {
                    let warning = format!("p99 latency {:.0}ms above {:.0}ms", p99, max_latency);
                    warn!("{}", warning);
                    self.status.warnings.push(warning);
                }
                Ok(Some(p99)) => summary.push(format!("p99 {:.0}ms", p99)),
                Ok(None) => debug!("no latency samples"),
                Err(e) => {
                    let warning = format!("latency unavailable: {}", e);
                    warn!("{}", warning);
                    self.status.warnings.push(warning);
                }
            }
        }

        Ok(Some(summary.join(", ")))
    }

    async fn update_monitoring(&mut self) -> Result<Option<String>, DeployError> {
        let annotation = DeploymentAnnotation::new(
            &self.status.environment,
            &self.status.version,
            self.status.strategy,
        );
        if self.options.dry_run {
            info!(text = %annotation.text, "[dry-run] would annotate deployment");
            return Ok(None);
        }
        self.orchestrator.metrics.annotate(&annotation).await?;
        Ok(Some(annotation.text))
    }

    /// Remove images of versions that leave the retained window
    async fn cleanup(&mut self) -> Result<Option<String>, DeployError> {
        let config = self.orchestrator.config();
        let versions = self.orchestrator.version_history().await;
        let (_, evicted) = retain_versions(
            &versions,
            &self.status.version,
            config.rollback.keep_previous_versions,
        );

        if evicted.is_empty() {
            return Ok(Some("nothing to remove".to_string()));
        }

        for version in &evicted {
            let image = config.registry.image_ref(version);
            self.executor
                .mutate(CommandSpec::new(format!("docker rmi {}", image)))
                .await?;
        }
        Ok(Some(format!("removed {}", evicted.join(", "))))
    }
}

fn tail(output: &str, lines: usize) -> String {
    let all: Vec<&str> = output.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}
