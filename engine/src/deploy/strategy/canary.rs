use async_trait::async_trait;
use tracing::{info, warn};

use super::{Strategy, StrategyContext, StrategyKind};
use crate::deploy::cluster::Cluster;
use crate::deploy::events::DeployNotification;
use crate::deploy::manifest::Target;
use crate::errors::DeployError;
use crate::health::CanaryVerdict;

/// Runs the new version as a small canary and shifts traffic to it in
/// configured increments, observing after each one.
///
/// A bad observation sends all traffic back to stable and removes the
/// canary. Cancellation restores traffic but keeps the canary for
/// inspection.
pub struct CanaryStrategy;

impl CanaryStrategy {
    async fn progress(&self, ctx: &StrategyContext) -> Result<(), DeployError> {
        let canary = ctx.manifests.deployment_name(Target::Canary);
        ctx.cluster.wait_ready(&canary).await?;
        observe(ctx, 0.0).await?;

        for weight in &ctx.canary_settings.increments {
            ctx.cluster
                .apply(&ctx.manifests.traffic_split(*weight))
                .await?;
            ctx.log.record_weight(*weight);
            ctx.events.emit(DeployNotification::TrafficShifted {
                deployment_id: ctx.deployment_id.clone(),
                version: ctx.version.clone(),
                weight: *weight,
            });
            info!(version = %ctx.version, weight, "canary traffic shifted");
            observe(ctx, *weight).await?;
        }
        Ok(())
    }

    async fn promote(&self, ctx: &StrategyContext) -> Result<(), DeployError> {
        let stable = ctx.manifests.deployment_name(Target::Promote);
        ctx.cluster
            .apply(&ctx.manifests.build(&ctx.version, Target::Promote))
            .await?;
        ctx.cluster.wait_ready(&stable).await?;
        ctx.cluster.apply(&ctx.manifests.traffic_split(0.0)).await?;
        ctx.cluster
            .delete_deployment(
                &ctx.manifests.deployment_name(Target::Canary),
                ctx.manifests.grace_period(),
            )
            .await?;
        info!(version = %ctx.version, "canary promoted");
        Ok(())
    }

    /// Send all traffic back to stable, optionally removing the canary
    async fn restore(&self, ctx: &StrategyContext, cluster: &Cluster, remove_canary: bool) {
        if let Err(e) = cluster.apply(&ctx.manifests.traffic_split(0.0)).await {
            warn!(error = %e, "failed to restore stable traffic");
            ctx.log.note(format!("restoring stable traffic failed: {}", e));
        }
        if remove_canary {
            let canary = ctx.manifests.deployment_name(Target::Canary);
            if let Err(e) = cluster
                .delete_deployment(&canary, ctx.manifests.grace_period())
                .await
            {
                warn!(error = %e, "failed to remove canary");
                ctx.log.note(format!("removing canary failed: {}", e));
            }
        }
    }
}

async fn observe(ctx: &StrategyContext, weight: f64) -> Result<(), DeployError> {
    if ctx.is_dry_run() {
        info!(weight, "[dry-run] would observe canary");
        return Ok(());
    }

    let verdict = ctx
        .canary
        .observe(&ctx.version, ctx.canary_settings.observation(), &ctx.cancel)
        .await?;
    match verdict {
        CanaryVerdict::Healthy => Ok(()),
        CanaryVerdict::Unhealthy(reason) => Err(DeployError::CanaryViolation(format!(
            "at {:.0}% traffic: {}",
            weight * 100.0,
            reason
        ))),
    }
}

#[async_trait]
impl Strategy for CanaryStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Canary
    }

    async fn execute(&self, ctx: &StrategyContext) -> Result<(), DeployError> {
        ctx.cluster
            .apply(&ctx.manifests.build(&ctx.version, Target::Canary))
            .await?;
        ctx.cluster.apply(&ctx.manifests.traffic_split(0.0)).await?;

        let result = match self.progress(ctx).await {
            Ok(()) => self.promote(ctx).await.inspect_err(|e| {
                if !e.is_cancelled() {
                    ctx.log
                        .note(format!("promotion failed, traffic returned to stable: {}", e));
                }
            }),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancelled() => {
                warn!(version = %ctx.version, "canary cancelled, restoring stable traffic");
                self.restore(ctx, &ctx.cluster.detached(), false).await;
                ctx.log
                    .note("canary deployment kept after cancellation for inspection");
                Err(e)
            }
            Err(e) => {
                warn!(version = %ctx.version, error = %e, "canary aborted");
                self.restore(ctx, &ctx.cluster, true).await;
                Err(e)
            }
        }
    }
}
