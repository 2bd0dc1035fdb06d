use async_trait::async_trait;
use tokio::time::Instant;
use tracing::info;

use super::{Strategy, StrategyContext, StrategyKind};
use crate::deploy::manifest::Target;
use crate::errors::DeployError;

/// Stops the old version before starting the new one
pub struct RecreateStrategy;

#[async_trait]
impl Strategy for RecreateStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Recreate
    }

    async fn execute(&self, ctx: &StrategyContext) -> Result<(), DeployError> {
        let name = ctx.manifests.deployment_name(Target::Recreate);
        let stopped_at = Instant::now();

        ctx.cluster
            .delete_deployment(&name, ctx.manifests.grace_period())
            .await?;
        ctx.cluster
            .apply(&ctx.manifests.build(&ctx.version, Target::Recreate))
            .await?;
        ctx.cluster.wait_ready(&name).await?;

        if !ctx.is_dry_run() {
            let downtime = stopped_at.elapsed();
            info!(deployment = %name, downtime_ms = downtime.as_millis() as u64, "recreated");
            ctx.log.record_downtime(downtime);
        }
        Ok(())
    }
}
