use async_trait::async_trait;
use tracing::info;

use super::{Strategy, StrategyContext, StrategyKind};
use crate::deploy::manifest::Target;
use crate::errors::DeployError;

/// Replaces replicas incrementally within the surge and unavailability bounds
pub struct RollingStrategy;

#[async_trait]
impl Strategy for RollingStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Rolling
    }

    async fn execute(&self, ctx: &StrategyContext) -> Result<(), DeployError> {
        let name = ctx.manifests.deployment_name(Target::Rolling);
        ctx.cluster
            .apply(&ctx.manifests.build(&ctx.version, Target::Rolling))
            .await?;

        info!(deployment = %name, version = %ctx.version, "waiting for rollout");
        ctx.cluster.wait_ready(&name).await
    }
}
