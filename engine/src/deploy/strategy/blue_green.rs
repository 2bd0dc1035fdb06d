use async_trait::async_trait;
use tracing::info;

use super::{Strategy, StrategyContext, StrategyKind};
use crate::deploy::events::DeployNotification;
use crate::deploy::manifest::{Color, Target};
use crate::errors::DeployError;

/// Brings up the idle colour next to the live one, then switches the
/// routing service over in one step.
///
/// The previous colour keeps running so a rollback only has to switch back.
pub struct BlueGreenStrategy;

#[async_trait]
impl Strategy for BlueGreenStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::BlueGreen
    }

    async fn execute(&self, ctx: &StrategyContext) -> Result<(), DeployError> {
        let live = ctx
            .cluster
            .active_color(ctx.manifests.app())
            .await?
            .unwrap_or(Color::Blue);
        let target = live.other();
        let name = ctx.manifests.deployment_name(Target::Color(target));
        info!(live = live.as_str(), target = target.as_str(), "blue-green rollout");

        ctx.cluster
            .apply(&ctx.manifests.build(&ctx.version, Target::Color(target)))
            .await?;
        ctx.cluster.wait_ready(&name).await?;

        if ctx.is_dry_run() {
            info!(color = target.as_str(), "[dry-run] would health check");
        } else {
            ctx.health.check_all(Some(target.as_str()), &ctx.cancel).await?;
        }

        ctx.cluster.apply(&ctx.manifests.route_to(target)).await?;
        ctx.log.record_weight(1.0);
        ctx.log.note(format!(
            "traffic switched from {} to {}; {} left running",
            live.as_str(),
            target.as_str(),
            live.as_str()
        ));
        ctx.events.emit(DeployNotification::TrafficShifted {
            deployment_id: ctx.deployment_id.clone(),
            version: ctx.version.clone(),
            weight: 1.0,
        });
        Ok(())
    }
}
