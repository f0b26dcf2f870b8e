//! First harvest after the position opens

use chrono::Utc;
use std::time::Duration;
use tracing::{info, instrument};

use super::missing_record;
use crate::domain::Stage;
use crate::error::Result;
use crate::strategy::context::{ExecutionContext, WalletJob};
use crate::strategy::position_manager::PositionManager;

#[instrument(skip_all, fields(wallet = %job.address(), index = job.index))]
pub async fn run(ctx: &ExecutionContext, manager: &PositionManager, job: &WalletJob) -> Result<()> {
    let key = job.key();
    let state = ctx.load(&key).await?;
    let position = state
        .position
        .as_ref()
        .ok_or_else(|| missing_record(Stage::Collect, "position", &key))?;

    let delay = Duration::from_secs(ctx.engine.config().post_open_collect_delay_secs);
    let elapsed = (Utc::now() - position.opened_at).to_std().unwrap_or(Duration::ZERO);
    if let Some(remaining) = delay.checked_sub(elapsed).filter(|d| !d.is_zero()) {
        info!(secs = remaining.as_secs(), "Waiting before first collect");
        ctx.cancel.sleep(remaining).await?;
    }

    let already_harvested = state.collect.as_ref().is_some_and(|c| c.is_finished());
    if !already_harvested {
        manager.harvest(&job.wallet).await?;
    }

    ctx.persist(&key, |s| s.complete(Stage::Collect)).await?;
    Ok(())
}
