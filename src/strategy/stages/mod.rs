//! Stage executors of the wallet pipeline
//!
//! Every stage follows the same shape: if no record exists, do the read-only
//! preparation, submit, and persist the record with its transaction hash or
//! withdrawal id. Then wait on whatever the record points to, write the
//! observed outcome, and advance the step. A resumed stage never re-submits
//! something its record already references.

pub mod bridge;
pub mod collect;
pub mod fund;
pub mod position;
pub mod swap;

use super::context::{ExecutionContext, WalletJob};
use super::position_manager::PositionManager;
use crate::domain::Stage;
use crate::error::{LpFlowError, Result};

/// Run `stage` for `job` to completion
pub async fn run_stage(
    ctx: &ExecutionContext,
    manager: &PositionManager,
    job: &WalletJob,
    stage: Stage,
) -> Result<()> {
    match stage {
        Stage::Fund => fund::run(ctx, job).await,
        Stage::Bridge => bridge::run(ctx, job).await,
        Stage::Swap => swap::run(ctx, job).await,
        Stage::Position => position::run(ctx, job).await,
        Stage::Collect => collect::run(ctx, manager, job).await,
    }
}

/// A stage found its predecessor's record missing
pub(crate) fn missing_record(stage: Stage, what: &str, wallet: &str) -> LpFlowError {
    LpFlowError::StateConflict(format!(
        "{} stage for {} has no {} record",
        stage, wallet, what
    ))
}
