//! Step Orchestrator
//!
//! Drives one wallet through the pipeline state machine:
//!
//! ```text
//! IDLE → FUND → BRIDGE → SWAP → POSITION → COLLECT → COLLECT_DONE
//!                     (any live step) → ERROR
//! ```
//!
//! The step is persisted before each stage starts and after it finishes, so a
//! restarted process resumes at the recorded step. A stage failure moves the
//! wallet to `ERROR` with the reason and stops; only an operator retry
//! reopens it. Cancellation leaves the persisted step untouched.

use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use super::context::{ExecutionContext, WalletJob};
use super::position_manager::PositionManager;
use super::stages::run_stage;
use crate::domain::{ExecutionState, Step};
use crate::error::Result;

pub struct StepOrchestrator {
    ctx: Arc<ExecutionContext>,
    positions: PositionManager,
}

impl StepOrchestrator {
    pub fn new(ctx: Arc<ExecutionContext>) -> Self {
        let positions = PositionManager::new(ctx.clone());
        Self { ctx, positions }
    }

    pub fn context(&self) -> &Arc<ExecutionContext> {
        &self.ctx
    }

    pub fn position_manager(&self) -> &PositionManager {
        &self.positions
    }

    /// Run `job` from its persisted step until `COLLECT_DONE` or `ERROR`.
    ///
    /// A wallet already in `ERROR` is returned untouched unless
    /// `retry_failed` is set, in which case it resumes at the step that
    /// failed. Stage errors are recorded and returned as state; only
    /// persistence failures and cancellation surface as `Err`.
    #[instrument(skip_all, fields(wallet = %job.address(), index = job.index))]
    pub async fn run(&self, job: &WalletJob, retry_failed: bool) -> Result<ExecutionState> {
        let key = job.key();
        let mut state = self.ctx.states.load_or_create(&key, job.index).await?;

        if state.step == Step::Error {
            if !retry_failed {
                info!(
                    reason = state.failure_reason().unwrap_or("unknown"),
                    "Wallet failed earlier, skipping"
                );
                return Ok(state);
            }
            state = self.ctx.persist(&key, |s| s.reopen()).await?;
            info!(step = %state.step, "Retrying failed wallet");
        }

        while let Some(stage) = state.step.active_stage() {
            self.ctx.cancel.check()?;
            state = self.ctx.persist(&key, move |s| s.begin(stage)).await?;
            info!(%stage, step = %state.step, "Stage started");

            match run_stage(&self.ctx, &self.positions, job, stage).await {
                Ok(()) => {
                    state = self.ctx.load(&key).await?;
                    info!(%stage, step = %state.step, "Stage complete");
                }
                Err(err) if err.is_cancelled() => {
                    warn!(%stage, step = %state.step, "Interrupted, state left for resume");
                    return Err(err);
                }
                Err(err) => {
                    error!(%stage, error = %err, "Stage failed");
                    let reason = err.to_string();
                    state = self.ctx.persist(&key, move |s| s.fail(stage, reason)).await?;
                    return Ok(state);
                }
            }
        }

        Ok(state)
    }
}
