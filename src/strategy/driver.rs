//! Fleet driver: runs the wallet pipeline for a derived range of wallets
//! with bounded concurrency

use alloy::primitives::Address;
use futures::stream::{self, StreamExt};
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::context::{state_key, ExecutionContext, WalletJob};
use super::distribution::{compute_random_parts, create_plan};
use super::orchestrator::StepOrchestrator;
use crate::config::{FundingConfig, FundingSource};
use crate::domain::{from_decimal, Step};
use crate::error::{LpFlowError, Result};
use crate::signing::WalletRecord;

/// Final position of one wallet after a run
#[derive(Debug, Clone, Serialize)]
pub struct WalletOutcome {
    pub index: u32,
    pub address: Address,
    /// `None` when the pipeline stopped before its state could be read
    pub step: Option<Step>,
    pub error: Option<String>,
}

impl WalletOutcome {
    pub fn succeeded(&self) -> bool {
        self.step == Some(Step::CollectDone)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub outcomes: Vec<WalletOutcome>,
}

impl RunReport {
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(WalletOutcome::succeeded)
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.succeeded()).count()
    }

    pub fn failed(&self) -> impl Iterator<Item = &WalletOutcome> {
        self.outcomes.iter().filter(|o| !o.succeeded())
    }
}

/// Fleet selection for one run
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub start_index: u32,
    pub count: u32,
    pub concurrency: usize,
    pub retry_failed: bool,
}

/// Split `total` raw units across `n` wallets per the funding settings.
///
/// A per-wallet target plans `min(total, target * n)`; randomized funding
/// without a target draws parts above the configured floor; otherwise the
/// total is split evenly.
pub fn plan_allocations<R: Rng + ?Sized>(
    funding: &FundingConfig,
    total: u128,
    recipients: &[Address],
    decimals: u8,
    rng: &mut R,
) -> Result<Vec<u128>> {
    let n = recipients.len();
    if n == 0 {
        return Ok(Vec::new());
    }

    let amounts = match funding.per_wallet_target {
        Some(target) => {
            let target = from_decimal(target, decimals)?;
            create_plan(total, recipients, target, funding.randomize, funding.variance_pct, rng)?
                .entries
                .into_iter()
                .map(|e| e.amount)
                .collect()
        }
        None if funding.randomize => {
            let floor = from_decimal(funding.min_per_wallet, decimals)?;
            compute_random_parts(total, n, floor, rng)?
        }
        None => {
            let target = total.div_ceil(n as u128).max(1);
            create_plan(total, recipients, target, false, funding.variance_pct, rng)?
                .entries
                .into_iter()
                .map(|e| e.amount)
                .collect()
        }
    };
    Ok(amounts)
}

pub struct FleetDriver {
    orchestrator: Arc<StepOrchestrator>,
}

impl FleetDriver {
    pub fn new(ctx: Arc<ExecutionContext>) -> Self {
        Self {
            orchestrator: Arc::new(StepOrchestrator::new(ctx)),
        }
    }

    fn ctx(&self) -> &Arc<ExecutionContext> {
        self.orchestrator.context()
    }

    /// Pair each wallet with its funding allocation. Wallets that already
    /// recorded a funding step keep what they recorded and are planned at zero.
    async fn jobs(&self, wallets: &[Arc<WalletRecord>]) -> Result<Vec<WalletJob>> {
        let ctx = self.ctx();
        let mut unfunded = Vec::new();
        for wallet in wallets {
            let funded = ctx
                .states
                .load(&state_key(wallet.address))
                .await?
                .is_some_and(|s| s.fund.is_some());
            if !funded {
                unfunded.push(wallet.address);
            }
        }

        let decimals = ctx.source_decimals().await?;
        let mut total = from_decimal(ctx.config.funding.total_amount, decimals)?;
        if ctx.config.funding.source == FundingSource::Funder && !unfunded.is_empty() {
            let funder = ctx.funder()?;
            let source = &ctx.config.chains.source;
            let available = ctx.balance(source.chain_id, source.token, funder.address).await?;
            if available < total {
                warn!(available, planned = total, "Funder holds less than the configured total");
                total = available;
            }
        }

        let amounts = {
            let mut rng = rand::thread_rng();
            plan_allocations(&ctx.config.funding, total, &unfunded, decimals, &mut rng)?
        };
        info!(wallets = wallets.len(), unfunded = unfunded.len(), total, "Planned allocations");

        let mut planned = unfunded.into_iter().zip(amounts);
        let mut next = planned.next();
        let mut jobs = Vec::with_capacity(wallets.len());
        for wallet in wallets {
            let index = wallet.derivation_index.ok_or_else(|| {
                LpFlowError::InvalidParameters(format!(
                    "{} is not a derived wallet",
                    wallet.address
                ))
            })?;
            let allocation = match next {
                Some((address, amount)) if address == wallet.address => {
                    next = planned.next();
                    amount
                }
                _ => 0,
            };
            jobs.push(WalletJob {
                wallet: wallet.clone(),
                index,
                allocation,
            });
        }
        Ok(jobs)
    }

    /// Run every wallet of the range and report where each one ended.
    ///
    /// A cancelled pipeline is reported with its last persisted step; its
    /// state is left as is for the next run.
    #[instrument(skip(self), fields(start = options.start_index, count = options.count))]
    pub async fn run(&self, options: RunOptions) -> Result<RunReport> {
        let ctx = self.ctx();
        let wallets = ctx.wallets.derive_range(options.start_index, options.count)?;
        let jobs = self.jobs(&wallets).await?;
        let concurrency = options.concurrency.max(1);
        info!(wallets = jobs.len(), concurrency, "Starting fleet run");

        let mut outcomes: Vec<WalletOutcome> = stream::iter(jobs)
            .map(|job| {
                let orchestrator = self.orchestrator.clone();
                async move {
                    match orchestrator.run(&job, options.retry_failed).await {
                        Ok(state) => WalletOutcome {
                            index: job.index,
                            address: job.address(),
                            step: Some(state.step),
                            error: state.failure.map(|f| f.reason),
                        },
                        Err(err) => {
                            let step = orchestrator
                                .context()
                                .states
                                .load(&job.key())
                                .await
                                .ok()
                                .flatten()
                                .map(|s| s.step);
                            WalletOutcome {
                                index: job.index,
                                address: job.address(),
                                step,
                                error: Some(err.to_string()),
                            }
                        }
                    }
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;
        outcomes.sort_by_key(|o| o.index);

        let report = RunReport { outcomes };
        info!(
            succeeded = report.succeeded(),
            total = report.outcomes.len(),
            "Fleet run finished"
        );
        for failed in report.failed() {
            warn!(
                index = failed.index,
                wallet = %failed.address,
                step = ?failed.step,
                error = failed.error.as_deref().unwrap_or(""),
                "Wallet did not complete"
            );
        }
        Ok(report)
    }
}
