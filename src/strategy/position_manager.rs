//! Position Manager
//!
//! Runs harvest cycles on open positions:
//! - value owed fees against the gas a harvest costs
//! - on a fee trigger: collect, reinvest a share, cash out the rest
//! - on a price trigger: withdraw, collect, rebalance the token split and
//!   mint a fresh range around the current price
//!
//! Each sub-action is written to the wallet's `CollectRecord` as soon as it
//! is submitted, so an interrupted cycle resumes by waiting on the recorded
//! hash instead of sending the action again.

use alloy::primitives::Address;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::context::{state_key, ExecutionContext, PoolContext};
use super::liquidity::{
    apply_slippage, price_from_sqrt_x96, rebalance_swap, token0_value_share, value_fees,
};
use super::stages::missing_record;
use crate::adapters::contracts::{
    collect, decode_collect, decode_increase_liquidity, decrease_liquidity, erc20_transfer,
    exact_input_single, increase_liquidity, mint, MintAmounts,
};
use crate::coordination::EndpointClass;
use crate::domain::{
    CollectRecord, HarvestAction, HarvestBreakdown, Position, PositionOpenRecord, Stage, Step,
    TxReceipt, TxRequest,
};
use crate::error::{LpFlowError, Result};
use crate::signing::WalletRecord;

/// One wallet's in-flight harvest cycle
struct Cycle {
    key: String,
    record: CollectRecord,
    position: Position,
    open: Option<PositionOpenRecord>,
}

impl Cycle {
    fn is_fresh(&self, action: HarvestAction) -> bool {
        self.record.action(action).is_none()
    }

    async fn save(&self, ctx: &ExecutionContext) -> Result<()> {
        let record = self.record.clone();
        let position = self.position.clone();
        let open = self.open.clone();
        ctx.persist(&self.key, move |s| {
            s.collect = Some(record);
            s.position = Some(position);
            s.position_open = open;
            Ok(())
        })
        .await?;
        Ok(())
    }
}

pub struct PositionManager {
    ctx: Arc<ExecutionContext>,
}

impl PositionManager {
    pub fn new(ctx: Arc<ExecutionContext>) -> Self {
        Self { ctx }
    }

    /// Run (or resume) one harvest cycle for `wallet` and return its record
    #[instrument(skip_all, fields(wallet = %wallet.address))]
    pub async fn harvest(&self, wallet: &WalletRecord) -> Result<CollectRecord> {
        let ctx = &*self.ctx;
        let key = state_key(wallet.address);
        let state = ctx.load(&key).await?;
        let position = state
            .position
            .clone()
            .ok_or_else(|| missing_record(Stage::Collect, "position", &key))?;
        let pool = ctx.pool().await?;

        let (record, position) = match state.collect {
            Some(record) if !record.is_finished() => {
                info!(started_at = %record.started_at, "Resuming harvest cycle");
                (record, position)
            }
            _ => self.evaluate(wallet.address, &pool, position).await?,
        };
        let mut cycle = Cycle {
            key,
            record,
            position,
            open: state.position_open,
        };

        if cycle.record.noop || !cycle.record.decision.should_rebalance {
            cycle.record.finished_at = Some(Utc::now());
            cycle.save(ctx).await?;
            info!(
                fee_value = %cycle.record.decision.fee_value,
                gas_threshold = %cycle.record.decision.gas_threshold,
                deviation_pct = %cycle.record.decision.price_deviation_pct,
                noop = cycle.record.noop,
                "Nothing to harvest"
            );
            return Ok(cycle.record);
        }

        if cycle.record.decision.requires_new_range() {
            self.rebalance(wallet, &pool, &mut cycle).await?;
        } else {
            self.harvest_fees(wallet, &pool, &mut cycle).await?;
        }

        cycle.position.last_harvest_at = Some(Utc::now());
        cycle.record.finished_at = Some(Utc::now());
        cycle.save(ctx).await?;
        info!(
            triggers = ?cycle.record.decision.triggers,
            liquidity = cycle.position.liquidity,
            tick_lower = cycle.position.tick_lower,
            tick_upper = cycle.position.tick_upper,
            "Harvest cycle complete"
        );
        Ok(cycle.record)
    }

    /// Snapshot owed fees and decide what this cycle does
    async fn evaluate(
        &self,
        owner: Address,
        pool: &PoolContext,
        mut position: Position,
    ) -> Result<(CollectRecord, Position)> {
        let ctx = &*self.ctx;
        let chain = ctx.destination_chain();
        let pool_state = ctx.pool_state(pool).await?;
        let price = price_from_sqrt_x96(pool_state.sqrt_price_x96, pool.decimals0, pool.decimals1)?;

        let (owed0, owed1) = match position.token_id {
            Some(token_id) => {
                let client = &ctx.chain;
                let npm = ctx.config.pool.position_manager;
                ctx.retry
                    .execute("owed_fees", EndpointClass::Rpc, move || {
                        client.owed_fees(chain, npm, token_id, owner)
                    })
                    .await?
            }
            None => (0, 0),
        };
        let snapshot = value_fees(owed0, owed1, pool.decimals0, pool.decimals1, price);
        let gas_price = ctx.gas_price(chain).await?;

        let decision = ctx
            .engine
            .evaluate_rebalance(&mut position, &snapshot, ctx.engine.gas_cost(gas_price));
        debug!(
            owed0,
            owed1,
            %price,
            in_range = position.in_range(pool_state.tick),
            triggers = ?decision.triggers,
            "Harvest evaluated"
        );

        let noop = snapshot.is_empty() && !decision.requires_new_range();
        let mut record = CollectRecord::new(decision, snapshot);
        record.noop = noop;
        Ok((record, position))
    }

    /// Collect, reinvest and cash out
    async fn harvest_fees(
        &self,
        wallet: &WalletRecord,
        pool: &PoolContext,
        cycle: &mut Cycle,
    ) -> Result<()> {
        let ctx = &*self.ctx;
        let npm = ctx.config.pool.position_manager;
        let owner = wallet.address;

        let tx = if cycle.is_fresh(HarvestAction::Collect) {
            cycle.position.token_id.map(|id| collect(npm, id, owner))
        } else {
            None
        };
        if let Some(receipt) = self.run_action(wallet, cycle, HarvestAction::Collect, tx).await? {
            let fees = cycle
                .record
                .fees
                .clone()
                .ok_or_else(|| {
                    LpFlowError::Internal("harvest cycle without a fee snapshot".into())
                })?;
            let (amount0, amount1) = match decode_collect(&receipt.logs, npm)? {
                Some(collected) => (collected.amount0, collected.amount1),
                None => (fees.owed0, fees.owed1),
            };
            let swept = value_fees(amount0, amount1, pool.decimals0, pool.decimals1, fees.price);
            let breakdown = ctx.engine.compute_harvest_breakdown(&swept);
            info!(
                amount0,
                amount1,
                reinvest_value = %breakdown.reinvest_value,
                cash_out_value = %breakdown.cash_out_value,
                "Fees collected"
            );
            cycle.record.breakdown = Some(breakdown);
            self.confirm(cycle, HarvestAction::Collect).await?;
        }
        let breakdown = cycle
            .record
            .breakdown
            .clone()
            .unwrap_or_else(HarvestBreakdown::empty);

        // Reinvest into the same position
        let tx = match cycle.position.token_id {
            Some(token_id)
                if cycle.is_fresh(HarvestAction::Reinvest) && breakdown.has_reinvest() =>
            {
                ctx.approve(wallet, pool.key.token0, npm, breakdown.reinvest0).await?;
                ctx.approve(wallet, pool.key.token1, npm, breakdown.reinvest1).await?;
                Some(increase_liquidity(
                    npm,
                    token_id,
                    breakdown.reinvest0,
                    breakdown.reinvest1,
                    ctx.deadline(),
                ))
            }
            _ => None,
        };
        if let Some(receipt) = self.run_action(wallet, cycle, HarvestAction::Reinvest, tx).await? {
            if let Some(added) = decode_increase_liquidity(&receipt.logs, npm)? {
                cycle.position.liquidity += added.liquidity;
                cycle.position.amount0 += added.amount0;
                cycle.position.amount1 += added.amount1;
                info!(liquidity = added.liquidity, "Fees reinvested");
            }
            self.confirm(cycle, HarvestAction::Reinvest).await?;
        }

        // Convert the other token's cash-out into the settlement token
        let settlement = ctx.engine.config().settlement_token;
        let tx = match settlement {
            Some(settlement) if cycle.is_fresh(HarvestAction::CashOutSwap) => {
                self.cash_out_swap(wallet, pool, cycle, &breakdown, settlement).await?
            }
            _ => None,
        };
        if self
            .run_action(wallet, cycle, HarvestAction::CashOutSwap, tx)
            .await?
            .is_some()
        {
            self.confirm(cycle, HarvestAction::CashOutSwap).await?;
        }
        if let Some(settlement) = settlement {
            self.settle_cash_out_swap(wallet, cycle, settlement).await?;
        }

        let (out0, out1) = cash_out_amounts(&cycle.record, &breakdown, pool, settlement);
        for (action, token, amount) in [
            (HarvestAction::CashOutTransfer0, pool.key.token0, out0),
            (HarvestAction::CashOutTransfer1, pool.key.token1, out1),
        ] {
            let tx = match ctx.engine.config().cash_out_address {
                Some(to) if amount > 0 && cycle.is_fresh(action) => {
                    Some(erc20_transfer(token, to, amount))
                }
                _ => None,
            };
            if self.run_action(wallet, cycle, action, tx).await?.is_some() {
                info!(token = %token, amount, "Cash-out transferred");
                self.confirm(cycle, action).await?;
            }
        }
        Ok(())
    }

    async fn cash_out_swap(
        &self,
        wallet: &WalletRecord,
        pool: &PoolContext,
        cycle: &mut Cycle,
        breakdown: &HarvestBreakdown,
        settlement: Address,
    ) -> Result<Option<TxRequest>> {
        let ctx = &*self.ctx;
        let Some(sell) = pool.key.other(settlement) else {
            warn!(
                settlement = %settlement,
                pool = %pool.key,
                "Settlement token is not in the pool"
            );
            return Ok(None);
        };
        let amount = if sell == pool.key.token0 {
            breakdown.cash_out0
        } else {
            breakdown.cash_out1
        };
        if amount == 0 {
            return Ok(None);
        }

        let quoted = ctx.quote(pool, sell, settlement, amount).await?;
        let min_out = apply_slippage(quoted, ctx.engine.config().slippage_bps);
        let router = ctx.config.pool.swap_router;
        ctx.approve(wallet, sell, router, amount).await?;
        cycle.record.cash_out_swap_out = Some(min_out);
        cycle.record.cash_out_balance_before = Some(
            ctx.balance(ctx.destination_chain(), Some(settlement), wallet.address)
                .await?,
        );
        Ok(Some(exact_input_single(
            router,
            sell,
            settlement,
            pool.key.fee,
            wallet.address,
            amount,
            min_out,
        )?))
    }

    /// Record what a confirmed cash-out swap delivered, once
    async fn settle_cash_out_swap(
        &self,
        wallet: &WalletRecord,
        cycle: &mut Cycle,
        settlement: Address,
    ) -> Result<()> {
        let ctx = &*self.ctx;
        let swapped = cycle
            .record
            .action(HarvestAction::CashOutSwap)
            .is_some_and(|a| a.confirmed && a.tx_hash.is_some());
        if !swapped || cycle.record.cash_out_received.is_some() {
            return Ok(());
        }

        let received = match cycle.record.cash_out_balance_before {
            Some(before) if !ctx.dry_run() => {
                let after = ctx
                    .balance(ctx.destination_chain(), Some(settlement), wallet.address)
                    .await?;
                after.saturating_sub(before)
            }
            _ => cycle.record.cash_out_swap_out.unwrap_or(0),
        };
        info!(received, min_out = ?cycle.record.cash_out_swap_out, "Cash-out swap settled");
        cycle.record.cash_out_received = Some(received);
        cycle.save(ctx).await
    }

    /// Withdraw everything, re-split the tokens and mint around the current price
    async fn rebalance(
        &self,
        wallet: &WalletRecord,
        pool: &PoolContext,
        cycle: &mut Cycle,
    ) -> Result<()> {
        let ctx = &*self.ctx;
        let npm = ctx.config.pool.position_manager;
        let owner = wallet.address;
        info!(
            deviation_pct = %cycle.record.decision.price_deviation_pct,
            reference = %cycle.position.rebalance_price,
            "Price left the band, re-ranging"
        );

        let tx = match cycle.position.token_id {
            Some(token_id)
                if cycle.is_fresh(HarvestAction::DecreaseLiquidity)
                    && cycle.position.liquidity > 0 =>
            {
                Some(decrease_liquidity(npm, token_id, cycle.position.liquidity, ctx.deadline()))
            }
            _ => None,
        };
        if self
            .run_action(wallet, cycle, HarvestAction::DecreaseLiquidity, tx)
            .await?
            .is_some()
        {
            cycle.position.liquidity = 0;
            cycle.position.amount0 = 0;
            cycle.position.amount1 = 0;
            self.confirm(cycle, HarvestAction::DecreaseLiquidity).await?;
        }

        let tx = if cycle.is_fresh(HarvestAction::Collect) {
            cycle.position.token_id.map(|id| collect(npm, id, owner))
        } else {
            None
        };
        if let Some(receipt) = self.run_action(wallet, cycle, HarvestAction::Collect, tx).await? {
            if let Some(collected) = decode_collect(&receipt.logs, npm)? {
                info!(
                    amount0 = collected.amount0,
                    amount1 = collected.amount1,
                    "Position withdrawn"
                );
            }
            self.confirm(cycle, HarvestAction::Collect).await?;
        }

        let tx = if cycle.is_fresh(HarvestAction::RebalanceSwap) {
            self.rebalance_swap_tx(wallet, pool, cycle).await?
        } else {
            None
        };
        if self
            .run_action(wallet, cycle, HarvestAction::RebalanceSwap, tx)
            .await?
            .is_some()
        {
            self.confirm(cycle, HarvestAction::RebalanceSwap).await?;
        }

        let tx = if cycle.is_fresh(HarvestAction::Mint) {
            Some(self.mint_tx(wallet, pool, cycle).await?)
        } else {
            None
        };
        if let Some(receipt) = self.run_action(wallet, cycle, HarvestAction::Mint, tx).await? {
            let open = cycle
                .open
                .clone()
                .ok_or_else(|| {
                    LpFlowError::Internal("rebalance mint without a range record".into())
                })?;
            let added = decode_increase_liquidity(&receipt.logs, npm)?;
            if added.is_none() && !ctx.dry_run() {
                return Err(LpFlowError::Internal(format!(
                    "mint {} emitted no IncreaseLiquidity event",
                    receipt.tx_hash
                )));
            }
            let pool_state = ctx.pool_state(pool).await?;
            let price =
                price_from_sqrt_x96(pool_state.sqrt_price_x96, pool.decimals0, pool.decimals1)?;

            let now = Utc::now();
            cycle.position = Position {
                pool: pool.key,
                pool_address: pool.address,
                token_id: added.map(|a| a.token_id),
                tick_lower: open.tick_lower,
                tick_upper: open.tick_upper,
                liquidity: added.map_or(0, |a| a.liquidity),
                amount0: added.map_or(open.amount0_desired, |a| a.amount0),
                amount1: added.map_or(open.amount1_desired, |a| a.amount1),
                rebalance_price: price,
                last_observed_price: price,
                opened_at: now,
                last_harvest_at: Some(now),
            };
            if let Some(entry) = cycle.open.as_mut() {
                entry.tx_hash = Some(receipt.tx_hash);
            }
            info!(
                token_id = ?cycle.position.token_id,
                tick_lower = open.tick_lower,
                tick_upper = open.tick_upper,
                %price,
                "Position re-ranged"
            );
            self.confirm(cycle, HarvestAction::Mint).await?;
        }
        Ok(())
    }

    /// Token balances available to the new position
    async fn holdings(
        &self,
        owner: Address,
        pool: &PoolContext,
        cycle: &Cycle,
    ) -> Result<(u128, u128)> {
        let ctx = &*self.ctx;
        if ctx.dry_run() {
            // Nothing was withdrawn; reuse the simulated position amounts
            return Ok((cycle.position.amount0, cycle.position.amount1));
        }
        let chain = ctx.destination_chain();
        Ok((
            ctx.balance(chain, Some(pool.key.token0), owner).await?,
            ctx.balance(chain, Some(pool.key.token1), owner).await?,
        ))
    }

    async fn rebalance_swap_tx(
        &self,
        wallet: &WalletRecord,
        pool: &PoolContext,
        cycle: &Cycle,
    ) -> Result<Option<TxRequest>> {
        let ctx = &*self.ctx;
        if ctx.dry_run() {
            return Ok(None);
        }
        let pool_state = ctx.pool_state(pool).await?;
        let range = ctx.engine.range_for(pool_state.tick, pool_state.tick_spacing)?;
        let share0 = token0_value_share(pool_state.sqrt_price_x96, range);
        let (balance0, balance1) = self.holdings(wallet.address, pool, cycle).await?;

        let Some(leg) = rebalance_swap(balance0, balance1, pool_state.sqrt_price_x96, share0) else {
            return Ok(None);
        };
        let (token_in, token_out) = if leg.zero_for_one {
            (pool.key.token0, pool.key.token1)
        } else {
            (pool.key.token1, pool.key.token0)
        };
        let quoted = ctx.quote(pool, token_in, token_out, leg.amount_in).await?;
        let min_out = apply_slippage(quoted, ctx.engine.config().slippage_bps);
        let router = ctx.config.pool.swap_router;
        ctx.approve(wallet, token_in, router, leg.amount_in).await?;
        debug!(
            zero_for_one = leg.zero_for_one,
            amount_in = leg.amount_in,
            min_out,
            share0,
            "Rebalance swap"
        );

        Ok(Some(exact_input_single(
            router,
            token_in,
            token_out,
            pool.key.fee,
            wallet.address,
            leg.amount_in,
            min_out,
        )?))
    }

    async fn mint_tx(
        &self,
        wallet: &WalletRecord,
        pool: &PoolContext,
        cycle: &mut Cycle,
    ) -> Result<TxRequest> {
        let ctx = &*self.ctx;
        let npm = ctx.config.pool.position_manager;
        let pool_state = ctx.pool_state(pool).await?;
        let range = ctx.engine.range_for(pool_state.tick, pool_state.tick_spacing)?;
        let (amount0, amount1) = self.holdings(wallet.address, pool, cycle).await?;
        if amount0 == 0 && amount1 == 0 {
            return Err(LpFlowError::MinimumAmount(format!(
                "{} holds nothing to re-deposit",
                wallet.address
            )));
        }

        ctx.approve(wallet, pool.key.token0, npm, amount0).await?;
        ctx.approve(wallet, pool.key.token1, npm, amount1).await?;
        cycle.open = Some(PositionOpenRecord {
            tick_lower: range.lower,
            tick_upper: range.upper,
            amount0_desired: amount0,
            amount1_desired: amount1,
            tx_hash: None,
        });
        mint(
            npm,
            &pool.key,
            range.lower,
            range.upper,
            MintAmounts {
                amount0_desired: amount0,
                amount1_desired: amount1,
                amount0_min: 0,
                amount1_min: 0,
            },
            wallet.address,
            ctx.deadline(),
        )
    }

    /// Drive one sub-action to a mined receipt.
    ///
    /// Returns `None` when the action was already confirmed or `tx` is `None`
    /// for a fresh action (recorded as skipped). A recorded hash is waited on
    /// and `tx` ignored.
    async fn run_action(
        &self,
        wallet: &WalletRecord,
        cycle: &mut Cycle,
        action: HarvestAction,
        tx: Option<TxRequest>,
    ) -> Result<Option<TxReceipt>> {
        let ctx = &*self.ctx;
        let chain = ctx.destination_chain();

        let hash = match cycle.record.action(action) {
            Some(entry) if entry.confirmed => return Ok(None),
            Some(entry) => entry.tx_hash.ok_or_else(|| {
                LpFlowError::Internal(format!("{} recorded without a transaction", action))
            })?,
            None => match tx {
                None => {
                    cycle.record.record_skipped(action);
                    cycle.save(ctx).await?;
                    debug!(%action, "Nothing to do");
                    return Ok(None);
                }
                Some(tx) => {
                    let hash = ctx.transactor.send(chain, wallet, &tx).await?;
                    cycle.record.record_submitted(action, hash);
                    cycle.save(ctx).await?;
                    info!(%action, tx_hash = %hash, "Harvest action submitted");
                    hash
                }
            },
        };

        let timeout = Duration::from_secs(ctx.engine.config().rebalance_timeout_secs);
        let receipt = ctx
            .transactor
            .wait_for_receipt(chain, hash, timeout, &ctx.cancel)
            .await?;
        Ok(Some(receipt))
    }

    async fn confirm(&self, cycle: &mut Cycle, action: HarvestAction) -> Result<()> {
        cycle.record.record_confirmed(action);
        cycle.save(&self.ctx).await
    }

    /// Harvest every completed wallet, then sleep `interval`; stop after one
    /// pass when `once` is set or when shutdown is requested. Returns the
    /// number of cycles that finished.
    #[instrument(skip(self))]
    pub async fn monitor(&self, interval: Duration, once: bool) -> Result<usize> {
        let ctx = &*self.ctx;
        let mut finished = 0usize;

        loop {
            for state in ctx.states.list().await? {
                if ctx.cancel.is_cancelled() {
                    break;
                }
                if state.step != Step::CollectDone || state.position.is_none() {
                    continue;
                }
                let wallet = match ctx.wallets.wallet(state.derivation_index) {
                    Ok(wallet) if state_key(wallet.address) == state.wallet_address => wallet,
                    Ok(wallet) => {
                        warn!(
                            recorded = %state.wallet_address,
                            derived = %wallet.address,
                            index = state.derivation_index,
                            "Derived address does not match state, skipping"
                        );
                        continue;
                    }
                    Err(err) => {
                        warn!(wallet = %state.wallet_address, error = %err, "Cannot derive wallet");
                        continue;
                    }
                };

                match self.harvest(&wallet).await {
                    Ok(record) => {
                        finished += 1;
                        debug!(
                            wallet = %wallet.address,
                            triggers = ?record.decision.triggers,
                            noop = record.noop,
                            "Harvest cycle finished"
                        );
                    }
                    Err(err) if err.is_cancelled() => return Ok(finished),
                    Err(err) => {
                        warn!(wallet = %wallet.address, error = %err, "Harvest cycle failed");
                    }
                }
            }

            if once {
                return Ok(finished);
            }
            if ctx.cancel.sleep(interval).await.is_err() {
                info!(cycles = finished, "Monitor stopped");
                return Ok(finished);
            }
        }
    }
}

/// Cash-out amounts per token after any settlement swap
fn cash_out_amounts(
    record: &CollectRecord,
    breakdown: &HarvestBreakdown,
    pool: &PoolContext,
    settlement: Option<Address>,
) -> (u128, u128) {
    let swapped = record
        .action(HarvestAction::CashOutSwap)
        .is_some_and(|a| a.tx_hash.is_some());
    let swap_out = record.cash_out_received.unwrap_or(0);

    match settlement {
        Some(token) if swapped && token == pool.key.token1 => (0, breakdown.cash_out1 + swap_out),
        Some(token) if swapped && token == pool.key.token0 => (breakdown.cash_out0 + swap_out, 0),
        _ => (breakdown.cash_out0, breakdown.cash_out1),
    }
}
