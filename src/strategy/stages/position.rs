//! Open the concentrated-liquidity position around the current price

use chrono::Utc;
use tracing::{info, instrument, warn};

use super::missing_record;
use crate::adapters::contracts::{decode_increase_liquidity, mint, MintAmounts};
use crate::domain::{Position, PositionOpenRecord, Stage};
use crate::error::{LpFlowError, Result};
use crate::strategy::context::{ExecutionContext, WalletJob};
use crate::strategy::liquidity::price_from_sqrt_x96;

#[instrument(skip_all, fields(wallet = %job.address(), index = job.index))]
pub async fn run(ctx: &ExecutionContext, job: &WalletJob) -> Result<()> {
    let key = job.key();
    let state = ctx.load(&key).await?;
    let pool = ctx.pool().await?;
    let chain = ctx.destination_chain();
    let npm = ctx.config.pool.position_manager;

    let open = match state.position_open {
        Some(open) => open,
        None => {
            let swap = state
                .swap
                .as_ref()
                .ok_or_else(|| missing_record(Stage::Position, "swap", &key))?;
            let (amount0, amount1) = if ctx.dry_run() {
                let bridged = state.bridge.as_ref().and_then(|b| b.received).unwrap_or(0);
                let kept = bridged.saturating_sub(swap.amount_in);
                let swapped = swap.amount_out.unwrap_or(0);
                if swap.token_in == pool.key.token0 {
                    (kept, swapped)
                } else {
                    (swapped, kept)
                }
            } else {
                (
                    ctx.balance(chain, Some(pool.key.token0), job.address()).await?,
                    ctx.balance(chain, Some(pool.key.token1), job.address()).await?,
                )
            };
            if amount0 == 0 && amount1 == 0 {
                return Err(LpFlowError::MinimumAmount(format!(
                    "{} holds nothing to deposit into {}",
                    job.address(),
                    pool.key
                )));
            }

            let pool_state = ctx.pool_state(&pool).await?;
            let range = ctx.engine.range_for(pool_state.tick, pool_state.tick_spacing)?;
            ctx.approve(&job.wallet, pool.key.token0, npm, amount0).await?;
            ctx.approve(&job.wallet, pool.key.token1, npm, amount1).await?;

            let tx = mint(
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
                job.address(),
                ctx.deadline(),
            )?;
            let hash = ctx.transactor.send(chain, &job.wallet, &tx).await?;
            let open = PositionOpenRecord {
                tick_lower: range.lower,
                tick_upper: range.upper,
                amount0_desired: amount0,
                amount1_desired: amount1,
                tx_hash: Some(hash),
            };
            let stored = open.clone();
            ctx.persist(&key, move |s| {
                s.position_open = Some(stored);
                Ok(())
            })
            .await?;
            info!(
                tick_lower = range.lower,
                tick_upper = range.upper,
                current_tick = pool_state.tick,
                amount0,
                amount1,
                tx_hash = %hash,
                "Mint submitted"
            );
            open
        }
    };

    if state.position.is_none() {
        let hash = open
            .tx_hash
            .ok_or_else(|| {
                LpFlowError::Internal(format!("position record for {} has no transaction", key))
            })?;
        let receipt = ctx
            .transactor
            .wait_for_receipt(chain, hash, ctx.receipt_timeout(), &ctx.cancel)
            .await?;

        let added = decode_increase_liquidity(&receipt.logs, npm)?;
        let (token_id, liquidity, amount0, amount1) = match added {
            Some(added) => (Some(added.token_id), added.liquidity, added.amount0, added.amount1),
            None if ctx.dry_run() => (None, 0, open.amount0_desired, open.amount1_desired),
            None => {
                return Err(LpFlowError::Internal(format!(
                    "mint {} emitted no IncreaseLiquidity event",
                    hash
                )))
            }
        };

        let pool_state = ctx.pool_state(&pool).await?;
        let price = price_from_sqrt_x96(pool_state.sqrt_price_x96, pool.decimals0, pool.decimals1)?;
        if !(open.tick_lower..open.tick_upper).contains(&pool_state.tick) {
            warn!(tick = pool_state.tick, "Price already outside the new range");
        }

        let position = Position {
            pool: pool.key,
            pool_address: pool.address,
            token_id,
            tick_lower: open.tick_lower,
            tick_upper: open.tick_upper,
            liquidity,
            amount0,
            amount1,
            rebalance_price: price,
            last_observed_price: price,
            opened_at: Utc::now(),
            last_harvest_at: None,
        };
        info!(token_id = ?token_id, liquidity, amount0, amount1, %price, "Position opened");
        ctx.persist(&key, move |s| {
            s.position = Some(position);
            Ok(())
        })
        .await?;
    }

    ctx.persist(&key, |s| s.complete(Stage::Position)).await?;
    Ok(())
}
