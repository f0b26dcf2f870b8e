//! Swap part of the bridged token into the other pool token so the deposit
//! matches the value split of the target range

use tracing::{info, instrument};

use super::missing_record;
use crate::adapters::contracts::exact_input_single;
use crate::coordination::poll_until;
use crate::domain::{Stage, SwapRecord};
use crate::error::{LpFlowError, Result};
use crate::strategy::context::{ExecutionContext, WalletJob};
use crate::strategy::liquidity::{apply_slippage, split_for_deposit, token0_value_share};

#[instrument(skip_all, fields(wallet = %job.address(), index = job.index))]
pub async fn run(ctx: &ExecutionContext, job: &WalletJob) -> Result<()> {
    let key = job.key();
    let state = ctx.load(&key).await?;

    let record = match state.swap {
        Some(record) => record,
        None => {
            let bridged = state
                .bridge
                .as_ref()
                .and_then(|b| b.received.map(|received| (received, b.destination_balance_before)))
                .ok_or_else(|| missing_record(Stage::Swap, "bridge", &key))?;
            submit(ctx, job, bridged.0, bridged.1).await?
        }
    };

    if record.amount_out.is_none() {
        let hash = record
            .tx_hash
            .ok_or_else(|| {
                LpFlowError::Internal(format!("swap record for {} has no transaction", key))
            })?;
        let chain = ctx.destination_chain();
        ctx.transactor
            .wait_for_receipt(chain, hash, ctx.receipt_timeout(), &ctx.cancel)
            .await?;

        let amount_out = if ctx.dry_run() {
            record.min_amount_out
        } else {
            let after = ctx.balance(chain, Some(record.token_out), job.address()).await?;
            after.saturating_sub(record.out_balance_before)
        };
        info!(amount_in = record.amount_in, amount_out, "Swap settled");

        ctx.persist(&key, move |s| {
            let swap = s
                .swap
                .as_mut()
                .ok_or_else(|| missing_record(Stage::Swap, "swap", &s.wallet_address))?;
            swap.amount_out = Some(amount_out);
            Ok(())
        })
        .await?;
    }

    ctx.persist(&key, |s| s.complete(Stage::Swap)).await?;
    Ok(())
}

async fn submit(
    ctx: &ExecutionContext,
    job: &WalletJob,
    received: u128,
    balance_before: u128,
) -> Result<SwapRecord> {
    let chain = ctx.destination_chain();
    let owner = job.address();
    let pool = ctx.pool().await?;
    let token_in = ctx.config.bridge.destination_token;
    let token_out = pool.key.other(token_in).ok_or_else(|| {
        LpFlowError::InvalidParameters(format!(
            "bridged token {} is not in pool {}",
            token_in, pool.key
        ))
    })?;

    let basis = if ctx.dry_run() {
        received
    } else {
        let balance = poll_until(
            "bridged funds",
            ctx.schedule(ctx.config.orchestrator.settle_timeout()),
            &ctx.cancel,
            move || async move {
                let balance = ctx.balance(chain, Some(token_in), owner).await?;
                Ok((balance > balance_before).then_some(balance))
            },
        )
        .await?;
        balance.min(received)
    };

    let pool_state = ctx.pool_state(&pool).await?;
    let range = ctx.engine.range_for(pool_state.tick, pool_state.tick_spacing)?;
    let share0 = token0_value_share(pool_state.sqrt_price_x96, range);
    let amount_in = split_for_deposit(basis, token_in == pool.key.token0, share0);

    let mut record = SwapRecord {
        token_in,
        token_out,
        amount_in,
        min_amount_out: 0,
        out_balance_before: 0,
        tx_hash: None,
        amount_out: None,
    };

    if amount_in == 0 {
        // Range sits entirely on the held token's side
        record.amount_out = Some(0);
    } else {
        let quoted = ctx.quote(&pool, token_in, token_out, amount_in).await?;
        record.min_amount_out = apply_slippage(quoted, ctx.engine.config().slippage_bps);
        ctx.approve(&job.wallet, token_in, ctx.config.pool.swap_router, amount_in)
            .await?;
        record.out_balance_before = ctx.balance(chain, Some(token_out), owner).await?;

        let tx = exact_input_single(
            ctx.config.pool.swap_router,
            token_in,
            token_out,
            pool.key.fee,
            owner,
            amount_in,
            record.min_amount_out,
        )?;
        let hash = ctx.transactor.send(chain, &job.wallet, &tx).await?;
        record.tx_hash = Some(hash);
        info!(
            basis,
            amount_in,
            min_out = record.min_amount_out,
            share0,
            tx_hash = %hash,
            "Swap submitted"
        );
    }

    let stored = record.clone();
    ctx.persist(&job.key(), move |s| {
        s.swap = Some(stored);
        Ok(())
    })
    .await?;
    Ok(record)
}
