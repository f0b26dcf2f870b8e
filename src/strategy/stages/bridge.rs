//! Bridging: move the funded balance from the source chain to the pool's chain

use alloy::primitives::Address;
use std::time::Duration;
use tracing::{debug, info, instrument};

use super::missing_record;
use crate::adapters::{BridgeStatus, RouteRequest, StatusQuery};
use crate::coordination::{poll_until, EndpointClass};
use crate::domain::{from_decimal, BridgeRecord, Stage};
use crate::error::{LpFlowError, Result};
use crate::strategy::context::{ExecutionContext, WalletJob};

#[instrument(skip_all, fields(wallet = %job.address(), index = job.index))]
pub async fn run(ctx: &ExecutionContext, job: &WalletJob) -> Result<()> {
    let key = job.key();
    let state = ctx.load(&key).await?;

    let record = match state.bridge {
        Some(record) => record,
        None => {
            let funded = state
                .fund
                .as_ref()
                .and_then(|f| f.received)
                .ok_or_else(|| missing_record(Stage::Bridge, "fund", &key))?;
            submit(ctx, job, funded).await?
        }
    };

    if record.received.is_none() {
        let hash = record
            .tx_hash
            .ok_or_else(|| {
                LpFlowError::Internal(format!("bridge record for {} has no transaction", key))
            })?;
        ctx.transactor
            .wait_for_receipt(ctx.source_chain(), hash, ctx.receipt_timeout(), &ctx.cancel)
            .await?;

        let (received, receiving_tx) = if ctx.dry_run() {
            (record.to_amount_min, None)
        } else {
            await_delivery(ctx, &record, hash).await?
        };
        info!(tool = %record.tool, sent = record.from_amount, received, "Bridge delivered");

        ctx.persist(&key, move |s| {
            let bridge = s
                .bridge
                .as_mut()
                .ok_or_else(|| missing_record(Stage::Bridge, "bridge", &s.wallet_address))?;
            bridge.received = Some(received);
            bridge.receiving_tx = receiving_tx;
            Ok(())
        })
        .await?;
    }

    ctx.persist(&key, |s| s.complete(Stage::Bridge)).await?;
    Ok(())
}

/// Quote, approve and send the bridge transaction, then persist its record
async fn submit(ctx: &ExecutionContext, job: &WalletJob, funded: u128) -> Result<BridgeRecord> {
    let source = ctx.source_chain();
    let destination = ctx.destination_chain();
    let token = ctx.config.chains.source.token;
    let owner = job.address();

    let balance = ctx.balance(source, token, owner).await?;
    let mut amount = match token {
        Some(_) => balance,
        None => balance.saturating_sub(from_decimal(ctx.config.funding.gas_reserve, 18)?),
    };
    if ctx.dry_run() {
        // Nothing actually arrived
        amount = amount.max(funded);
    }

    let decimals = ctx.source_decimals().await?;
    let minimum = from_decimal(ctx.config.bridge.min_amount, decimals)?;
    if amount == 0 || amount < minimum {
        return Err(LpFlowError::MinimumAmount(format!(
            "bridge amount {} below minimum {}",
            amount, minimum
        )));
    }

    let destination_token = ctx.config.bridge.destination_token;
    let destination_balance_before = ctx
        .balance(destination, Some(destination_token), owner)
        .await?;

    let request = RouteRequest {
        from_chain: source,
        to_chain: destination,
        from_token: token.unwrap_or(Address::ZERO),
        to_token: destination_token,
        from_amount: amount,
        from_address: owner,
        to_address: owner,
        slippage: ctx.config.bridge.slippage,
    };
    let bridge = &ctx.bridge;
    let request_ref = &request;
    let route = ctx
        .retry
        .execute("bridge_quote", EndpointClass::Bridge, move || bridge.quote(request_ref))
        .await?;
    debug!(
        tool = %route.tool,
        to_amount = route.to_amount,
        to_amount_min = route.to_amount_min,
        "Route quoted"
    );

    if let (Some(token), Some(spender)) = (token, route.approval_address) {
        ctx.transactor
            .ensure_allowance(
                source,
                &job.wallet,
                token,
                spender,
                amount,
                ctx.receipt_timeout(),
                &ctx.cancel,
            )
            .await?;
    }

    let hash = ctx.transactor.send(source, &job.wallet, &route.transaction).await?;
    let record = BridgeRecord {
        tool: route.tool,
        from_amount: amount,
        to_amount_min: route.to_amount_min,
        tx_hash: Some(hash),
        destination_balance_before,
        received: None,
        receiving_tx: None,
    };
    let stored = record.clone();
    ctx.persist(&job.key(), move |s| {
        s.bridge = Some(stored);
        Ok(())
    })
    .await?;
    info!(tool = %record.tool, amount, tx_hash = %hash, "Bridge submitted");
    Ok(record)
}

/// Poll the bridge until the transfer lands on the destination chain
async fn await_delivery(
    ctx: &ExecutionContext,
    record: &BridgeRecord,
    hash: alloy::primitives::TxHash,
) -> Result<(u128, Option<String>)> {
    let query = StatusQuery {
        tx_hash: hash,
        from_chain: ctx.source_chain(),
        to_chain: ctx.destination_chain(),
        tool: record.tool.clone(),
    };
    let bridge = &ctx.bridge;
    let retry = &ctx.retry;
    let query_ref = &query;
    let fallback = record.to_amount_min;

    poll_until(
        "bridge confirmation",
        ctx.schedule(Duration::from_secs(ctx.config.bridge.timeout_secs)),
        &ctx.cancel,
        move || async move {
            let status = retry
                .execute("bridge_status", EndpointClass::Bridge, move || bridge.status(query_ref))
                .await?;
            match status {
                BridgeStatus::Done { receiving_tx, amount } => {
                    Ok(Some((amount.unwrap_or(fallback), receiving_tx)))
                }
                BridgeStatus::Failed { reason } => Err(LpFlowError::TransferFailed(format!(
                    "bridge transfer {} failed: {}",
                    query_ref.tx_hash, reason
                ))),
                BridgeStatus::Pending { substatus } => {
                    debug!(substatus = ?substatus, "Bridge pending");
                    Ok(None)
                }
                BridgeStatus::NotFound => Ok(None),
            }
        },
    )
    .await
}
