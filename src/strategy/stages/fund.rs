//! Funding: move the wallet's allocation onto the source chain, either from
//! the exchange or from the funder key

use alloy::primitives::TxHash;
use std::time::Duration;
use tracing::{info, instrument};

use super::missing_record;
use crate::adapters::contracts::erc20_transfer;
use crate::adapters::{WithdrawRequest, WithdrawalStatus};
use crate::config::FundingSource;
use crate::coordination::{poll_until, EndpointClass};
use crate::domain::{to_decimal, FundRecord, Stage, TxRequest};
use crate::error::{LpFlowError, Result};
use crate::strategy::context::{ExecutionContext, WalletJob};

#[instrument(skip_all, fields(wallet = %job.address(), index = job.index))]
pub async fn run(ctx: &ExecutionContext, job: &WalletJob) -> Result<()> {
    let key = job.key();
    let state = ctx.load(&key).await?;

    let record = match state.fund {
        Some(record) => record,
        None => {
            if job.allocation == 0 {
                return Err(LpFlowError::MinimumAmount(format!(
                    "no funding allocated to {}",
                    job.address()
                )));
            }
            let balance_before = ctx
                .balance(ctx.source_chain(), ctx.config.chains.source.token, job.address())
                .await?;
            let record = FundRecord {
                source: ctx.config.funding.source,
                amount: job.allocation,
                withdrawal_id: None,
                tx_hash: None,
                balance_before,
                received: None,
            };
            let stored = record.clone();
            ctx.persist(&key, move |s| {
                s.fund = Some(stored);
                Ok(())
            })
            .await?;
            record
        }
    };

    if record.received.is_none() {
        let received = match record.source {
            FundingSource::Funder => from_funder(ctx, job, &record).await?,
            FundingSource::Exchange => from_exchange(ctx, job, &record).await?,
        };
        info!(amount = record.amount, received, source = ?record.source, "Wallet funded");
        ctx.persist(&key, move |s| {
            let fund = s
                .fund
                .as_mut()
                .ok_or_else(|| missing_record(Stage::Fund, "fund", &s.wallet_address))?;
            fund.received = Some(received);
            Ok(())
        })
        .await?;
    }

    ctx.persist(&key, |s| s.complete(Stage::Fund)).await?;
    Ok(())
}

async fn from_funder(ctx: &ExecutionContext, job: &WalletJob, record: &FundRecord) -> Result<u128> {
    let chain = ctx.source_chain();
    let hash: TxHash = match record.tx_hash {
        Some(hash) => hash,
        None => {
            let funder = ctx.funder()?;
            let tx = match ctx.config.chains.source.token {
                Some(token) => erc20_transfer(token, job.address(), record.amount),
                None => TxRequest::native_transfer(job.address(), record.amount),
            };
            let hash = ctx.transactor.send(chain, funder, &tx).await?;
            ctx.persist(&job.key(), move |s| {
                if let Some(fund) = s.fund.as_mut() {
                    fund.tx_hash = Some(hash);
                }
                Ok(())
            })
            .await?;
            info!(
                funder = %funder.address,
                tx_hash = %hash,
                amount = record.amount,
                "Funding transfer submitted"
            );
            hash
        }
    };

    ctx.transactor
        .wait_for_receipt(chain, hash, ctx.receipt_timeout(), &ctx.cancel)
        .await?;
    Ok(record.amount)
}

async fn from_exchange(
    ctx: &ExecutionContext,
    job: &WalletJob,
    record: &FundRecord,
) -> Result<u128> {
    let exchange = ctx.exchange()?;
    let config = ctx
        .config
        .exchange
        .as_ref()
        .ok_or_else(|| {
            LpFlowError::ConfigMissing("[exchange] section is required for exchange funding".into())
        })?;

    // The client id is persisted before the request so a retry finds it
    let client_id = match &record.withdrawal_id {
        Some(id) => id.clone(),
        None => {
            let id = format!(
                "lpflow-{}-{}",
                job.index,
                &uuid::Uuid::new_v4().simple().to_string()[..8]
            );
            let stored = id.clone();
            ctx.persist(&job.key(), move |s| {
                if let Some(fund) = s.fund.as_mut() {
                    fund.withdrawal_id = Some(stored);
                }
                Ok(())
            })
            .await?;
            id
        }
    };

    let decimals = ctx.source_decimals().await?;
    let request = WithdrawRequest {
        asset: config.asset.clone(),
        network: config.network.clone(),
        address: job.address(),
        amount: to_decimal(record.amount, decimals),
        client_id: client_id.clone(),
    };

    let request_ref = &request;
    let exchange_id = ctx
        .retry
        .execute("withdraw", EndpointClass::Exchange, move || async move {
            if let Some(existing) = exchange.withdrawal(&request_ref.client_id).await? {
                return Ok(existing.id);
            }
            exchange.withdraw(request_ref).await
        })
        .await?;
    info!(
        client_id = %client_id,
        exchange_id = %exchange_id,
        amount = %request.amount,
        "Withdrawal requested"
    );

    let retry = &ctx.retry;
    let id = client_id.as_str();
    poll_until(
        "withdrawal",
        ctx.schedule(Duration::from_secs(ctx.config.funding.withdrawal_timeout_secs)),
        &ctx.cancel,
        move || async move {
            let withdrawal = retry
                .execute("withdrawal_status", EndpointClass::Exchange, move || {
                    exchange.withdrawal(id)
                })
                .await?;
            match withdrawal.map(|w| w.status) {
                Some(WithdrawalStatus::Completed { .. }) => Ok(Some(())),
                Some(WithdrawalStatus::Failed { reason }) => Err(LpFlowError::TransferFailed(
                    format!("withdrawal {} failed: {}", id, reason),
                )),
                Some(WithdrawalStatus::Cancelled) => Err(LpFlowError::TransferFailed(format!(
                    "withdrawal {} was cancelled",
                    id
                ))),
                Some(WithdrawalStatus::Pending { .. }) | None => Ok(None),
            }
        },
    )
    .await?;

    if ctx.dry_run() {
        return Ok(record.amount);
    }

    let chain = ctx.source_chain();
    let token = ctx.config.chains.source.token;
    let owner = job.address();
    let before = record.balance_before;
    let balance = poll_until(
        "funds arrival",
        ctx.schedule(ctx.config.orchestrator.settle_timeout()),
        &ctx.cancel,
        move || async move {
            let balance = ctx.balance(chain, token, owner).await?;
            Ok((balance > before).then_some(balance))
        },
    )
    .await?;
    Ok(balance - before)
}
