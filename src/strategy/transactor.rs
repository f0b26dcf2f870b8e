//! Transaction submission
//!
//! Every on-chain write in the pipeline goes through [`Transactor::send`]:
//! a nonce is allocated from the [`WalletDirectory`], the signed transaction
//! is broadcast under the retry policy reusing that nonce, and a stale-nonce
//! rejection resynchronises the cache from the chain before the next attempt.
//!
//! A broadcast that failed with a network error or timeout may still have
//! reached the mempool. Once that has happened a later "nonce too low" means
//! the nonce was probably consumed by our own transaction, so the send stops
//! with [`LpFlowError::StateConflict`] instead of re-signing under a fresh
//! nonce and risking a double transfer.

use alloy::primitives::{Address, TxHash, U256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::adapters::contracts::erc20_approve;
use crate::adapters::ChainClient;
use crate::coordination::{poll_until, CancelToken, EndpointClass, PollSchedule, RetryExecutor};
use crate::domain::{ChainId, TxReceipt, TxRequest};
use crate::error::{LpFlowError, Result};
use crate::signing::{WalletDirectory, WalletRecord};

/// Stale-nonce resynchronisations allowed within one send
const MAX_NONCE_RESYNCS: u32 = 3;

struct SendAttempt {
    nonce: u64,
    /// A previous attempt may have been broadcast
    ambiguous: bool,
    resyncs: u32,
}

pub struct Transactor {
    chain: Arc<dyn ChainClient>,
    wallets: Arc<WalletDirectory>,
    retry: Arc<RetryExecutor>,
    poll_interval: Duration,
}

impl Transactor {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        wallets: Arc<WalletDirectory>,
        retry: Arc<RetryExecutor>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            chain,
            wallets,
            retry,
            poll_interval,
        }
    }

    /// Sign and broadcast `tx` from `from`, returning the transaction hash
    pub async fn send(
        &self,
        chain: ChainId,
        from: &WalletRecord,
        tx: &TxRequest,
    ) -> Result<TxHash> {
        let address = from.address;
        let first = self.wallets.allocate_nonce(chain, address).await?;
        let attempt = Mutex::new(SendAttempt {
            nonce: first,
            ambiguous: false,
            resyncs: 0,
        });

        let this = self;
        let attempt_ref = &attempt;
        let result = self
            .retry
            .execute("send_transaction", EndpointClass::Rpc, move || async move {
                let nonce = attempt_ref.lock().await.nonce;
                match this.chain.send_transaction(chain, &from.wallet, nonce, tx).await {
                    Ok(hash) => Ok(hash),
                    Err(LpFlowError::NonceTooLow(message)) => {
                        this.resync_nonce(chain, address, attempt_ref, message).await
                    }
                    Err(err) => {
                        if matches!(err, LpFlowError::Network(_) | LpFlowError::Timeout(_)) {
                            attempt_ref.lock().await.ambiguous = true;
                        }
                        Err(err)
                    }
                }
            })
            .await;

        let attempt = attempt.into_inner();
        match result {
            Ok(hash) => {
                debug!(
                    chain,
                    from = %address,
                    nonce = attempt.nonce,
                    tx_hash = %hash,
                    "Transaction submitted"
                );
                Ok(hash)
            }
            Err(err) => {
                // Only a nonce that never left the process can be handed back
                if !attempt.ambiguous
                    && !self.wallets.release_nonce(chain, address, attempt.nonce).await
                {
                    warn!(
                        chain,
                        from = %address,
                        nonce = attempt.nonce,
                        "Nonce not released, resynchronising"
                    );
                    if let Err(e) = self.wallets.reset_nonce(chain, address).await {
                        warn!(chain, from = %address, error = %e, "Nonce resync failed");
                    }
                }
                Err(err)
            }
        }
    }

    async fn resync_nonce(
        &self,
        chain: ChainId,
        address: Address,
        attempt: &Mutex<SendAttempt>,
        message: String,
    ) -> Result<TxHash> {
        let mut attempt = attempt.lock().await;
        if attempt.ambiguous {
            return Err(LpFlowError::StateConflict(format!(
                "nonce {} for {} was consumed after an ambiguous broadcast; \
                 check the chain before retrying ({})",
                attempt.nonce, address, message
            )));
        }
        if attempt.resyncs >= MAX_NONCE_RESYNCS {
            return Err(LpFlowError::StateConflict(format!(
                "nonce for {} still stale after {} resyncs: {}",
                address, attempt.resyncs, message
            )));
        }
        attempt.resyncs += 1;
        self.wallets.reset_nonce(chain, address).await?;
        let stale = attempt.nonce;
        attempt.nonce = self.wallets.allocate_nonce(chain, address).await?;
        warn!(
            chain,
            address = %address,
            stale,
            fresh = attempt.nonce,
            "Stale nonce, resynchronised from chain"
        );
        Err(LpFlowError::NonceTooLow(message))
    }

    /// Poll for the receipt of `hash` until it is mined, `timeout` elapses or
    /// `cancel` fires. A reverted receipt is a fatal error.
    pub async fn wait_for_receipt(
        &self,
        chain: ChainId,
        hash: TxHash,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<TxReceipt> {
        let this = self;
        let receipt = poll_until(
            "receipt",
            PollSchedule::new(self.poll_interval, timeout),
            cancel,
            move || async move {
                this.retry
                    .execute("transaction_receipt", EndpointClass::Rpc, move || {
                        this.chain.transaction_receipt(chain, hash)
                    })
                    .await
            },
        )
        .await?;

        if !receipt.success {
            return Err(LpFlowError::TransactionReverted(format!(
                "{} reverted in block {}",
                hash,
                receipt
                    .block_number
                    .map(|b| b.to_string())
                    .unwrap_or_else(|| "?".into())
            )));
        }
        Ok(receipt)
    }

    /// Send and wait for a successful receipt
    pub async fn send_and_confirm(
        &self,
        chain: ChainId,
        from: &WalletRecord,
        tx: &TxRequest,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<TxReceipt> {
        let hash = self.send(chain, from, tx).await?;
        self.wait_for_receipt(chain, hash, timeout, cancel).await
    }

    /// Approve `spender` for an unlimited amount when the current allowance
    /// does not cover `amount`. Returns the approval hash if one was sent.
    pub async fn ensure_allowance(
        &self,
        chain: ChainId,
        owner: &WalletRecord,
        token: Address,
        spender: Address,
        amount: u128,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<Option<TxHash>> {
        let this = self;
        let owner_address = owner.address;
        let current = self
            .retry
            .execute("allowance", EndpointClass::Rpc, move || {
                this.chain.allowance(chain, token, owner_address, spender)
            })
            .await?;
        if current >= amount {
            return Ok(None);
        }

        let receipt = self
            .send_and_confirm(
                chain,
                owner,
                &erc20_approve(token, spender, U256::MAX),
                timeout,
                cancel,
            )
            .await?;
        info!(
            chain,
            owner = %owner.address,
            token = %token,
            spender = %spender,
            tx_hash = %receipt.tx_hash,
            "Allowance granted"
        );
        Ok(Some(receipt.tx_hash))
    }
}
