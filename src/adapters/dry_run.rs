//! Dry-run decorators
//!
//! Reads go to the real collaborators; mutating calls are logged and answered
//! with deterministic synthetic identifiers so the pipeline records the same
//! state shape as a live run.

use alloy::primitives::{keccak256, Address, TxHash, U256};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::info;

use super::chain::ChainClient;
use super::exchange::{ExchangeClient, WithdrawRequest, Withdrawal, WithdrawalStatus};
use crate::domain::{ChainId, PoolKey, PoolState, TxReceipt, TxRequest};
use crate::error::Result;
use crate::signing::Wallet;

/// Leading bytes of every synthetic transaction hash
const SYNTHETIC_MARKER: [u8; 6] = *b"dryrun";

/// Prefix of every synthetic withdrawal id
const SYNTHETIC_WITHDRAWAL_PREFIX: &str = "dry-run-";

pub fn synthetic_tx_hash(chain: ChainId, from: Address, nonce: u64, tx: &TxRequest) -> TxHash {
    let mut preimage = Vec::with_capacity(8 + 20 + 8 + 20 + tx.data.len() + 32);
    preimage.extend_from_slice(&chain.to_be_bytes());
    preimage.extend_from_slice(from.as_slice());
    preimage.extend_from_slice(&nonce.to_be_bytes());
    preimage.extend_from_slice(tx.to.as_slice());
    preimage.extend_from_slice(&tx.data);
    preimage.extend_from_slice(&tx.value.to_be_bytes::<32>());

    let mut hash = keccak256(&preimage);
    hash.0[..SYNTHETIC_MARKER.len()].copy_from_slice(&SYNTHETIC_MARKER);
    hash
}

pub fn is_synthetic(hash: &TxHash) -> bool {
    hash.0[..SYNTHETIC_MARKER.len()] == SYNTHETIC_MARKER
}

pub struct DryRunChain {
    inner: Arc<dyn ChainClient>,
}

impl DryRunChain {
    pub fn new(inner: Arc<dyn ChainClient>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl ChainClient for DryRunChain {
    async fn native_balance(&self, chain: ChainId, owner: Address) -> Result<u128> {
        self.inner.native_balance(chain, owner).await
    }

    async fn token_balance(&self, chain: ChainId, token: Address, owner: Address) -> Result<u128> {
        self.inner.token_balance(chain, token, owner).await
    }

    async fn allowance(
        &self,
        chain: ChainId,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> Result<u128> {
        self.inner.allowance(chain, token, owner, spender).await
    }

    async fn token_decimals(&self, chain: ChainId, token: Address) -> Result<u8> {
        self.inner.token_decimals(chain, token).await
    }

    async fn pending_nonce(&self, chain: ChainId, address: Address) -> Result<u64> {
        self.inner.pending_nonce(chain, address).await
    }

    async fn gas_price(&self, chain: ChainId) -> Result<u128> {
        self.inner.gas_price(chain).await
    }

    async fn pool_address(
        &self,
        chain: ChainId,
        factory: Address,
        key: &PoolKey,
    ) -> Result<Option<Address>> {
        self.inner.pool_address(chain, factory, key).await
    }

    async fn pool_state(&self, chain: ChainId, pool: Address) -> Result<PoolState> {
        self.inner.pool_state(chain, pool).await
    }

    async fn quote_exact_input(
        &self,
        chain: ChainId,
        quoter: Address,
        token_in: Address,
        token_out: Address,
        fee: u32,
        amount_in: u128,
    ) -> Result<u128> {
        self.inner
            .quote_exact_input(chain, quoter, token_in, token_out, fee, amount_in)
            .await
    }

    async fn owed_fees(
        &self,
        chain: ChainId,
        position_manager: Address,
        token_id: U256,
        owner: Address,
    ) -> Result<(u128, u128)> {
        self.inner
            .owed_fees(chain, position_manager, token_id, owner)
            .await
    }

    async fn send_transaction(
        &self,
        chain: ChainId,
        wallet: &Wallet,
        nonce: u64,
        tx: &TxRequest,
    ) -> Result<TxHash> {
        let hash = synthetic_tx_hash(chain, wallet.address(), nonce, tx);
        info!(
            chain,
            from = %wallet.address(),
            to = %tx.to,
            value = %tx.value,
            nonce,
            calldata_len = tx.data.len(),
            tx_hash = %hash,
            "[DRY RUN] Would send transaction"
        );
        Ok(hash)
    }

    async fn transaction_receipt(&self, chain: ChainId, hash: TxHash) -> Result<Option<TxReceipt>> {
        if is_synthetic(&hash) {
            return Ok(Some(TxReceipt {
                tx_hash: hash,
                success: true,
                block_number: None,
                logs: Vec::new(),
            }));
        }
        self.inner.transaction_receipt(chain, hash).await
    }
}

pub struct DryRunExchange {
    inner: Arc<dyn ExchangeClient>,
}

impl DryRunExchange {
    pub fn new(inner: Arc<dyn ExchangeClient>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl ExchangeClient for DryRunExchange {
    async fn balance(&self, asset: &str) -> Result<Decimal> {
        self.inner.balance(asset).await
    }

    async fn withdraw(&self, request: &WithdrawRequest) -> Result<String> {
        let id = format!("{}{}", SYNTHETIC_WITHDRAWAL_PREFIX, request.client_id);
        info!(
            asset = %request.asset,
            network = %request.network,
            address = %request.address,
            amount = %request.amount,
            id = %id,
            "[DRY RUN] Would withdraw"
        );
        Ok(id)
    }

    async fn withdrawal(&self, client_id: &str) -> Result<Option<Withdrawal>> {
        // Dry-run withdrawals are never sent, so any lookup resolves as completed
        Ok(Some(Withdrawal {
            id: format!("{}{}", SYNTHETIC_WITHDRAWAL_PREFIX, client_id),
            client_id: Some(client_id.to_string()),
            amount: Decimal::ZERO,
            status: WithdrawalStatus::Completed { tx_hash: None },
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::fakes::FakeChain;
    use crate::signing::wallet::tests::TEST_MNEMONIC;
    use crate::signing::derive_wallet;

    #[tokio::test]
    async fn sends_are_synthetic_and_deterministic() {
        let fake = Arc::new(FakeChain::new());
        let chain = DryRunChain::new(fake.clone());
        let wallet = derive_wallet(TEST_MNEMONIC, 0).unwrap();
        let tx = TxRequest::native_transfer(Address::repeat_byte(0x11), 5);

        let a = chain.send_transaction(1, &wallet, 0, &tx).await.unwrap();
        let b = chain.send_transaction(1, &wallet, 0, &tx).await.unwrap();
        let c = chain.send_transaction(1, &wallet, 1, &tx).await.unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(is_synthetic(&a));
        assert!(fake.sent().is_empty());

        let receipt = chain.transaction_receipt(1, a).await.unwrap().unwrap();
        assert!(receipt.success);
    }

    #[tokio::test]
    async fn reads_pass_through() {
        let fake = Arc::new(FakeChain::new());
        let owner = Address::repeat_byte(0x22);
        fake.set_native_balance(1, owner, 42);
        let chain = DryRunChain::new(fake.clone());
        assert_eq!(chain.native_balance(1, owner).await.unwrap(), 42);
    }
}
