use alloy::primitives::{Address, TxHash, U256};
use async_trait::async_trait;

use crate::domain::{ChainId, PoolKey, PoolState, TxReceipt, TxRequest};
use crate::error::Result;
use crate::signing::Wallet;

/// Typed access to the EVM chains the pipeline touches
///
/// Implementations classify raw provider failures into [`crate::error::LpFlowError`]
/// before returning. Callers re-query rather than cache values across waits.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn native_balance(&self, chain: ChainId, owner: Address) -> Result<u128>;

    async fn token_balance(&self, chain: ChainId, token: Address, owner: Address) -> Result<u128>;

    async fn allowance(
        &self,
        chain: ChainId,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> Result<u128>;

    async fn token_decimals(&self, chain: ChainId, token: Address) -> Result<u8>;

    /// Authoritative pending transaction count
    async fn pending_nonce(&self, chain: ChainId, address: Address) -> Result<u64>;

    /// Current gas price in wei
    async fn gas_price(&self, chain: ChainId) -> Result<u128>;

    /// Pool deployed by `factory` for `key`, if any
    async fn pool_address(
        &self,
        chain: ChainId,
        factory: Address,
        key: &PoolKey,
    ) -> Result<Option<Address>>;

    async fn pool_state(&self, chain: ChainId, pool: Address) -> Result<PoolState>;

    /// Expected output of an exact-input single-hop swap
    async fn quote_exact_input(
        &self,
        chain: ChainId,
        quoter: Address,
        token_in: Address,
        token_out: Address,
        fee: u32,
        amount_in: u128,
    ) -> Result<u128>;

    /// Fees owed to a position, simulated as a max `collect` from its owner
    async fn owed_fees(
        &self,
        chain: ChainId,
        position_manager: Address,
        token_id: U256,
        owner: Address,
    ) -> Result<(u128, u128)>;

    /// Sign and broadcast with an explicit nonce
    async fn send_transaction(
        &self,
        chain: ChainId,
        wallet: &Wallet,
        nonce: u64,
        tx: &TxRequest,
    ) -> Result<TxHash>;

    /// `None` while the transaction is not yet mined
    async fn transaction_receipt(&self, chain: ChainId, hash: TxHash) -> Result<Option<TxReceipt>>;

    /// Balance of an ERC-20, or of the native coin when `token` is `None`
    async fn balance_of(
        &self,
        chain: ChainId,
        token: Option<Address>,
        owner: Address,
    ) -> Result<u128> {
        match token {
            Some(token) => self.token_balance(chain, token, owner).await,
            None => self.native_balance(chain, owner).await,
        }
    }
}
