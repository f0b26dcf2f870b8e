//! [`ChainClient`] over JSON-RPC HTTP endpoints

use alloy::network::{EthereumWallet, ReceiptResponse, TransactionBuilder};
use alloy::primitives::{Address, TxHash, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{debug, info};

use super::chain::ChainClient;
use super::contracts::{
    collect_all_params, quote_params, INonfungiblePositionManager, IQuoterV2, IUniswapV3Factory,
    IUniswapV3Pool, IERC20,
};
use crate::config::{ChainEndpoint, ChainsConfig};
use crate::domain::{u256_to_u128, ChainId, PoolKey, PoolState, TxReceipt, TxRequest};
use crate::error::{classify_rpc_error, LpFlowError, Result};
use crate::signing::Wallet;

/// Estimated gas is padded by this percentage
const GAS_LIMIT_HEADROOM_PCT: u64 = 120;

struct ChainHandle {
    name: String,
    provider: DynProvider,
}

pub struct AlloyChainClient {
    chains: HashMap<ChainId, ChainHandle>,
}

fn rpc_err(context: &str, err: impl std::fmt::Display) -> LpFlowError {
    let classified = classify_rpc_error(&err.to_string());
    debug!(context, error = %classified, "RPC call failed");
    classified
}

impl AlloyChainClient {
    pub fn new(endpoints: &[ChainEndpoint]) -> Result<Self> {
        let mut chains = HashMap::new();
        for endpoint in endpoints {
            let rpc_url: url::Url = endpoint.rpc_url.parse().map_err(|e| {
                LpFlowError::AddressParsing(format!("Invalid RPC URL {}: {}", endpoint.rpc_url, e))
            })?;
            let provider = ProviderBuilder::new().connect_http(rpc_url).erased();
            let name = endpoint
                .name
                .clone()
                .unwrap_or_else(|| format!("chain-{}", endpoint.chain_id));
            info!(chain_id = endpoint.chain_id, %name, "RPC endpoint configured");
            chains.insert(
                endpoint.chain_id,
                ChainHandle { name, provider },
            );
        }
        Ok(Self { chains })
    }

    pub fn from_config(chains: &ChainsConfig) -> Result<Self> {
        Self::new(&[chains.source.clone(), chains.destination.clone()])
    }

    fn handle(&self, chain: ChainId) -> Result<&ChainHandle> {
        self.chains
            .get(&chain)
            .ok_or_else(|| {
                LpFlowError::ConfigMissing(format!("no RPC endpoint for chain {}", chain))
            })
    }

    fn provider(&self, chain: ChainId) -> Result<DynProvider> {
        Ok(self.handle(chain)?.provider.clone())
    }
}

#[async_trait]
impl ChainClient for AlloyChainClient {
    async fn native_balance(&self, chain: ChainId, owner: Address) -> Result<u128> {
        let balance = self
            .provider(chain)?
            .get_balance(owner)
            .await
            .map_err(|e| rpc_err("get_balance", e))?;
        u256_to_u128(balance)
    }

    async fn token_balance(&self, chain: ChainId, token: Address, owner: Address) -> Result<u128> {
        let erc20 = IERC20::new(token, self.provider(chain)?);
        let balance = erc20
            .balanceOf(owner)
            .call()
            .await
            .map_err(|e| rpc_err("balanceOf", e))?;
        u256_to_u128(balance)
    }

    async fn allowance(
        &self,
        chain: ChainId,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> Result<u128> {
        let erc20 = IERC20::new(token, self.provider(chain)?);
        let allowance = erc20
            .allowance(owner, spender)
            .call()
            .await
            .map_err(|e| rpc_err("allowance", e))?;
        // Unlimited approvals exceed u128
        Ok(u128::try_from(allowance).unwrap_or(u128::MAX))
    }

    async fn token_decimals(&self, chain: ChainId, token: Address) -> Result<u8> {
        let erc20 = IERC20::new(token, self.provider(chain)?);
        erc20
            .decimals()
            .call()
            .await
            .map_err(|e| rpc_err("decimals", e))
    }

    async fn pending_nonce(&self, chain: ChainId, address: Address) -> Result<u64> {
        self.provider(chain)?
            .get_transaction_count(address)
            .pending()
            .await
            .map_err(|e| rpc_err("get_transaction_count", e))
    }

    async fn gas_price(&self, chain: ChainId) -> Result<u128> {
        self.provider(chain)?
            .get_gas_price()
            .await
            .map_err(|e| rpc_err("gas_price", e))
    }

    async fn pool_address(
        &self,
        chain: ChainId,
        factory: Address,
        key: &PoolKey,
    ) -> Result<Option<Address>> {
        let factory = IUniswapV3Factory::new(factory, self.provider(chain)?);
        let fee = alloy::primitives::aliases::U24::try_from(key.fee)
            .map_err(|_| {
                LpFlowError::InvalidParameters(format!("fee tier {} exceeds uint24", key.fee))
            })?;
        let pool = factory
            .getPool(key.token0, key.token1, fee)
            .call()
            .await
            .map_err(|e| rpc_err("getPool", e))?;
        Ok((pool != Address::ZERO).then_some(pool))
    }

    async fn pool_state(&self, chain: ChainId, pool: Address) -> Result<PoolState> {
        let contract = IUniswapV3Pool::new(pool, self.provider(chain)?);
        let slot0 = contract
            .slot0()
            .call()
            .await
            .map_err(|e| rpc_err("slot0", e))?;
        let spacing = contract
            .tickSpacing()
            .call()
            .await
            .map_err(|e| rpc_err("tickSpacing", e))?;

        Ok(PoolState {
            address: pool,
            sqrt_price_x96: U256::from(slot0.sqrtPriceX96),
            tick: slot0.tick.as_i32(),
            tick_spacing: spacing.as_i32(),
        })
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
        let quoter = IQuoterV2::new(quoter, self.provider(chain)?);
        let quote = quoter
            .quoteExactInputSingle(quote_params(token_in, token_out, fee, amount_in)?)
            .call()
            .await
            .map_err(|e| rpc_err("quoteExactInputSingle", e))?;
        u256_to_u128(quote.amountOut)
    }

    async fn owed_fees(
        &self,
        chain: ChainId,
        position_manager: Address,
        token_id: U256,
        owner: Address,
    ) -> Result<(u128, u128)> {
        let npm = INonfungiblePositionManager::new(position_manager, self.provider(chain)?);
        let owed = npm
            .collect(collect_all_params(token_id, owner))
            .from(owner)
            .call()
            .await
            .map_err(|e| rpc_err("collect (static)", e))?;
        Ok((u256_to_u128(owed.amount0)?, u256_to_u128(owed.amount1)?))
    }

    async fn send_transaction(
        &self,
        chain: ChainId,
        wallet: &Wallet,
        nonce: u64,
        tx: &TxRequest,
    ) -> Result<TxHash> {
        let handle = self.handle(chain)?;
        let signer = EthereumWallet::from(wallet.alloy_signer()?);

        let mut request = TransactionRequest::default()
            .with_from(wallet.address())
            .with_to(tx.to)
            .with_input(tx.data.clone())
            .with_value(tx.value)
            .with_nonce(nonce)
            .with_chain_id(chain);

        let gas_limit = match tx.gas_limit {
            Some(limit) => limit,
            None => {
                let estimate = handle
                    .provider
                    .estimate_gas(request.clone())
                    .await
                    .map_err(|e| rpc_err("estimate_gas", e))?;
                estimate.saturating_mul(GAS_LIMIT_HEADROOM_PCT) / 100
            }
        };
        let fees = handle
            .provider
            .estimate_eip1559_fees()
            .await
            .map_err(|e| rpc_err("estimate_eip1559_fees", e))?;
        request.set_gas_limit(gas_limit);
        request.set_max_fee_per_gas(fees.max_fee_per_gas);
        request.set_max_priority_fee_per_gas(fees.max_priority_fee_per_gas);

        // Signed locally so a rebroadcast of the same nonce resolves to the same hash
        let envelope = request
            .build(&signer)
            .await
            .map_err(|e| LpFlowError::Signature(e.to_string()))?;
        let hash = *envelope.tx_hash();

        match handle.provider.send_tx_envelope(envelope).await {
            Ok(_) => {}
            Err(e) if e.to_string().to_ascii_lowercase().contains("already known") => {
                debug!(tx_hash = %hash, "Node already holds this transaction");
            }
            Err(e) => return Err(rpc_err("send_transaction", e)),
        }

        info!(
            chain = %handle.name,
            from = %wallet.address(),
            to = %tx.to,
            nonce,
            gas_limit,
            tx_hash = %hash,
            "Transaction broadcast"
        );
        Ok(hash)
    }

    async fn transaction_receipt(&self, chain: ChainId, hash: TxHash) -> Result<Option<TxReceipt>> {
        let receipt = self
            .provider(chain)?
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| rpc_err("get_transaction_receipt", e))?;

        Ok(receipt.map(|r| TxReceipt {
            tx_hash: r.transaction_hash,
            success: r.status(),
            block_number: r.block_number,
            logs: r.inner.logs().iter().map(|l| l.inner.clone()).collect(),
        }))
    }
}
