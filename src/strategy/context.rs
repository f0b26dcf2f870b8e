//! Services shared by every stage of a wallet pipeline

use alloy::primitives::{Address, TxHash};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::info;

use super::liquidity::LiquidityEngine;
use super::transactor::Transactor;
use crate::adapters::{BridgeClient, ChainClient, ExchangeClient};
use crate::config::AppConfig;
use crate::coordination::{
    CancelToken, EndpointClass, PollSchedule, RetryExecutor, RetryPolicy, Throttle,
};
use crate::domain::{ChainId, ExecutionState, PoolKey, PoolState};
use crate::error::{LpFlowError, Result};
use crate::persistence::StateRepository;
use crate::signing::{WalletDirectory, WalletRecord};

/// Deadline slack for position-manager calls
const DEADLINE_SECS: i64 = 1200;

/// Persistence key of a wallet's execution state
pub fn state_key(address: Address) -> String {
    address.to_string()
}

/// One wallet's pipeline input
#[derive(Debug, Clone)]
pub struct WalletJob {
    pub wallet: Arc<WalletRecord>,
    pub index: u32,
    /// Planned funding in raw source-token units
    pub allocation: u128,
}

impl WalletJob {
    pub fn key(&self) -> String {
        state_key(self.wallet.address)
    }

    pub fn address(&self) -> Address {
        self.wallet.address
    }
}

/// Resolved liquidity pool on the destination chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolContext {
    pub key: PoolKey,
    pub address: Address,
    pub decimals0: u8,
    pub decimals1: u8,
}

pub struct ExecutionContext {
    pub config: Arc<AppConfig>,
    pub chain: Arc<dyn ChainClient>,
    pub bridge: Arc<dyn BridgeClient>,
    pub exchange: Option<Arc<dyn ExchangeClient>>,
    pub wallets: Arc<WalletDirectory>,
    pub retry: Arc<RetryExecutor>,
    pub transactor: Arc<Transactor>,
    pub states: Arc<StateRepository>,
    pub engine: LiquidityEngine,
    pub cancel: CancelToken,
    funder: Option<Arc<WalletRecord>>,
    pool: OnceCell<PoolContext>,
}

impl ExecutionContext {
    pub fn new(
        config: Arc<AppConfig>,
        chain: Arc<dyn ChainClient>,
        bridge: Arc<dyn BridgeClient>,
        exchange: Option<Arc<dyn ExchangeClient>>,
        wallets: Arc<WalletDirectory>,
        states: Arc<StateRepository>,
        cancel: CancelToken,
    ) -> Self {
        let retry = Arc::new(RetryExecutor::new(
            RetryPolicy::from_config(&config.retry),
            Arc::new(Throttle::new(&config.throttle)),
        ));
        let transactor = Arc::new(Transactor::new(
            chain.clone(),
            wallets.clone(),
            retry.clone(),
            config.orchestrator.poll_interval(),
        ));
        let engine = LiquidityEngine::new(config.liquidity.clone());

        Self {
            config,
            chain,
            bridge,
            exchange,
            wallets,
            retry,
            transactor,
            states,
            engine,
            cancel,
            funder: None,
            pool: OnceCell::new(),
        }
    }

    /// Attach the funder key used by the `funder` funding source
    pub fn with_funder(mut self, funder: Arc<WalletRecord>) -> Self {
        self.funder = Some(funder);
        self
    }

    pub fn funder(&self) -> Result<&Arc<WalletRecord>> {
        self.funder
            .as_ref()
            .ok_or_else(|| LpFlowError::ConfigMissing("funder key not loaded".into()))
    }

    pub fn exchange(&self) -> Result<&Arc<dyn ExchangeClient>> {
        self.exchange
            .as_ref()
            .ok_or_else(|| LpFlowError::ConfigMissing("exchange client not configured".into()))
    }

    pub fn dry_run(&self) -> bool {
        self.config.dry_run
    }

    pub fn source_chain(&self) -> ChainId {
        self.config.chains.source.chain_id
    }

    pub fn destination_chain(&self) -> ChainId {
        self.config.chains.destination.chain_id
    }

    pub fn receipt_timeout(&self) -> Duration {
        self.config.orchestrator.receipt_timeout()
    }

    /// Poll at the configured interval for at most `max_wait`
    pub fn schedule(&self, max_wait: Duration) -> PollSchedule {
        PollSchedule::new(self.config.orchestrator.poll_interval(), max_wait)
    }

    /// Unix deadline for position-manager calls
    pub fn deadline(&self) -> u64 {
        (chrono::Utc::now().timestamp() + DEADLINE_SECS).max(0) as u64
    }

    pub async fn load(&self, key: &str) -> Result<ExecutionState> {
        self.states
            .load(key)
            .await?
            .ok_or_else(|| LpFlowError::WalletNotFound(format!("no execution state for {}", key)))
    }

    pub async fn persist<F>(&self, key: &str, f: F) -> Result<ExecutionState>
    where
        F: FnOnce(&mut ExecutionState) -> Result<()> + Send,
    {
        self.states.update(key, f).await
    }

    /// Balance of `token` (native when `None`) under the retry policy
    pub async fn balance(
        &self,
        chain: ChainId,
        token: Option<Address>,
        owner: Address,
    ) -> Result<u128> {
        let client = &self.chain;
        self.retry
            .execute("balance", EndpointClass::Rpc, move || {
                client.balance_of(chain, token, owner)
            })
            .await
    }

    pub async fn decimals(&self, chain: ChainId, token: Option<Address>) -> Result<u8> {
        let Some(token) = token else {
            return Ok(18);
        };
        let client = &self.chain;
        self.retry
            .execute("decimals", EndpointClass::Rpc, move || client.token_decimals(chain, token))
            .await
    }

    /// Source-chain funding token decimals
    pub async fn source_decimals(&self) -> Result<u8> {
        self.decimals(self.source_chain(), self.config.chains.source.token)
            .await
    }

    /// Resolve the configured pool once per process
    pub async fn pool(&self) -> Result<PoolContext> {
        let pool = self
            .pool
            .get_or_try_init(|| async {
                let chain = self.destination_chain();
                let cfg = &self.config.pool;
                let key = PoolKey {
                    token0: cfg.token0,
                    token1: cfg.token1,
                    fee: cfg.fee,
                };
                let client = &self.chain;
                let key_ref = &key;
                let address = self
                    .retry
                    .execute("pool_address", EndpointClass::Rpc, move || {
                        client.pool_address(chain, cfg.factory, key_ref)
                    })
                    .await?
                    .ok_or_else(|| LpFlowError::NoLiquidityPool(key.to_string()))?;
                let decimals0 = self.decimals(chain, Some(key.token0)).await?;
                let decimals1 = self.decimals(chain, Some(key.token1)).await?;
                info!(pool = %address, %key, decimals0, decimals1, "Pool resolved");
                Ok::<_, LpFlowError>(PoolContext {
                    key,
                    address,
                    decimals0,
                    decimals1,
                })
            })
            .await?;
        Ok(*pool)
    }

    pub async fn pool_state(&self, pool: &PoolContext) -> Result<PoolState> {
        let chain = self.destination_chain();
        let client = &self.chain;
        let address = pool.address;
        self.retry
            .execute("pool_state", EndpointClass::Rpc, move || client.pool_state(chain, address))
            .await
    }

    pub async fn gas_price(&self, chain: ChainId) -> Result<u128> {
        let client = &self.chain;
        self.retry
            .execute("gas_price", EndpointClass::Rpc, move || client.gas_price(chain))
            .await
    }

    /// QuoterV2 exact-input quote on the destination chain
    pub async fn quote(
        &self,
        pool: &PoolContext,
        token_in: Address,
        token_out: Address,
        amount_in: u128,
    ) -> Result<u128> {
        let chain = self.destination_chain();
        let client = &self.chain;
        let quoter = self.config.pool.quoter;
        let fee = pool.key.fee;
        self.retry
            .execute("quote_exact_input", EndpointClass::Rpc, move || {
                client.quote_exact_input(chain, quoter, token_in, token_out, fee, amount_in)
            })
            .await
    }

    /// Approve `spender` on the destination chain when needed
    pub async fn approve(
        &self,
        owner: &WalletRecord,
        token: Address,
        spender: Address,
        amount: u128,
    ) -> Result<Option<TxHash>> {
        if amount == 0 {
            return Ok(None);
        }
        self.transactor
            .ensure_allowance(
                self.destination_chain(),
                owner,
                token,
                spender,
                amount,
                self.receipt_timeout(),
                &self.cancel,
            )
            .await
    }
}
