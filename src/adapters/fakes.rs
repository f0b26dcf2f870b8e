//! In-memory chain, bridge and exchange used by unit tests
//!
//! `FakeChain` keeps a token ledger and applies the effects of the calldata
//! the pipeline builds (transfers, approvals, swaps, position manager calls)
//! so end-to-end runs can be asserted on balances and receipts.

use alloy::primitives::{keccak256, Address, Log, TxHash, U256};
use alloy::sol;
use alloy::sol_types::SolCall;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use super::bridge::{BridgeClient, BridgeStatus, Route, RouteRequest, StatusQuery};
use super::chain::ChainClient;
use super::contracts::tests::{collect_log, increase_liquidity_log};
use super::contracts::{INonfungiblePositionManager, ISwapRouter02, IERC20};
use super::exchange::{ExchangeClient, WithdrawRequest, Withdrawal, WithdrawalStatus};
use crate::domain::{from_decimal, ChainId, PoolKey, PoolState, TxReceipt, TxRequest};
use crate::error::{LpFlowError, Result};
use crate::signing::Wallet;

sol! {
    interface IFakeBridgeRouter {
        function startBridge(address token, uint256 amount) external payable;
    }
}

fn narrow(value: U256) -> u128 {
    u128::try_from(value).unwrap_or(u128::MAX)
}

#[derive(Debug, Clone)]
pub struct SentTx {
    pub chain: ChainId,
    pub from: Address,
    pub nonce: u64,
    pub to: Address,
    pub data: Vec<u8>,
    pub value: U256,
    pub hash: TxHash,
}

impl SentTx {
    pub fn selector(&self) -> Option<[u8; 4]> {
        self.data.get(..4).and_then(|s| s.try_into().ok())
    }
}

#[derive(Debug, Clone)]
struct FakePosition {
    chain: ChainId,
    token0: Address,
    token1: Address,
    liquidity: u128,
    amount0: u128,
    amount1: u128,
}

struct Ledger {
    native: HashMap<(ChainId, Address), u128>,
    tokens: HashMap<(ChainId, Address, Address), u128>,
    allowances: HashMap<(ChainId, Address, Address, Address), u128>,
    decimals: HashMap<(ChainId, Address), u8>,
    nonces: HashMap<(ChainId, Address), u64>,
    pools: HashMap<(ChainId, PoolKey), Address>,
    pool_states: HashMap<(ChainId, Address), PoolState>,
    positions: HashMap<U256, FakePosition>,
    owed: HashMap<U256, (u128, u128)>,
    receipts: HashMap<TxHash, TxReceipt>,
    sent: Vec<SentTx>,
    next_token_id: u64,
    gas_price: u128,
    quote_rate: (u128, u128),
    fail_nonce_queries: bool,
    send_failures: VecDeque<LpFlowError>,
    nonce_failures: HashMap<u64, VecDeque<LpFlowError>>,
    /// Sent above a nonce gap; not mined until the gap fills
    queued: HashMap<(ChainId, Address, u64), TxHash>,
    hold_receipts: bool,
}

impl Default for Ledger {
    fn default() -> Self {
        Self {
            native: HashMap::new(),
            tokens: HashMap::new(),
            allowances: HashMap::new(),
            decimals: HashMap::new(),
            nonces: HashMap::new(),
            pools: HashMap::new(),
            pool_states: HashMap::new(),
            positions: HashMap::new(),
            owed: HashMap::new(),
            receipts: HashMap::new(),
            sent: Vec::new(),
            next_token_id: 1,
            gas_price: 1_000_000_000,
            quote_rate: (1, 1),
            fail_nonce_queries: false,
            send_failures: VecDeque::new(),
            nonce_failures: HashMap::new(),
            queued: HashMap::new(),
            hold_receipts: false,
        }
    }
}

impl Ledger {
    fn token(&self, chain: ChainId, token: Address, owner: Address) -> u128 {
        self.tokens.get(&(chain, token, owner)).copied().unwrap_or(0)
    }

    fn credit(&mut self, chain: ChainId, token: Address, owner: Address, amount: u128) {
        *self.tokens.entry((chain, token, owner)).or_insert(0) += amount;
    }

    fn debit(
        &mut self,
        chain: ChainId,
        token: Address,
        owner: Address,
        amount: u128,
    ) -> Result<()> {
        let balance = self.tokens.entry((chain, token, owner)).or_insert(0);
        if *balance < amount {
            return Err(LpFlowError::TransactionReverted(format!(
                "execution reverted: transfer amount exceeds balance ({} < {})",
                balance, amount
            )));
        }
        *balance -= amount;
        Ok(())
    }

    fn debit_native(&mut self, chain: ChainId, owner: Address, amount: u128) -> Result<()> {
        let balance = self.native.entry((chain, owner)).or_insert(0);
        if *balance < amount {
            return Err(LpFlowError::InsufficientFunds(format!(
                "insufficient funds for gas * price + value: have {} want {}",
                balance, amount
            )));
        }
        *balance -= amount;
        Ok(())
    }

    /// Apply the calldata's effects and return the receipt logs
    fn apply(&mut self, chain: ChainId, from: Address, tx: &TxRequest) -> Result<Vec<Log>> {
        let data = tx.data.as_ref();
        let value = narrow(tx.value);

        if data.is_empty() {
            self.debit_native(chain, from, value)?;
            *self.native.entry((chain, tx.to)).or_insert(0) += value;
            return Ok(Vec::new());
        }

        let selector: [u8; 4] = data[..4]
            .try_into()
            .map_err(|_| LpFlowError::InvalidParameters("short calldata".into()))?;
        let bad = |e: alloy::sol_types::Error| LpFlowError::InvalidParameters(e.to_string());

        match selector {
            IERC20::transferCall::SELECTOR => {
                let call = IERC20::transferCall::abi_decode(data).map_err(bad)?;
                let amount = narrow(call.amount);
                self.debit(chain, tx.to, from, amount)?;
                self.credit(chain, tx.to, call.to, amount);
                Ok(Vec::new())
            }
            IERC20::approveCall::SELECTOR => {
                let call = IERC20::approveCall::abi_decode(data).map_err(bad)?;
                self.allowances
                    .insert((chain, tx.to, from, call.spender), narrow(call.amount));
                Ok(Vec::new())
            }
            ISwapRouter02::exactInputSingleCall::SELECTOR => {
                let params = ISwapRouter02::exactInputSingleCall::abi_decode(data)
                    .map_err(bad)?
                    .params;
                let amount_in = narrow(params.amountIn);
                let (num, den) = self.quote_rate;
                let amount_out = amount_in * num / den;
                if amount_out < narrow(params.amountOutMinimum) {
                    return Err(LpFlowError::TransactionReverted(
                        "execution reverted: Too little received".into(),
                    ));
                }
                self.debit(chain, params.tokenIn, from, amount_in)?;
                self.credit(chain, params.tokenOut, params.recipient, amount_out);
                Ok(Vec::new())
            }
            INonfungiblePositionManager::mintCall::SELECTOR => {
                let params = INonfungiblePositionManager::mintCall::abi_decode(data)
                    .map_err(bad)?
                    .params;
                let amount0 =
                    narrow(params.amount0Desired).min(self.token(chain, params.token0, from));
                let amount1 =
                    narrow(params.amount1Desired).min(self.token(chain, params.token1, from));
                self.debit(chain, params.token0, from, amount0)?;
                self.debit(chain, params.token1, from, amount1)?;

                let id = self.next_token_id;
                self.next_token_id += 1;
                let liquidity = amount0 + amount1;
                self.positions.insert(
                    U256::from(id),
                    FakePosition {
                        chain,
                        token0: params.token0,
                        token1: params.token1,
                        liquidity,
                        amount0,
                        amount1,
                    },
                );
                Ok(vec![increase_liquidity_log(tx.to, id, liquidity, amount0, amount1)])
            }
            INonfungiblePositionManager::increaseLiquidityCall::SELECTOR => {
                let params = INonfungiblePositionManager::increaseLiquidityCall::abi_decode(data)
                    .map_err(bad)?
                    .params;
                let mut position = self.position(params.tokenId)?;
                let amount0 =
                    narrow(params.amount0Desired).min(self.token(chain, position.token0, from));
                let amount1 =
                    narrow(params.amount1Desired).min(self.token(chain, position.token1, from));
                self.debit(chain, position.token0, from, amount0)?;
                self.debit(chain, position.token1, from, amount1)?;

                let added = amount0 + amount1;
                position.liquidity += added;
                position.amount0 += amount0;
                position.amount1 += amount1;
                self.positions.insert(params.tokenId, position);
                let id = u64::try_from(params.tokenId).unwrap_or(u64::MAX);
                Ok(vec![increase_liquidity_log(tx.to, id, added, amount0, amount1)])
            }
            INonfungiblePositionManager::decreaseLiquidityCall::SELECTOR => {
                let params = INonfungiblePositionManager::decreaseLiquidityCall::abi_decode(data)
                    .map_err(bad)?
                    .params;
                let mut position = self.position(params.tokenId)?;
                let removed = params.liquidity.min(position.liquidity);
                let (out0, out1) = if position.liquidity == 0 {
                    (0, 0)
                } else {
                    (
                        position.amount0 * removed / position.liquidity,
                        position.amount1 * removed / position.liquidity,
                    )
                };
                position.liquidity -= removed;
                position.amount0 -= out0;
                position.amount1 -= out1;
                self.positions.insert(params.tokenId, position);
                let owed = self.owed.entry(params.tokenId).or_insert((0, 0));
                owed.0 += out0;
                owed.1 += out1;
                Ok(Vec::new())
            }
            INonfungiblePositionManager::collectCall::SELECTOR => {
                let params = INonfungiblePositionManager::collectCall::abi_decode(data)
                    .map_err(bad)?
                    .params;
                let position = self.position(params.tokenId)?;
                let (owed0, owed1) = self.owed.remove(&params.tokenId).unwrap_or((0, 0));
                self.credit(position.chain, position.token0, params.recipient, owed0);
                self.credit(position.chain, position.token1, params.recipient, owed1);
                let id = u64::try_from(params.tokenId).unwrap_or(u64::MAX);
                Ok(vec![collect_log(tx.to, id, owed0, owed1)])
            }
            IFakeBridgeRouter::startBridgeCall::SELECTOR => {
                let call = IFakeBridgeRouter::startBridgeCall::abi_decode(data).map_err(bad)?;
                if call.token == Address::ZERO {
                    self.debit_native(chain, from, value)?;
                } else {
                    self.debit(chain, call.token, from, narrow(call.amount))?;
                }
                Ok(Vec::new())
            }
            _ => Ok(Vec::new()),
        }
    }

    fn position(&self, token_id: U256) -> Result<FakePosition> {
        self.positions.get(&token_id).cloned().ok_or_else(|| {
            LpFlowError::TransactionReverted(format!(
                "execution reverted: Invalid token ID {}",
                token_id
            ))
        })
    }
}

#[derive(Default)]
pub struct FakeChain {
    ledger: Mutex<Ledger>,
}

impl FakeChain {
    pub fn new() -> Self {
        Self::default()
    }

    fn ledger(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap()
    }

    pub fn set_native_balance(&self, chain: ChainId, owner: Address, amount: u128) {
        self.ledger().native.insert((chain, owner), amount);
    }

    pub fn set_token_balance(&self, chain: ChainId, token: Address, owner: Address, amount: u128) {
        self.ledger().tokens.insert((chain, token, owner), amount);
    }

    pub fn credit_token(&self, chain: ChainId, token: Address, owner: Address, amount: u128) {
        self.ledger().credit(chain, token, owner, amount);
    }

    pub fn token_balance_of(&self, chain: ChainId, token: Address, owner: Address) -> u128 {
        self.ledger().token(chain, token, owner)
    }

    pub fn native_balance_of(&self, chain: ChainId, owner: Address) -> u128 {
        self.ledger().native.get(&(chain, owner)).copied().unwrap_or(0)
    }

    pub fn set_decimals(&self, chain: ChainId, token: Address, decimals: u8) {
        self.ledger().decimals.insert((chain, token), decimals);
    }

    pub fn set_pending_nonce(&self, chain: ChainId, address: Address, nonce: u64) {
        self.ledger().nonces.insert((chain, address), nonce);
    }

    pub fn fail_nonce_queries(&self, fail: bool) {
        self.ledger().fail_nonce_queries = fail;
    }

    pub fn set_quote_rate(&self, numerator: u128, denominator: u128) {
        self.ledger().quote_rate = (numerator, denominator.max(1));
    }

    pub fn add_pool(&self, chain: ChainId, key: PoolKey, state: PoolState) {
        let mut ledger = self.ledger();
        ledger.pools.insert((chain, key), state.address);
        ledger.pool_states.insert((chain, state.address), state);
    }

    pub fn set_pool_state(&self, chain: ChainId, state: PoolState) {
        self.ledger().pool_states.insert((chain, state.address), state);
    }

    /// Accrue fees on a position as swaps through the pool would
    pub fn accrue_fees(&self, token_id: U256, amount0: u128, amount1: u128) {
        let mut ledger = self.ledger();
        let owed = ledger.owed.entry(token_id).or_insert((0, 0));
        owed.0 += amount0;
        owed.1 += amount1;
    }

    pub fn position_liquidity(&self, token_id: U256) -> Option<u128> {
        self.ledger().positions.get(&token_id).map(|p| p.liquidity)
    }

    /// Queue an error for the next broadcast
    pub fn fail_next_send(&self, err: LpFlowError) {
        self.ledger().send_failures.push_back(err);
    }

    /// Queue errors for broadcasts that carry `nonce`, one per attempt
    pub fn fail_sends_with_nonce(&self, nonce: u64, errors: Vec<LpFlowError>) {
        self.ledger()
            .nonce_failures
            .entry(nonce)
            .or_default()
            .extend(errors);
    }

    /// While held, receipts are reported as not yet mined
    pub fn hold_receipts(&self, hold: bool) {
        self.ledger().hold_receipts = hold;
    }

    pub fn sent(&self) -> Vec<SentTx> {
        self.ledger().sent.clone()
    }

    pub fn sent_with_selector(&self, selector: [u8; 4]) -> usize {
        self.ledger()
            .sent
            .iter()
            .filter(|tx| tx.selector() == Some(selector))
            .count()
    }

    pub fn sent_tx(&self, hash: TxHash) -> Option<SentTx> {
        self.ledger().sent.iter().find(|tx| tx.hash == hash).cloned()
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    async fn native_balance(&self, chain: ChainId, owner: Address) -> Result<u128> {
        Ok(self.native_balance_of(chain, owner))
    }

    async fn token_balance(&self, chain: ChainId, token: Address, owner: Address) -> Result<u128> {
        Ok(self.token_balance_of(chain, token, owner))
    }

    async fn allowance(
        &self,
        chain: ChainId,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> Result<u128> {
        Ok(self
            .ledger()
            .allowances
            .get(&(chain, token, owner, spender))
            .copied()
            .unwrap_or(0))
    }

    async fn token_decimals(&self, chain: ChainId, token: Address) -> Result<u8> {
        Ok(self.ledger().decimals.get(&(chain, token)).copied().unwrap_or(18))
    }

    async fn pending_nonce(&self, chain: ChainId, address: Address) -> Result<u64> {
        let ledger = self.ledger();
        if ledger.fail_nonce_queries {
            return Err(LpFlowError::Network("connection refused".into()));
        }
        Ok(ledger.nonces.get(&(chain, address)).copied().unwrap_or(0))
    }

    async fn gas_price(&self, _chain: ChainId) -> Result<u128> {
        Ok(self.ledger().gas_price)
    }

    async fn pool_address(
        &self,
        chain: ChainId,
        _factory: Address,
        key: &PoolKey,
    ) -> Result<Option<Address>> {
        Ok(self.ledger().pools.get(&(chain, *key)).copied())
    }

    async fn pool_state(&self, chain: ChainId, pool: Address) -> Result<PoolState> {
        self.ledger()
            .pool_states
            .get(&(chain, pool))
            .copied()
            .ok_or_else(|| LpFlowError::NoLiquidityPool(pool.to_string()))
    }

    async fn quote_exact_input(
        &self,
        _chain: ChainId,
        _quoter: Address,
        _token_in: Address,
        _token_out: Address,
        _fee: u32,
        amount_in: u128,
    ) -> Result<u128> {
        let (num, den) = self.ledger().quote_rate;
        Ok(amount_in * num / den)
    }

    async fn owed_fees(
        &self,
        _chain: ChainId,
        _position_manager: Address,
        token_id: U256,
        _owner: Address,
    ) -> Result<(u128, u128)> {
        Ok(self.ledger().owed.get(&token_id).copied().unwrap_or((0, 0)))
    }

    async fn send_transaction(
        &self,
        chain: ChainId,
        wallet: &Wallet,
        nonce: u64,
        tx: &TxRequest,
    ) -> Result<TxHash> {
        let from = wallet.address();
        let mut ledger = self.ledger();

        if let Some(err) = ledger.send_failures.pop_front() {
            return Err(err);
        }
        if let Some(err) = ledger
            .nonce_failures
            .get_mut(&nonce)
            .and_then(|errors| errors.pop_front())
        {
            return Err(err);
        }
        let pending = ledger.nonces.get(&(chain, from)).copied().unwrap_or(0);
        if nonce < pending {
            return Err(LpFlowError::NonceTooLow(format!(
                "nonce too low: next nonce {}, tx nonce {}",
                pending, nonce
            )));
        }

        let logs = ledger.apply(chain, from, tx)?;

        let mut preimage = Vec::with_capacity(36);
        preimage.extend_from_slice(&chain.to_be_bytes());
        preimage.extend_from_slice(from.as_slice());
        preimage.extend_from_slice(&nonce.to_be_bytes());
        let hash = keccak256(&preimage);

        let block_number = ledger.sent.len() as u64 + 1;
        if nonce > pending {
            ledger.queued.insert((chain, from, nonce), hash);
        } else {
            let mut next = nonce + 1;
            while ledger.queued.remove(&(chain, from, next)).is_some() {
                next += 1;
            }
            ledger.nonces.insert((chain, from), next);
        }
        ledger.receipts.insert(
            hash,
            TxReceipt {
                tx_hash: hash,
                success: true,
                block_number: Some(block_number),
                logs,
            },
        );
        ledger.sent.push(SentTx {
            chain,
            from,
            nonce,
            to: tx.to,
            data: tx.data.to_vec(),
            value: tx.value,
            hash,
        });
        Ok(hash)
    }

    async fn transaction_receipt(
        &self,
        _chain: ChainId,
        hash: TxHash,
    ) -> Result<Option<TxReceipt>> {
        let ledger = self.ledger();
        if ledger.hold_receipts || ledger.queued.values().any(|queued| *queued == hash) {
            return Ok(None);
        }
        Ok(ledger.receipts.get(&hash).cloned())
    }
}

/// Bridge that delivers on the destination chain after a number of status polls
pub struct FakeBridge {
    chain: Arc<FakeChain>,
    router: Address,
    state: Mutex<FakeBridgeState>,
}

struct FakeBridgeState {
    quotes: Vec<RouteRequest>,
    fee_bps: u128,
    complete_after: Option<u32>,
    polls: HashMap<TxHash, u32>,
    delivered: HashSet<TxHash>,
    no_route: bool,
}

impl FakeBridge {
    pub fn new(chain: Arc<FakeChain>) -> Self {
        Self {
            chain,
            router: Address::repeat_byte(0xb1),
            state: Mutex::new(FakeBridgeState {
                quotes: Vec::new(),
                fee_bps: 0,
                complete_after: Some(1),
                polls: HashMap::new(),
                delivered: HashSet::new(),
                no_route: false,
            }),
        }
    }

    pub fn router(&self) -> Address {
        self.router
    }

    /// `None` leaves every transfer pending forever
    pub fn complete_after(&self, polls: Option<u32>) {
        self.state.lock().unwrap().complete_after = polls;
    }

    pub fn set_fee_bps(&self, bps: u128) {
        self.state.lock().unwrap().fee_bps = bps;
    }

    pub fn fail_routes(&self, fail: bool) {
        self.state.lock().unwrap().no_route = fail;
    }

    pub fn quote_count(&self) -> usize {
        self.state.lock().unwrap().quotes.len()
    }

    fn to_amount(&self, from_amount: u128) -> u128 {
        let fee_bps = self.state.lock().unwrap().fee_bps;
        from_amount * (10_000 - fee_bps) / 10_000
    }
}

#[async_trait]
impl BridgeClient for FakeBridge {
    async fn quote(&self, request: &RouteRequest) -> Result<Route> {
        if self.state.lock().unwrap().no_route {
            return Err(LpFlowError::RouteNotFound("No available quotes".into()));
        }
        let to_amount = self.to_amount(request.from_amount);
        self.state.lock().unwrap().quotes.push(request.clone());

        let native = request.from_token == Address::ZERO;
        let call = IFakeBridgeRouter::startBridgeCall {
            token: request.from_token,
            amount: U256::from(request.from_amount),
        };
        let mut transaction = TxRequest::call(self.router, call.abi_encode());
        if native {
            transaction = transaction.with_value(U256::from(request.from_amount));
        }

        Ok(Route {
            tool: "fakebridge".into(),
            from_amount: request.from_amount,
            to_amount,
            to_amount_min: to_amount * 99 / 100,
            approval_address: (!native).then_some(self.router),
            transaction,
        })
    }

    async fn status(&self, query: &StatusQuery) -> Result<BridgeStatus> {
        let Some(sent) = self.chain.sent_tx(query.tx_hash) else {
            return Ok(BridgeStatus::NotFound);
        };

        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let Some(request) = state
            .quotes
            .iter()
            .rev()
            .find(|q| q.from_address == sent.from)
            .cloned()
        else {
            return Ok(BridgeStatus::NotFound);
        };

        let polls = state.polls.entry(query.tx_hash).or_insert(0);
        *polls += 1;
        let ready = matches!(state.complete_after, Some(n) if *polls >= n);
        if !ready {
            return Ok(BridgeStatus::Pending {
                substatus: Some("WAIT_DESTINATION_TRANSACTION".into()),
            });
        }

        let to_amount = request.from_amount * (10_000 - state.fee_bps) / 10_000;
        if state.delivered.insert(query.tx_hash) {
            self.chain
                .credit_token(request.to_chain, request.to_token, request.to_address, to_amount);
        }
        Ok(BridgeStatus::Done {
            receiving_tx: Some(format!("{}", query.tx_hash)),
            amount: Some(to_amount),
        })
    }
}

/// Exchange whose withdrawals land on the fake chain once completed
pub struct FakeExchange {
    chain: Arc<FakeChain>,
    chain_id: ChainId,
    token: Option<Address>,
    decimals: u8,
    state: Mutex<FakeExchangeState>,
}

struct FakeExchangeState {
    balance: Decimal,
    withdrawals: HashMap<String, (Withdrawal, Address, u32)>,
    complete_after: u32,
    withdraw_calls: u32,
}

impl FakeExchange {
    pub fn new(
        chain: Arc<FakeChain>,
        chain_id: ChainId,
        token: Option<Address>,
        decimals: u8,
    ) -> Self {
        Self {
            chain,
            chain_id,
            token,
            decimals,
            state: Mutex::new(FakeExchangeState {
                balance: Decimal::ZERO,
                withdrawals: HashMap::new(),
                complete_after: 1,
                withdraw_calls: 0,
            }),
        }
    }

    pub fn set_balance(&self, balance: Decimal) {
        self.state.lock().unwrap().balance = balance;
    }

    pub fn withdraw_calls(&self) -> u32 {
        self.state.lock().unwrap().withdraw_calls
    }
}

#[async_trait]
impl ExchangeClient for FakeExchange {
    async fn balance(&self, _asset: &str) -> Result<Decimal> {
        Ok(self.state.lock().unwrap().balance)
    }

    async fn withdraw(&self, request: &WithdrawRequest) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.withdraw_calls += 1;
        if request.amount > state.balance {
            return Err(LpFlowError::InsufficientFunds(format!(
                "balance {} below withdrawal {}",
                state.balance, request.amount
            )));
        }
        state.balance -= request.amount;

        let id = format!("wd-{}", state.withdraw_calls);
        let withdrawal = Withdrawal {
            id: id.clone(),
            client_id: Some(request.client_id.clone()),
            amount: request.amount,
            status: WithdrawalStatus::Pending { code: 4 },
        };
        state
            .withdrawals
            .insert(request.client_id.clone(), (withdrawal, request.address, 0));
        Ok(id)
    }

    async fn withdrawal(&self, client_id: &str) -> Result<Option<Withdrawal>> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let complete_after = state.complete_after;
        let Some((withdrawal, address, polls)) = state.withdrawals.get_mut(client_id) else {
            return Ok(None);
        };

        *polls += 1;
        if *polls >= complete_after && !withdrawal.status.is_terminal() {
            withdrawal.status = WithdrawalStatus::Completed {
                tx_hash: Some(format!("0x{}", "ab".repeat(32))),
            };
            let raw = from_decimal(withdrawal.amount, self.decimals)?;
            match self.token {
                Some(token) => self.chain.credit_token(self.chain_id, token, *address, raw),
                None => {
                    let current = self.chain.native_balance_of(self.chain_id, *address);
                    self.chain.set_native_balance(self.chain_id, *address, current + raw);
                }
            }
        }
        Ok(Some(withdrawal.clone()))
    }
}
