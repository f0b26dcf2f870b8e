//! Contract bindings and calldata builders
//!
//! Calldata is encoded here so that every mutating call goes through
//! [`ChainClient::send_transaction`](super::ChainClient::send_transaction)
//! with an explicit nonce.

use alloy::primitives::aliases::{I24, U160, U24};
use alloy::primitives::{Address, Log, U256};
use alloy::sol;
use alloy::sol_types::{SolCall, SolEvent};

use crate::domain::{PoolKey, TxRequest};
use crate::error::{LpFlowError, Result};

sol! {
    #[allow(missing_docs)]
    #[sol(rpc)]
    interface IERC20 {
        function balanceOf(address owner) external view returns (uint256);
        function allowance(address owner, address spender) external view returns (uint256);
        function decimals() external view returns (uint8);
        function approve(address spender, uint256 amount) external returns (bool);
        function transfer(address to, uint256 amount) external returns (bool);
    }

    #[allow(missing_docs)]
    #[sol(rpc)]
    interface IUniswapV3Factory {
        function getPool(address tokenA, address tokenB, uint24 fee)
            external view returns (address pool);
    }

    #[allow(missing_docs)]
    #[sol(rpc)]
    interface IUniswapV3Pool {
        function slot0() external view returns (
            uint160 sqrtPriceX96,
            int24 tick,
            uint16 observationIndex,
            uint16 observationCardinality,
            uint16 observationCardinalityNext,
            uint8 feeProtocol,
            bool unlocked
        );
        function tickSpacing() external view returns (int24);
        function liquidity() external view returns (uint128);
    }

    #[allow(missing_docs)]
    #[sol(rpc)]
    interface IQuoterV2 {
        struct QuoteExactInputSingleParams {
            address tokenIn;
            address tokenOut;
            uint256 amountIn;
            uint24 fee;
            uint160 sqrtPriceLimitX96;
        }

        function quoteExactInputSingle(QuoteExactInputSingleParams memory params) external returns (
            uint256 amountOut,
            uint160 sqrtPriceX96After,
            uint32 initializedTicksCrossed,
            uint256 gasEstimate
        );
    }

    #[allow(missing_docs)]
    interface ISwapRouter02 {
        struct ExactInputSingleParams {
            address tokenIn;
            address tokenOut;
            uint24 fee;
            address recipient;
            uint256 amountIn;
            uint256 amountOutMinimum;
            uint160 sqrtPriceLimitX96;
        }

        function exactInputSingle(ExactInputSingleParams calldata params)
            external payable returns (uint256 amountOut);
    }

    #[allow(missing_docs)]
    #[sol(rpc)]
    interface INonfungiblePositionManager {
        struct MintParams {
            address token0;
            address token1;
            uint24 fee;
            int24 tickLower;
            int24 tickUpper;
            uint256 amount0Desired;
            uint256 amount1Desired;
            uint256 amount0Min;
            uint256 amount1Min;
            address recipient;
            uint256 deadline;
        }

        struct IncreaseLiquidityParams {
            uint256 tokenId;
            uint256 amount0Desired;
            uint256 amount1Desired;
            uint256 amount0Min;
            uint256 amount1Min;
            uint256 deadline;
        }

        struct DecreaseLiquidityParams {
            uint256 tokenId;
            uint128 liquidity;
            uint256 amount0Min;
            uint256 amount1Min;
            uint256 deadline;
        }

        struct CollectParams {
            uint256 tokenId;
            address recipient;
            uint128 amount0Max;
            uint128 amount1Max;
        }

        event IncreaseLiquidity(
            uint256 indexed tokenId,
            uint128 liquidity,
            uint256 amount0,
            uint256 amount1
        );
        event DecreaseLiquidity(
            uint256 indexed tokenId,
            uint128 liquidity,
            uint256 amount0,
            uint256 amount1
        );
        event Collect(uint256 indexed tokenId, address recipient, uint256 amount0, uint256 amount1);

        function mint(MintParams calldata params) external payable returns (
            uint256 tokenId,
            uint128 liquidity,
            uint256 amount0,
            uint256 amount1
        );
        function increaseLiquidity(IncreaseLiquidityParams calldata params)
            external payable returns (
            uint128 liquidity,
            uint256 amount0,
            uint256 amount1
        );
        function decreaseLiquidity(DecreaseLiquidityParams calldata params)
            external payable returns (
            uint256 amount0,
            uint256 amount1
        );
        function collect(CollectParams calldata params)
            external payable returns (uint256 amount0, uint256 amount1);
    }
}

pub use INonfungiblePositionManager::{
    CollectParams, DecreaseLiquidityParams, IncreaseLiquidityParams, MintParams,
};

fn fee_tier(fee: u32) -> Result<U24> {
    U24::try_from(fee)
        .map_err(|_| LpFlowError::InvalidParameters(format!("fee tier {} exceeds uint24", fee)))
}

fn tick(value: i32) -> Result<I24> {
    I24::try_from(value)
        .map_err(|_| LpFlowError::InvalidParameters(format!("tick {} exceeds int24", value)))
}

pub fn erc20_approve(token: Address, spender: Address, amount: U256) -> TxRequest {
    TxRequest::call(token, IERC20::approveCall { spender, amount }.abi_encode())
}

pub fn erc20_transfer(token: Address, to: Address, amount: u128) -> TxRequest {
    TxRequest::call(
        token,
        IERC20::transferCall {
            to,
            amount: U256::from(amount),
        }
        .abi_encode(),
    )
}

/// Single-hop exact-input swap through SwapRouter02
pub fn exact_input_single(
    router: Address,
    token_in: Address,
    token_out: Address,
    fee: u32,
    recipient: Address,
    amount_in: u128,
    amount_out_minimum: u128,
) -> Result<TxRequest> {
    let params = ISwapRouter02::ExactInputSingleParams {
        tokenIn: token_in,
        tokenOut: token_out,
        fee: fee_tier(fee)?,
        recipient,
        amountIn: U256::from(amount_in),
        amountOutMinimum: U256::from(amount_out_minimum),
        sqrtPriceLimitX96: U160::ZERO,
    };
    Ok(TxRequest::call(
        router,
        ISwapRouter02::exactInputSingleCall { params }.abi_encode(),
    ))
}

pub fn quote_params(
    token_in: Address,
    token_out: Address,
    fee: u32,
    amount_in: u128,
) -> Result<IQuoterV2::QuoteExactInputSingleParams> {
    Ok(IQuoterV2::QuoteExactInputSingleParams {
        tokenIn: token_in,
        tokenOut: token_out,
        amountIn: U256::from(amount_in),
        fee: fee_tier(fee)?,
        sqrtPriceLimitX96: U160::ZERO,
    })
}

/// Amounts for a mint; minimums are slippage-adjusted by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MintAmounts {
    pub amount0_desired: u128,
    pub amount1_desired: u128,
    pub amount0_min: u128,
    pub amount1_min: u128,
}

pub fn mint(
    position_manager: Address,
    key: &PoolKey,
    tick_lower: i32,
    tick_upper: i32,
    amounts: MintAmounts,
    recipient: Address,
    deadline: u64,
) -> Result<TxRequest> {
    let params = MintParams {
        token0: key.token0,
        token1: key.token1,
        fee: fee_tier(key.fee)?,
        tickLower: tick(tick_lower)?,
        tickUpper: tick(tick_upper)?,
        amount0Desired: U256::from(amounts.amount0_desired),
        amount1Desired: U256::from(amounts.amount1_desired),
        amount0Min: U256::from(amounts.amount0_min),
        amount1Min: U256::from(amounts.amount1_min),
        recipient,
        deadline: U256::from(deadline),
    };
    Ok(TxRequest::call(
        position_manager,
        INonfungiblePositionManager::mintCall { params }.abi_encode(),
    ))
}

pub fn increase_liquidity(
    position_manager: Address,
    token_id: U256,
    amount0: u128,
    amount1: u128,
    deadline: u64,
) -> TxRequest {
    let params = IncreaseLiquidityParams {
        tokenId: token_id,
        amount0Desired: U256::from(amount0),
        amount1Desired: U256::from(amount1),
        amount0Min: U256::ZERO,
        amount1Min: U256::ZERO,
        deadline: U256::from(deadline),
    };
    TxRequest::call(
        position_manager,
        INonfungiblePositionManager::increaseLiquidityCall { params }.abi_encode(),
    )
}

pub fn decrease_liquidity(
    position_manager: Address,
    token_id: U256,
    liquidity: u128,
    deadline: u64,
) -> TxRequest {
    let params = DecreaseLiquidityParams {
        tokenId: token_id,
        liquidity,
        amount0Min: U256::ZERO,
        amount1Min: U256::ZERO,
        deadline: U256::from(deadline),
    };
    TxRequest::call(
        position_manager,
        INonfungiblePositionManager::decreaseLiquidityCall { params }.abi_encode(),
    )
}

/// Params that sweep everything owed to `recipient`
pub fn collect_all_params(token_id: U256, recipient: Address) -> CollectParams {
    CollectParams {
        tokenId: token_id,
        recipient,
        amount0Max: u128::MAX,
        amount1Max: u128::MAX,
    }
}

pub fn collect(position_manager: Address, token_id: U256, recipient: Address) -> TxRequest {
    TxRequest::call(
        position_manager,
        INonfungiblePositionManager::collectCall {
            params: collect_all_params(token_id, recipient),
        }
        .abi_encode(),
    )
}

/// Liquidity added by a mint or increase, decoded from the receipt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiquidityAdded {
    pub token_id: U256,
    pub liquidity: u128,
    pub amount0: u128,
    pub amount1: u128,
}

/// Amounts swept by a `collect`, decoded from the receipt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Collected {
    pub token_id: U256,
    pub amount0: u128,
    pub amount1: u128,
}

fn narrow(value: U256, what: &str) -> Result<u128> {
    u128::try_from(value)
        .map_err(|_| LpFlowError::Internal(format!("{} {} exceeds u128", what, value)))
}

/// First `IncreaseLiquidity` emitted by `emitter` in `logs`
pub fn decode_increase_liquidity(logs: &[Log], emitter: Address) -> Result<Option<LiquidityAdded>> {
    for log in logs.iter().filter(|l| l.address == emitter) {
        let expected = INonfungiblePositionManager::IncreaseLiquidity::SIGNATURE_HASH;
        if log.topics().first() != Some(&expected) {
            continue;
        }
        let event = INonfungiblePositionManager::IncreaseLiquidity::decode_log_data(&log.data)
            .map_err(|e| LpFlowError::Internal(format!("bad IncreaseLiquidity log: {}", e)))?;
        return Ok(Some(LiquidityAdded {
            token_id: event.tokenId,
            liquidity: event.liquidity,
            amount0: narrow(event.amount0, "amount0")?,
            amount1: narrow(event.amount1, "amount1")?,
        }));
    }
    Ok(None)
}

/// First `Collect` emitted by `emitter` in `logs`
pub fn decode_collect(logs: &[Log], emitter: Address) -> Result<Option<Collected>> {
    for log in logs.iter().filter(|l| l.address == emitter) {
        if log.topics().first() != Some(&INonfungiblePositionManager::Collect::SIGNATURE_HASH) {
            continue;
        }
        let event = INonfungiblePositionManager::Collect::decode_log_data(&log.data)
            .map_err(|e| LpFlowError::Internal(format!("bad Collect log: {}", e)))?;
        return Ok(Some(Collected {
            token_id: event.tokenId,
            amount0: narrow(event.amount0, "amount0")?,
            amount1: narrow(event.amount1, "amount1")?,
        }));
    }
    Ok(None)
}
