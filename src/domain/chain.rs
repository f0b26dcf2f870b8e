use alloy::primitives::{Address, Bytes, Log, TxHash, U256};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{LpFlowError, Result};

pub type ChainId = u64;

/// Unsigned transaction payload; the transactor fills nonce and signs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRequest {
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    pub gas_limit: Option<u64>,
}

impl TxRequest {
    pub fn call(to: Address, data: impl Into<Bytes>) -> Self {
        Self {
            to,
            data: data.into(),
            value: U256::ZERO,
            gas_limit: None,
        }
    }

    pub fn native_transfer(to: Address, amount: u128) -> Self {
        Self {
            to,
            data: Bytes::new(),
            value: U256::from(amount),
            gas_limit: Some(21_000),
        }
    }

    pub fn with_value(mut self, value: U256) -> Self {
        self.value = value;
        self
    }

    pub fn with_gas_limit(mut self, gas_limit: Option<u64>) -> Self {
        self.gas_limit = gas_limit;
        self
    }
}

/// Mined transaction summary
#[derive(Debug, Clone)]
pub struct TxReceipt {
    pub tx_hash: TxHash,
    pub success: bool,
    pub block_number: Option<u64>,
    pub logs: Vec<Log>,
}

/// Token pair plus fee tier identifying a concentrated-liquidity pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolKey {
    pub token0: Address,
    pub token1: Address,
    pub fee: u32,
}

impl PoolKey {
    pub fn contains(&self, token: Address) -> bool {
        self.token0 == token || self.token1 == token
    }

    /// The pool token that is not `token`
    pub fn other(&self, token: Address) -> Option<Address> {
        if token == self.token0 {
            Some(self.token1)
        } else if token == self.token1 {
            Some(self.token0)
        } else {
            None
        }
    }
}

impl std::fmt::Display for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}@{}", self.token0, self.token1, self.fee)
    }
}

/// Live pool state read from `slot0`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolState {
    pub address: Address,
    pub sqrt_price_x96: U256,
    pub tick: i32,
    pub tick_spacing: i32,
}

/// Convert a raw integer amount to decimal units
pub fn to_decimal(raw: u128, decimals: u8) -> Decimal {
    // Decimal holds 96 bits of mantissa; clamp absurd values instead of panicking
    let mantissa = i128::try_from(raw).unwrap_or(i128::MAX);
    Decimal::try_from_i128_with_scale(mantissa, decimals as u32).unwrap_or_else(|_| {
        Decimal::from_f64_retain(raw as f64 / 10f64.powi(decimals as i32)).unwrap_or(Decimal::MAX)
    })
}

/// Convert a decimal amount to raw integer units, truncating extra precision
pub fn from_decimal(amount: Decimal, decimals: u8) -> Result<u128> {
    if amount.is_sign_negative() {
        return Err(LpFlowError::InvalidParameters(format!(
            "negative amount {}",
            amount
        )));
    }
    let scaled = amount
        .checked_mul(Decimal::from(10u64.pow(decimals.min(19) as u32)))
        .ok_or_else(|| LpFlowError::InvalidParameters(format!("amount {} overflows", amount)))?;
    let mut raw = scaled
        .trunc()
        .to_u128()
        .ok_or_else(|| LpFlowError::InvalidParameters(format!("amount {} overflows", amount)))?;
    if decimals > 19 {
        raw = raw
            .checked_mul(10u128.pow((decimals - 19) as u32))
            .ok_or_else(|| LpFlowError::InvalidParameters(format!("amount {} overflows", amount)))?;
    }
    Ok(raw)
}

/// Narrow an on-chain U256 into the u128 amount domain
pub fn u256_to_u128(value: U256) -> Result<u128> {
    u128::try_from(value)
        .map_err(|_| LpFlowError::InvalidParameters(format!("value {} exceeds u128", value)))
}
