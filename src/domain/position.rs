use alloy::primitives::{Address, U256};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::chain::PoolKey;

/// Open concentrated-liquidity position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub pool: PoolKey,
    pub pool_address: Address,
    /// NFT id from the position manager; `None` for dry-run positions
    #[serde(default)]
    pub token_id: Option<U256>,
    pub tick_lower: i32,
    pub tick_upper: i32,
    pub liquidity: u128,
    pub amount0: u128,
    pub amount1: u128,
    /// Price (token1 per token0) at the last open or rebalance
    pub rebalance_price: Decimal,
    /// Price seen on the most recent evaluation
    pub last_observed_price: Decimal,
    pub opened_at: DateTime<Utc>,
    #[serde(default)]
    pub last_harvest_at: Option<DateTime<Utc>>,
}

impl Position {
    pub fn in_range(&self, tick: i32) -> bool {
        self.tick_lower <= tick && tick < self.tick_upper
    }
}

/// Owed fees valued in the pool's quote token (token1)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeSnapshot {
    pub owed0: u128,
    pub owed1: u128,
    pub value0: Decimal,
    pub value1: Decimal,
    /// Current price (token1 per token0, decimal-adjusted)
    pub price: Decimal,
    pub taken_at: DateTime<Utc>,
}

impl FeeSnapshot {
    pub fn total_value(&self) -> Decimal {
        self.value0 + self.value1
    }

    pub fn is_empty(&self) -> bool {
        self.owed0 == 0 && self.owed1 == 0
    }
}

/// Split of harvested fees into reinvest and cash-out legs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestBreakdown {
    pub total_value: Decimal,
    pub reinvest_value: Decimal,
    pub cash_out_value: Decimal,
    pub reinvest0: u128,
    pub reinvest1: u128,
    pub cash_out0: u128,
    pub cash_out1: u128,
}

impl HarvestBreakdown {
    pub fn empty() -> Self {
        Self {
            total_value: Decimal::ZERO,
            reinvest_value: Decimal::ZERO,
            cash_out_value: Decimal::ZERO,
            reinvest0: 0,
            reinvest1: 0,
            cash_out0: 0,
            cash_out1: 0,
        }
    }

    pub fn has_reinvest(&self) -> bool {
        self.reinvest0 > 0 || self.reinvest1 > 0
    }

    pub fn has_cash_out(&self) -> bool {
        self.cash_out0 > 0 || self.cash_out1 > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebalanceTrigger {
    /// Accrued fees are worth more than the gas to harvest them
    FeesCoverGas,
    /// Price left the band around the reference price
    PriceDeviation,
}

/// Outcome of a rebalance evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceDecision {
    pub should_rebalance: bool,
    pub triggers: Vec<RebalanceTrigger>,
    pub fee_value: Decimal,
    pub gas_threshold: Decimal,
    /// Percent move from the reference price
    pub price_deviation_pct: Decimal,
}

impl RebalanceDecision {
    pub fn triggered_by(&self, trigger: RebalanceTrigger) -> bool {
        self.triggers.contains(&trigger)
    }

    /// Price moves take precedence: the range itself is stale
    pub fn requires_new_range(&self) -> bool {
        self.triggered_by(RebalanceTrigger::PriceDeviation)
    }
}
