//! Concentrated-liquidity math
//!
//! Pure functions over pool state: tick ranges, deposit ratios, fee valuation,
//! harvest splits and the rebalance decision. Prices are token1 per token0,
//! decimal-adjusted, unless a name says `raw`.

use alloy::primitives::U256;
use chrono::Utc;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

use crate::config::LiquidityConfig;
use crate::domain::{
    to_decimal, FeeSnapshot, HarvestBreakdown, Position, RebalanceDecision, RebalanceTrigger,
};
use crate::error::{LpFlowError, Result};

pub const MIN_TICK: i32 = -887_272;
pub const MAX_TICK: i32 = 887_272;

const Q96: f64 = 79_228_162_514_264_337_593_543_950_336.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickRange {
    pub lower: i32,
    pub upper: i32,
}

impl TickRange {
    pub fn contains(&self, tick: i32) -> bool {
        self.lower <= tick && tick <= self.upper
    }
}

/// One swap leg needed to reach a target ratio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapLeg {
    /// token0 in, token1 out
    pub zero_for_one: bool,
    pub amount_in: u128,
}

/// Spacing-aligned range covering at least `range_pct` either side of the
/// current price, clamped to the usable ticks for `tick_spacing`
pub fn calculate_tick_range(
    current_tick: i32,
    tick_spacing: i32,
    range_pct: f64,
) -> Result<TickRange> {
    if tick_spacing <= 0 {
        return Err(LpFlowError::InvalidParameters(format!(
            "tick spacing must be positive, got {}",
            tick_spacing
        )));
    }
    if !range_pct.is_finite() || range_pct <= 0.0 {
        return Err(LpFlowError::InvalidParameters(format!(
            "range percent must be positive, got {}",
            range_pct
        )));
    }

    let max_usable = MAX_TICK.div_euclid(tick_spacing) * tick_spacing;
    let min_usable = -max_usable;
    if !(min_usable..=max_usable).contains(&current_tick) {
        return Err(LpFlowError::InvalidParameters(format!(
            "tick {} outside usable [{}, {}] for spacing {}",
            current_tick, min_usable, max_usable, tick_spacing
        )));
    }

    // Ceil so the span never falls short of `range_pct`
    let delta = ((1.0 + range_pct).ln() / 1.0001f64.ln()).ceil();
    let delta = delta.min((MAX_TICK - MIN_TICK) as f64) as i32;

    let raw_lower = current_tick.saturating_sub(delta);
    let raw_upper = current_tick.saturating_add(delta);

    let lower = (raw_lower.div_euclid(tick_spacing) * tick_spacing).max(min_usable);
    let upper = (-((-raw_upper).div_euclid(tick_spacing)) * tick_spacing).min(max_usable);

    // Both bounds landed on the current tick; widen away from the clamp
    if lower == upper {
        if upper + tick_spacing <= max_usable {
            return Ok(TickRange {
                lower,
                upper: upper + tick_spacing,
            });
        }
        return Ok(TickRange {
            lower: lower - tick_spacing,
            upper,
        });
    }
    Ok(TickRange { lower, upper })
}

pub(crate) fn u256_to_f64(value: U256) -> f64 {
    value
        .as_limbs()
        .iter()
        .rev()
        .fold(0.0, |acc, limb| acc * 18_446_744_073_709_551_616.0 + *limb as f64)
}

/// sqrt(price) at a tick, in raw units
pub fn sqrt_price_at_tick(tick: i32) -> f64 {
    1.0001f64.powf(tick as f64 / 2.0)
}

/// Raw price (token1 base units per token0 base unit)
pub fn raw_price(sqrt_price_x96: U256) -> f64 {
    let sqrt = u256_to_f64(sqrt_price_x96) / Q96;
    sqrt * sqrt
}

/// Decimal-adjusted price from `slot0.sqrtPriceX96`
pub fn price_from_sqrt_x96(sqrt_price_x96: U256, decimals0: u8, decimals1: u8) -> Result<Decimal> {
    let adjusted = raw_price(sqrt_price_x96) * 10f64.powi(decimals0 as i32 - decimals1 as i32);
    Decimal::from_f64(adjusted)
        .map(|p| p.round_dp(18))
        .ok_or_else(|| LpFlowError::InvalidParameters(format!("price {} out of range", adjusted)))
}

/// Share of deposit value that must be token0 for a position over `range`
pub fn token0_value_share(sqrt_price_x96: U256, range: TickRange) -> f64 {
    let sp = u256_to_f64(sqrt_price_x96) / Q96;
    let sa = sqrt_price_at_tick(range.lower);
    let sb = sqrt_price_at_tick(range.upper);

    if sp <= sa {
        return 1.0;
    }
    if sp >= sb {
        return 0.0;
    }

    // Amounts for unit liquidity
    let amount0 = (sb - sp) / (sp * sb);
    let amount1 = sp - sa;
    let value0 = amount0 * sp * sp;
    value0 / (value0 + amount1)
}

/// Amount of a single-token holding to swap so the result matches `share0`
pub fn split_for_deposit(amount: u128, holding_token0: bool, share0: f64) -> u128 {
    let fraction = if holding_token0 { 1.0 - share0 } else { share0 };
    let swap = (amount as f64 * fraction.clamp(0.0, 1.0)).floor();
    (swap as u128).min(amount)
}

/// Swap that brings two balances to `share0` of value in token0
pub fn rebalance_swap(
    balance0: u128,
    balance1: u128,
    sqrt_price_x96: U256,
    share0: f64,
) -> Option<SwapLeg> {
    let price = raw_price(sqrt_price_x96);
    if price <= 0.0 {
        return None;
    }
    let value0 = balance0 as f64 * price;
    let value1 = balance1 as f64;
    let target0 = (value0 + value1) * share0.clamp(0.0, 1.0);

    let leg = if value0 > target0 {
        SwapLeg {
            zero_for_one: true,
            amount_in: (((value0 - target0) / price).floor() as u128).min(balance0),
        }
    } else {
        SwapLeg {
            zero_for_one: false,
            amount_in: ((target0 - value0).floor() as u128).min(balance1),
        }
    };
    (leg.amount_in > 0).then_some(leg)
}

/// `a * b / d` without intermediate overflow, saturating at `u128::MAX`
pub(crate) fn mul_div(a: u128, b: u128, d: u128) -> u128 {
    if d == 0 {
        return 0;
    }
    let wide = U256::from(a) * U256::from(b) / U256::from(d);
    u128::try_from(wide).unwrap_or(u128::MAX)
}

/// Minimum acceptable output after `bps` of slippage
pub fn apply_slippage(amount: u128, bps: u32) -> u128 {
    mul_div(amount, 10_000u128.saturating_sub(bps as u128), 10_000)
}

/// Value owed fees in token1 units
pub fn value_fees(
    owed0: u128,
    owed1: u128,
    decimals0: u8,
    decimals1: u8,
    price: Decimal,
) -> FeeSnapshot {
    FeeSnapshot {
        owed0,
        owed1,
        value0: to_decimal(owed0, decimals0) * price,
        value1: to_decimal(owed1, decimals1),
        price,
        taken_at: Utc::now(),
    }
}

/// Gas cost of `gas_units` at `gas_price_wei`, in quote-token units
pub fn estimate_gas_cost(
    gas_price_wei: u128,
    gas_units: u64,
    native_price_in_quote: Decimal,
) -> Decimal {
    let wei = gas_price_wei.saturating_mul(gas_units as u128);
    to_decimal(wei, 18) * native_price_in_quote
}

/// Percent distance of `price` from `reference`
pub fn price_deviation_pct(reference: Decimal, price: Decimal) -> Decimal {
    if reference.is_zero() {
        return Decimal::ZERO;
    }
    ((price - reference) / reference).abs() * Decimal::ONE_HUNDRED
}

/// Split harvested fees into reinvest and cash-out legs.
///
/// The reinvest value is shared between tokens by their value contribution,
/// which means each token reinvests `reinvest_pct` of its own amount.
pub fn compute_harvest_breakdown(
    snapshot: &FeeSnapshot,
    reinvest_pct: Decimal,
) -> HarvestBreakdown {
    let pct = reinvest_pct.clamp(Decimal::ZERO, Decimal::ONE_HUNDRED);
    let total_value = snapshot.total_value();
    let reinvest_value = total_value * pct / Decimal::ONE_HUNDRED;

    // Basis points keep the token math in integers
    let bps = (pct * Decimal::ONE_HUNDRED).round().to_u128().unwrap_or(0);
    let reinvest0 = mul_div(snapshot.owed0, bps, 10_000);
    let reinvest1 = mul_div(snapshot.owed1, bps, 10_000);

    HarvestBreakdown {
        total_value,
        reinvest_value,
        cash_out_value: total_value - reinvest_value,
        reinvest0,
        reinvest1,
        cash_out0: snapshot.owed0 - reinvest0,
        cash_out1: snapshot.owed1 - reinvest1,
    }
}

/// Position math bound to the configured liquidity parameters
#[derive(Debug, Clone)]
pub struct LiquidityEngine {
    config: LiquidityConfig,
}

impl LiquidityEngine {
    pub fn new(config: LiquidityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LiquidityConfig {
        &self.config
    }

    pub fn range_for(&self, current_tick: i32, tick_spacing: i32) -> Result<TickRange> {
        calculate_tick_range(current_tick, tick_spacing, self.config.range_pct)
    }

    pub fn gas_cost(&self, gas_price_wei: u128) -> Decimal {
        estimate_gas_cost(
            gas_price_wei,
            self.config.harvest_gas_units,
            self.config.native_price_in_quote,
        )
    }

    /// Decide whether a position should be harvested or re-ranged.
    ///
    /// Fees trigger when their value strictly exceeds gas cost times the
    /// safety multiplier; price triggers at or beyond the deviation threshold.
    /// Without a trigger the position's last observed price moves to the
    /// snapshot price.
    pub fn evaluate_rebalance(
        &self,
        position: &mut Position,
        snapshot: &FeeSnapshot,
        gas_cost_estimate: Decimal,
    ) -> RebalanceDecision {
        let gas_threshold = gas_cost_estimate * self.config.safety_multiplier;
        let fee_value = snapshot.total_value();
        let deviation = price_deviation_pct(position.rebalance_price, snapshot.price);

        let mut triggers = Vec::new();
        if fee_value > gas_threshold {
            triggers.push(RebalanceTrigger::FeesCoverGas);
        }
        if deviation >= self.config.price_deviation_pct {
            triggers.push(RebalanceTrigger::PriceDeviation);
        }

        let should_rebalance = !triggers.is_empty();
        if !should_rebalance {
            position.last_observed_price = snapshot.price;
        }

        RebalanceDecision {
            should_rebalance,
            triggers,
            fee_value,
            gas_threshold,
            price_deviation_pct: deviation,
        }
    }

    pub fn compute_harvest_breakdown(&self, snapshot: &FeeSnapshot) -> HarvestBreakdown {
        compute_harvest_breakdown(snapshot, self.config.reinvest_pct)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PoolKey;
    use alloy::primitives::Address;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rust_decimal_macros::dec;

    fn q96() -> U256 {
        U256::from(1u8) << 96
    }

    fn snapshot(owed0: u128, owed1: u128, price: Decimal) -> FeeSnapshot {
        value_fees(owed0, owed1, 0, 0, price)
    }

    fn position(rebalance_price: Decimal) -> Position {
        Position {
            pool: PoolKey {
                token0: Address::repeat_byte(1),
                token1: Address::repeat_byte(2),
                fee: 500,
            },
            pool_address: Address::repeat_byte(3),
            token_id: Some(U256::from(1)),
            tick_lower: -600,
            tick_upper: 600,
            liquidity: 1_000,
            amount0: 500,
            amount1: 500,
            rebalance_price,
            last_observed_price: rebalance_price,
            opened_at: Utc::now(),
            last_harvest_at: None,
        }
    }

    fn engine(safety_multiplier: Decimal, deviation: Decimal) -> LiquidityEngine {
        LiquidityEngine::new(LiquidityConfig {
            safety_multiplier,
            price_deviation_pct: deviation,
            reinvest_pct: dec!(60),
            ..LiquidityConfig::default()
        })
    }

    #[test]
    fn tick_range_properties_hold_for_random_inputs() {
        let mut rng = StdRng::seed_from_u64(7);
        let spacings = [1, 10, 60, 200];

        for _ in 0..2_000 {
            let tick = rng.gen_range(-800_000..=800_000);
            let spacing = spacings[rng.gen_range(0..spacings.len())];
            let pct: f64 = rng.gen_range(0.001..0.5);

            let range = calculate_tick_range(tick, spacing, pct).unwrap();
            assert_eq!(range.lower % spacing, 0, "lower {} spacing {}", range.lower, spacing);
            assert_eq!(range.upper % spacing, 0, "upper {} spacing {}", range.upper, spacing);
            assert!(range.lower < range.upper);
            assert!(range.contains(tick));

            let min_span = (1.0 + pct).ln();
            let tick_ln = 1.0001f64.ln();
            assert!((tick - range.lower) as f64 * tick_ln >= min_span - 1e-9);
            assert!((range.upper - tick) as f64 * tick_ln >= min_span - 1e-9);
        }
    }

    #[test]
    fn tick_range_clamps_at_the_bounds() {
        let max_usable = MAX_TICK / 60 * 60;
        let min_usable = -(MAX_TICK / 60 * 60);
        let cases = [
            (max_usable, 0.5),
            (max_usable, 0.001),
            (max_usable - 5, 0.001),
            (max_usable - 5, 0.5),
            (min_usable, 0.5),
            (min_usable, 0.001),
            (min_usable + 5, 0.001),
        ];

        for (tick, pct) in cases {
            let range = calculate_tick_range(tick, 60, pct).unwrap();
            assert!(range.lower >= min_usable && range.upper <= max_usable, "{:?}", range);
            assert_eq!(range.lower % 60, 0);
            assert_eq!(range.upper % 60, 0);
            assert!(range.lower < range.upper, "tick {} gave {:?}", tick, range);
            assert!(range.contains(tick), "tick {} outside {:?}", tick, range);
        }
    }

    #[test]
    fn tick_beyond_the_usable_range_is_rejected() {
        assert!(calculate_tick_range(MAX_TICK - 5, 60, 0.001).is_err());
        assert!(calculate_tick_range(MIN_TICK + 5, 60, 0.5).is_err());
        assert!(calculate_tick_range(MAX_TICK - 5, 1, 0.001).is_ok());
    }

    #[test]
    fn tick_range_rejects_bad_input() {
        assert!(calculate_tick_range(0, 0, 0.05).is_err());
        assert!(calculate_tick_range(0, 10, 0.0).is_err());
        assert!(calculate_tick_range(0, 10, f64::NAN).is_err());
        assert!(calculate_tick_range(MAX_TICK + 1, 10, 0.05).is_err());
    }

    #[test]
    fn price_from_unit_sqrt_is_one() {
        assert_eq!(price_from_sqrt_x96(q96(), 18, 18).unwrap(), dec!(1));
    }

    #[test]
    fn price_accounts_for_decimals() {
        // 3000 quote (6 decimals) per base (18 decimals)
        let raw: f64 = 3000.0 * 1e6 / 1e18;
        let sqrt_x96 = U256::from((raw.sqrt() * Q96) as u128);
        let price = price_from_sqrt_x96(sqrt_x96, 18, 6).unwrap();
        assert!((price - dec!(3000)).abs() < dec!(0.3), "price {}", price);
    }

    #[test]
    fn symmetric_range_at_unit_price_is_half_and_half() {
        let share = token0_value_share(q96(), TickRange { lower: -600, upper: 600 });
        assert!((share - 0.5).abs() < 1e-9, "share {}", share);

        assert_eq!(token0_value_share(q96(), TickRange { lower: 60, upper: 600 }), 1.0);
        assert_eq!(token0_value_share(q96(), TickRange { lower: -600, upper: -60 }), 0.0);
    }

    #[test]
    fn deposit_split_matches_ratio() {
        assert_eq!(split_for_deposit(1_000, false, 0.5), 500);
        assert_eq!(split_for_deposit(1_000, true, 0.25), 750);
        assert_eq!(split_for_deposit(1_000, true, 1.0), 0);
    }

    #[test]
    fn rebalance_swap_moves_the_excess_side() {
        let leg = rebalance_swap(1_000, 0, q96(), 0.5).unwrap();
        assert!(leg.zero_for_one);
        assert_eq!(leg.amount_in, 500);

        let leg = rebalance_swap(100, 900, q96(), 0.5).unwrap();
        assert!(!leg.zero_for_one);
        assert_eq!(leg.amount_in, 400);

        assert!(rebalance_swap(500, 500, q96(), 0.5).is_none());
    }

    #[test]
    fn harvest_split_reinvests_sixty_percent_of_forty_sixty() {
        let fees = snapshot(40, 60, dec!(1));
        let breakdown = compute_harvest_breakdown(&fees, dec!(60));

        assert_eq!(breakdown.total_value, dec!(100));
        assert_eq!(breakdown.reinvest_value, dec!(60));
        assert_eq!(breakdown.cash_out_value, dec!(40));
        assert_eq!((breakdown.reinvest0, breakdown.reinvest1), (24, 36));
        assert_eq!((breakdown.cash_out0, breakdown.cash_out1), (16, 24));
    }

    #[test]
    fn harvest_split_conserves_amounts() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..500 {
            let owed0 = rng.gen_range(0..10_000_000_000u128);
            let owed1 = rng.gen_range(0..10_000_000_000u128);
            let pct = Decimal::from(rng.gen_range(0..=100u32));
            let b = compute_harvest_breakdown(&snapshot(owed0, owed1, dec!(2.5)), pct);
            assert_eq!(b.reinvest0 + b.cash_out0, owed0);
            assert_eq!(b.reinvest1 + b.cash_out1, owed1);
        }
    }

    #[test]
    fn zero_fees_split_into_nothing() {
        let b = compute_harvest_breakdown(&snapshot(0, 0, dec!(1)), dec!(50));
        assert!(!b.has_reinvest());
        assert!(!b.has_cash_out());
    }

    #[test]
    fn rebalance_truth_table() {
        let engine = engine(dec!(2), dec!(5));
        // gas 10 -> threshold 20
        let cases = [
            // fees, price, expect fees trigger, expect price trigger
            (10u128, dec!(1.00), false, false),
            (30, dec!(1.00), true, false),
            (10, dec!(1.06), false, true),
            (30, dec!(0.90), true, true),
            (20, dec!(1.00), false, false),
        ];

        for (fees, price, fee_trigger, price_trigger) in cases {
            let mut pos = position(dec!(1));
            let snap = snapshot(0, fees, price);
            let decision = engine.evaluate_rebalance(&mut pos, &snap, dec!(10));

            assert_eq!(
                decision.triggered_by(RebalanceTrigger::FeesCoverGas),
                fee_trigger,
                "fees {}",
                fees
            );
            assert_eq!(
                decision.triggered_by(RebalanceTrigger::PriceDeviation),
                price_trigger,
                "price {}",
                price
            );
            assert_eq!(decision.should_rebalance, fee_trigger || price_trigger);
        }
    }

    #[test]
    fn quiet_evaluation_records_the_observed_price() {
        let engine = engine(dec!(2), dec!(5));
        let mut pos = position(dec!(1));
        let decision = engine.evaluate_rebalance(&mut pos, &snapshot(0, 1, dec!(1.02)), dec!(10));

        assert!(!decision.should_rebalance);
        assert_eq!(pos.last_observed_price, dec!(1.02));
        assert_eq!(pos.rebalance_price, dec!(1));
    }

    #[test]
    fn gas_cost_in_quote_units() {
        // 0.1 gwei * 350k gas = 0.000035 ETH at 3000
        let cost = estimate_gas_cost(100_000_000, 350_000, dec!(3000));
        assert_eq!(cost, dec!(0.105));
    }

    #[test]
    fn slippage_floor() {
        assert_eq!(apply_slippage(10_000, 50), 9_950);
        assert_eq!(apply_slippage(u128::MAX, 0), u128::MAX);
    }
}
