//! Splitting a pooled balance across recipients and paying it out in batches

use alloy::primitives::{Address, TxHash};
use async_trait::async_trait;
use futures::future::join_all;
use rand::Rng;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use super::liquidity::mul_div;
use super::transactor::Transactor;
use crate::adapters::contracts::erc20_transfer;
use crate::config::DistributionConfig;
use crate::coordination::CancelToken;
use crate::domain::{
    ChainId, DistributionOutcome, DistributionPlan, PlanEntry, RecipientError, TxRequest,
};
use crate::error::{LpFlowError, Result};
use crate::signing::WalletRecord;

/// Upper bound on single-unit draws when spreading a remainder
const MAX_REMAINDER_DRAWS: u128 = 1_000_000;

/// Split `total` into `n` parts of at least `min_each`.
///
/// Every slot starts at `min_each`; the remainder is handed out one quantum at
/// a time to a uniformly random slot. The quantum is one unit unless the
/// remainder is large enough that unit draws would be impractical, in which
/// case the leftover below one quantum goes to a random slot as well.
pub fn compute_random_parts<R: Rng + ?Sized>(
    total: u128,
    n: usize,
    min_each: u128,
    rng: &mut R,
) -> Result<Vec<u128>> {
    if n == 0 {
        return Err(LpFlowError::InvalidParameters(
            "cannot split into zero parts".into(),
        ));
    }
    let floor = min_each
        .checked_mul(n as u128)
        .filter(|floor| *floor <= total)
        .ok_or_else(|| {
            LpFlowError::InvalidParameters(format!(
                "{} parts of at least {} exceed total {}",
                n, min_each, total
            ))
        })?;

    let mut parts = vec![min_each; n];
    let remainder = total - floor;
    let quantum = remainder.div_ceil(MAX_REMAINDER_DRAWS).max(1);

    for _ in 0..remainder / quantum {
        parts[rng.gen_range(0..n)] += quantum;
    }
    let leftover = remainder % quantum;
    if leftover > 0 {
        parts[rng.gen_range(0..n)] += leftover;
    }
    Ok(parts)
}

/// Plan a payout of `target` per recipient out of `balance`.
///
/// The plan total is `min(balance, target * recipients)`. Without
/// randomization every recipient gets an equal share and the last one absorbs
/// the rounding remainder. With randomization each amount but the last is drawn
/// from `target ± variance_pct%`; draws that would overrun the plan total are
/// scaled down, and the last recipient takes whatever is left.
pub fn create_plan<R: Rng + ?Sized>(
    balance: u128,
    recipients: &[Address],
    target: u128,
    randomize: bool,
    variance_pct: Decimal,
    rng: &mut R,
) -> Result<DistributionPlan> {
    if recipients.is_empty() {
        return Err(LpFlowError::InvalidParameters("no recipients".into()));
    }
    if target == 0 {
        return Err(LpFlowError::InvalidParameters(
            "per-recipient target must be positive".into(),
        ));
    }
    let n = recipients.len();
    let total = target.saturating_mul(n as u128).min(balance);

    let amounts = if randomize {
        randomized_amounts(total, n, target, variance_pct, rng)?
    } else {
        let each = total / n as u128;
        let mut amounts = vec![each; n];
        amounts[n - 1] = total - each * (n as u128 - 1);
        amounts
    };

    let entries = recipients
        .iter()
        .zip(amounts)
        .map(|(recipient, amount)| PlanEntry {
            recipient: *recipient,
            amount,
        })
        .collect();
    Ok(DistributionPlan { entries, total })
}

fn randomized_amounts<R: Rng + ?Sized>(
    total: u128,
    n: usize,
    target: u128,
    variance_pct: Decimal,
    rng: &mut R,
) -> Result<Vec<u128>> {
    if variance_pct < Decimal::ZERO || variance_pct >= Decimal::ONE_HUNDRED {
        return Err(LpFlowError::InvalidParameters(format!(
            "variance {}% must be in [0, 100)",
            variance_pct
        )));
    }
    let variance_bps = (variance_pct * Decimal::ONE_HUNDRED)
        .round()
        .to_u128()
        .unwrap_or(0);
    let low = mul_div(target, 10_000 - variance_bps, 10_000);
    let high = mul_div(target, 10_000 + variance_bps, 10_000);

    let mut amounts: Vec<u128> = (0..n - 1).map(|_| rng.gen_range(low..=high)).collect();
    let drawn: u128 = amounts.iter().sum();
    if drawn > total {
        for amount in amounts.iter_mut() {
            *amount = mul_div(*amount, total, drawn);
        }
    }
    let assigned: u128 = amounts.iter().sum();
    amounts.push(total - assigned);
    Ok(amounts)
}

/// One transfer of a distribution plan
#[async_trait]
pub trait TransferExecutor: Send + Sync {
    async fn transfer(&self, recipient: Address, amount: u128) -> Result<TxHash>;
}

/// Pays out from the funder key and waits for each receipt
pub struct FunderTransfer {
    transactor: Arc<Transactor>,
    funder: Arc<WalletRecord>,
    chain: ChainId,
    /// `None` sends the native coin
    token: Option<Address>,
    receipt_timeout: Duration,
    cancel: CancelToken,
}

impl FunderTransfer {
    pub fn new(
        transactor: Arc<Transactor>,
        funder: Arc<WalletRecord>,
        chain: ChainId,
        token: Option<Address>,
        receipt_timeout: Duration,
        cancel: CancelToken,
    ) -> Self {
        Self {
            transactor,
            funder,
            chain,
            token,
            receipt_timeout,
            cancel,
        }
    }
}

#[async_trait]
impl TransferExecutor for FunderTransfer {
    async fn transfer(&self, recipient: Address, amount: u128) -> Result<TxHash> {
        let tx = match self.token {
            Some(token) => erc20_transfer(token, recipient, amount),
            None => TxRequest::native_transfer(recipient, amount),
        };
        let receipt = self
            .transactor
            .send_and_confirm(self.chain, &self.funder, &tx, self.receipt_timeout, &self.cancel)
            .await?;
        Ok(receipt.tx_hash)
    }
}

/// Plans and executes batched payouts
#[derive(Debug, Clone)]
pub struct DistributionPlanner {
    config: DistributionConfig,
}

impl DistributionPlanner {
    pub fn new(config: DistributionConfig) -> Self {
        Self { config }
    }

    pub fn create_plan<R: Rng + ?Sized>(
        &self,
        balance: u128,
        recipients: &[Address],
        target: u128,
        randomize: bool,
        variance_pct: Decimal,
        rng: &mut R,
    ) -> Result<DistributionPlan> {
        create_plan(balance, recipients, target, randomize, variance_pct, rng)
    }

    /// Execute with the configured batch size and delay
    pub async fn execute(
        &self,
        plan: &DistributionPlan,
        executor: &dyn TransferExecutor,
        cancel: &CancelToken,
    ) -> Result<DistributionOutcome> {
        self.execute_plan(
            plan,
            executor,
            self.config.batch_size,
            Duration::from_millis(self.config.inter_batch_delay_ms),
            cancel,
        )
        .await
    }

    /// Run the plan in batches of `batch_size`, every transfer of a batch
    /// concurrently. A failed transfer is recorded against its recipient and
    /// the rest of the plan continues.
    #[instrument(skip_all, fields(recipients = plan.len(), total = %plan.total))]
    pub async fn execute_plan(
        &self,
        plan: &DistributionPlan,
        executor: &dyn TransferExecutor,
        batch_size: usize,
        inter_batch_delay: Duration,
        cancel: &CancelToken,
    ) -> Result<DistributionOutcome> {
        if batch_size == 0 {
            return Err(LpFlowError::InvalidParameters("batch size must be at least 1".into()));
        }

        let mut outcome = DistributionOutcome::default();
        let batches: Vec<&[PlanEntry]> = plan.entries.chunks(batch_size).collect();
        let batch_count = batches.len();

        for (i, batch) in batches.into_iter().enumerate() {
            if i > 0 && !inter_batch_delay.is_zero() {
                cancel.sleep(inter_batch_delay).await?;
            }
            cancel.check()?;

            let results = join_all(
                batch
                    .iter()
                    .map(|entry| executor.transfer(entry.recipient, entry.amount)),
            )
            .await;

            for (entry, result) in batch.iter().zip(results) {
                match result {
                    Ok(hash) => {
                        outcome.succeeded_amount += entry.amount;
                        outcome.transaction_hashes.push(hash);
                    }
                    Err(err) => {
                        warn!(
                            recipient = %entry.recipient,
                            amount = entry.amount,
                            error = %err,
                            "Transfer failed"
                        );
                        outcome.per_recipient_errors.push(RecipientError {
                            recipient: entry.recipient,
                            amount: entry.amount,
                            reason: err.to_string(),
                        });
                    }
                }
            }
            info!(
                batch = i + 1,
                of = batch_count,
                succeeded = outcome.transaction_hashes.len(),
                failed = outcome.per_recipient_errors.len(),
                "Batch complete"
            );
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn recipients(n: u8) -> Vec<Address> {
        (1..=n).map(Address::repeat_byte).collect()
    }

    #[test]
    fn random_parts_sum_exactly_and_respect_the_floor() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..200 {
            let n = rng.gen_range(1..20usize);
            let min_each = rng.gen_range(0..50u128);
            let total = min_each * n as u128 + rng.gen_range(0..10_000u128);

            let parts = compute_random_parts(total, n, min_each, &mut rng).unwrap();
            assert_eq!(parts.len(), n);
            assert_eq!(parts.iter().sum::<u128>(), total);
            assert!(parts.iter().all(|p| *p >= min_each));
        }
    }

    #[test]
    fn random_parts_handle_raw_token_amounts() {
        let mut rng = StdRng::seed_from_u64(3);
        // 1000 tokens at 18 decimals
        let total = 1_000 * 10u128.pow(18);
        let parts = compute_random_parts(total, 7, 10u128.pow(18), &mut rng).unwrap();
        assert_eq!(parts.iter().sum::<u128>(), total);
        assert!(parts.iter().all(|p| *p >= 10u128.pow(18)));
    }

    #[test]
    fn random_parts_reject_an_unreachable_floor() {
        let mut rng = StdRng::seed_from_u64(1);
        let err = compute_random_parts(10, 4, 3, &mut rng).unwrap_err();
        assert!(matches!(err, LpFlowError::InvalidParameters(_)));
        assert!(compute_random_parts(10, 0, 0, &mut rng).is_err());
        assert_eq!(compute_random_parts(12, 4, 3, &mut rng).unwrap(), vec![3, 3, 3, 3]);
    }

    #[test]
    fn even_plan_for_ten_wallets() {
        let mut rng = StdRng::seed_from_u64(5);
        let plan = create_plan(100, &recipients(10), 10, false, dec!(10), &mut rng).unwrap();
        assert_eq!(plan.len(), 10);
        assert!(plan.entries.iter().all(|e| e.amount == 10));
        assert_eq!(plan.sum(), 100);
        assert_eq!(plan.total, 100);
    }

    #[test]
    fn randomized_plan_stays_within_variance() {
        for seed in 0..50 {
            let mut rng = StdRng::seed_from_u64(seed);
            let plan = create_plan(100, &recipients(10), 10, true, dec!(10), &mut rng).unwrap();
            assert_eq!(plan.sum(), 100);
            for entry in &plan.entries[..9] {
                assert!((9..=11).contains(&entry.amount), "seed {}: {}", seed, entry.amount);
            }
        }
    }

    #[test]
    fn plan_never_exceeds_balance() {
        let mut rng = StdRng::seed_from_u64(9);
        let even = create_plan(95, &recipients(10), 10, false, dec!(0), &mut rng).unwrap();
        assert_eq!(even.sum(), 95);
        assert_eq!(even.entries[0].amount, 9);
        assert_eq!(even.entries[9].amount, 14);

        for seed in 0..50 {
            let mut rng = StdRng::seed_from_u64(seed);
            let plan = create_plan(50, &recipients(10), 10, true, dec!(20), &mut rng).unwrap();
            assert_eq!(plan.sum(), 50);
            assert!(plan.sum() <= 50);
        }
    }

    /// Fails for one recipient and counts concurrent calls
    struct ScriptedTransfers {
        fail_for: Address,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: Mutex<Vec<Address>>,
    }

    impl ScriptedTransfers {
        fn new(fail_for: Address) -> Self {
            Self {
                fail_for,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TransferExecutor for ScriptedTransfers {
        async fn transfer(&self, recipient: Address, _amount: u128) -> Result<TxHash> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.calls.lock().unwrap().push(recipient);

            if recipient == self.fail_for {
                Err(LpFlowError::InsufficientFunds("funder drained".into()))
            } else {
                Ok(TxHash::repeat_byte(recipient.0[0]))
            }
        }
    }

    #[tokio::test]
    async fn batch_failures_are_recorded_per_recipient() {
        let mut rng = StdRng::seed_from_u64(1);
        let plan = create_plan(50, &recipients(5), 10, false, dec!(0), &mut rng).unwrap();
        let executor = ScriptedTransfers::new(Address::repeat_byte(2));
        let planner = DistributionPlanner::new(DistributionConfig::default());

        let started = Instant::now();
        let outcome = planner
            .execute_plan(&plan, &executor, 2, Duration::from_millis(20), &CancelToken::never())
            .await
            .unwrap();

        assert_eq!(executor.calls.lock().unwrap().len(), 5);
        assert_eq!(executor.peak.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.succeeded_amount, 40);
        assert_eq!(outcome.transaction_hashes.len(), 4);
        assert!(!outcome.all_succeeded());
        assert_eq!(outcome.per_recipient_errors.len(), 1);
        assert_eq!(outcome.per_recipient_errors[0].recipient, Address::repeat_byte(2));
        assert!(outcome.per_recipient_errors[0].reason.contains("funder drained"));
        // Three batches, two delays between them
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn funder_transfers_land_on_chain() {
        use crate::adapters::fakes::FakeChain;
        use crate::coordination::{RetryExecutor, RetryPolicy, Throttle};
        use crate::signing::wallet::tests::TEST_MNEMONIC;
        use crate::signing::WalletDirectory;

        let fake = Arc::new(FakeChain::new());
        let wallets = Arc::new(WalletDirectory::new(TEST_MNEMONIC, fake.clone()));
        let retry = Arc::new(RetryExecutor::new(
            RetryPolicy::once(),
            Arc::new(Throttle::disabled()),
        ));
        let transactor = Arc::new(Transactor::new(
            fake.clone(),
            wallets.clone(),
            retry,
            Duration::from_millis(1),
        ));
        let funder = wallets.wallet(9).unwrap();
        let funder_address = funder.address;
        let token = Address::repeat_byte(0xaa);
        fake.set_token_balance(1, token, funder.address, 25);

        let executor = FunderTransfer::new(
            transactor,
            funder,
            1,
            Some(token),
            Duration::from_secs(1),
            CancelToken::never(),
        );
        let mut rng = StdRng::seed_from_u64(1);
        let plan = create_plan(30, &recipients(3), 10, false, dec!(0), &mut rng).unwrap();
        let outcome = DistributionPlanner::new(DistributionConfig::default())
            .execute_plan(&plan, &executor, 3, Duration::ZERO, &CancelToken::never())
            .await
            .unwrap();

        // The funder only holds 25: one of the three transfers reverts
        assert_eq!(outcome.succeeded_amount, 20);
        assert_eq!(outcome.per_recipient_errors.len(), 1);
        assert_eq!(fake.token_balance_of(1, token, funder_address), 5);
        assert_eq!(fake.token_balance_of(1, token, Address::repeat_byte(1)), 10);
    }
}
