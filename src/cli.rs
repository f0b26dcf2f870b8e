//! lpflow CLI
//!
//! Commands:
//! - `lpflow run` - Run the pipeline for the wallet fleet
//! - `lpflow status` - Show every persisted wallet
//! - `lpflow reset` - Delete persisted state
//! - `lpflow distribute` - Pay the funder's balance out across the fleet
//! - `lpflow harvest` - Periodic harvest monitor
//! - `lpflow wallets` - Print derived addresses

use alloy::primitives::Address;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use serde::Serialize;
use tabled::{Table, Tabled};

use crate::domain::{from_decimal, to_decimal, DistributionOutcome, ExecutionState};
use crate::error::{LpFlowError, Result};
use crate::persistence::StateRepository;
use crate::signing::WalletDirectory;
use crate::strategy::{state_key, DistributionPlanner, ExecutionContext, FunderTransfer, RunReport};

/// Cross-chain liquidity automation for a fleet of derived wallets
#[derive(Parser, Debug)]
#[command(name = "lpflow")]
#[command(author, version, about = "Cross-chain concentrated-liquidity automation")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path (defaults to layered config/ files plus LPFLOW_ env)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Compute and log everything, send nothing
    #[arg(long, global = true)]
    pub dry_run: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run every wallet from its persisted step to completion
    Run {
        /// Number of wallets (defaults to wallets.count)
        #[arg(long)]
        wallets: Option<u32>,
        /// First derivation index (defaults to wallets.start_index)
        #[arg(long)]
        start_index: Option<u32>,
        /// Pipelines run at once (defaults to orchestrator.concurrency)
        #[arg(long)]
        concurrency: Option<usize>,
        /// Reopen wallets in ERROR at the step that failed
        #[arg(long)]
        retry_failed: bool,
    },
    /// Show the persisted state of every wallet
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Delete persisted state
    Reset {
        /// Wallet address to reset
        #[arg(required_unless_present = "all")]
        address: Option<Address>,
        /// Reset every wallet
        #[arg(long, conflicts_with = "address")]
        all: bool,
    },
    /// Distribute the funder's balance across the fleet
    Distribute {
        /// Total to pay out, in token units
        #[arg(long)]
        total: Decimal,
        /// Vary each amount around the per-wallet target
        #[arg(long)]
        randomize: bool,
        /// Variance in percent when randomized
        #[arg(long, default_value = "10")]
        variance: Decimal,
        /// Token to send (defaults to the source token; omit both for native)
        #[arg(long)]
        token: Option<Address>,
        #[arg(long)]
        wallets: Option<u32>,
        #[arg(long)]
        start_index: Option<u32>,
    },
    /// Harvest completed wallets on an interval
    Harvest {
        /// Seconds between passes
        #[arg(long, default_value = "300")]
        interval: u64,
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
    },
    /// Print derived wallet addresses
    Wallets {
        #[arg(long)]
        count: Option<u32>,
        #[arg(long)]
        start_index: Option<u32>,
    },
}

/// Output mode for command results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Table,
    Json,
}

impl OutputMode {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            OutputMode::Json
        } else {
            OutputMode::Table
        }
    }
}

/// Print rows as a table or as pretty JSON
pub fn print_items<T: Tabled + Serialize>(items: &[T], mode: OutputMode) -> Result<()> {
    match mode {
        OutputMode::Table => {
            if items.is_empty() {
                println!("(no results)");
            } else {
                println!("{}", Table::new(items));
            }
        }
        OutputMode::Json => println!("{}", serde_json::to_string_pretty(items)?),
    }
    Ok(())
}

#[derive(Debug, Serialize, Tabled)]
pub struct StatusRow {
    pub index: u32,
    pub wallet: String,
    pub step: String,
    pub token_id: String,
    pub liquidity: String,
    pub last_harvest: String,
    pub updated: String,
    pub failure: String,
}

impl From<&ExecutionState> for StatusRow {
    fn from(state: &ExecutionState) -> Self {
        let position = state.position.as_ref();
        Self {
            index: state.derivation_index,
            wallet: state.wallet_address.clone(),
            step: state.step.to_string(),
            token_id: position
                .and_then(|p| p.token_id)
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".into()),
            liquidity: position.map(|p| p.liquidity.to_string()).unwrap_or_else(|| "-".into()),
            last_harvest: position
                .and_then(|p| p.last_harvest_at)
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "-".into()),
            updated: state.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            failure: state
                .failure
                .as_ref()
                .map(|f| format!("{} at {}: {}", f.stage, f.failed_at_step, f.reason))
                .unwrap_or_default(),
        }
    }
}

pub fn status_rows(states: &[ExecutionState]) -> Vec<StatusRow> {
    states.iter().map(StatusRow::from).collect()
}

pub async fn show_status(states: &StateRepository, json: bool) -> Result<()> {
    let rows = status_rows(&states.list().await?);
    print_items(&rows, OutputMode::from_json_flag(json))?;
    if !json {
        let done = rows.iter().filter(|r| r.step == "COLLECT_DONE").count();
        let failed = rows.iter().filter(|r| r.step == "ERROR").count();
        println!("{} wallets, {} complete, {} failed", rows.len(), done, failed);
    }
    Ok(())
}

/// Delete one wallet's state, or every wallet's. Returns the number removed.
pub async fn reset_state(
    states: &StateRepository,
    address: Option<Address>,
    all: bool,
) -> Result<usize> {
    let keys = match (address, all) {
        (_, true) => states
            .list()
            .await?
            .into_iter()
            .map(|s| s.wallet_address)
            .collect(),
        (Some(address), false) => vec![state_key(address)],
        (None, false) => {
            return Err(LpFlowError::InvalidParameters(
                "pass an address or --all".into(),
            ))
        }
    };

    let mut removed = 0;
    for key in keys {
        if states.reset(&key).await? {
            println!("Reset {}", key);
            removed += 1;
        } else {
            println!("No state for {}", key);
        }
    }
    Ok(removed)
}

#[derive(Debug, Serialize, Tabled)]
pub struct WalletRow {
    pub index: u32,
    pub address: String,
}

pub fn show_wallets(wallets: &WalletDirectory, start: u32, count: u32) -> Result<()> {
    let rows: Vec<WalletRow> = wallets
        .derive_range(start, count)?
        .iter()
        .map(|w| WalletRow {
            index: w.derivation_index.unwrap_or_default(),
            address: w.address.to_string(),
        })
        .collect();
    print_items(&rows, OutputMode::Table)
}

#[derive(Debug, Serialize, Tabled)]
struct OutcomeRow {
    index: u32,
    wallet: String,
    step: String,
    error: String,
}

pub fn print_report(report: &RunReport) -> Result<()> {
    let rows: Vec<OutcomeRow> = report
        .outcomes
        .iter()
        .map(|o| OutcomeRow {
            index: o.index,
            wallet: o.address.to_string(),
            step: o.step.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
            error: o.error.clone().unwrap_or_default(),
        })
        .collect();
    print_items(&rows, OutputMode::Table)?;
    println!(
        "{}/{} wallets reached COLLECT_DONE",
        report.succeeded(),
        report.outcomes.len()
    );
    Ok(())
}

/// Options for a one-off payout from the funder
#[derive(Debug, Clone)]
pub struct DistributeOptions {
    pub total: Decimal,
    pub randomize: bool,
    pub variance: Decimal,
    pub token: Option<Address>,
    pub start_index: u32,
    pub count: u32,
}

/// Plan and execute a payout of `total` from the funder across the fleet
pub async fn distribute(
    ctx: &ExecutionContext,
    options: &DistributeOptions,
) -> Result<DistributionOutcome> {
    let funder = ctx.funder()?.clone();
    let chain = ctx.source_chain();
    let token = options.token.or(ctx.config.chains.source.token);
    let decimals = ctx.decimals(chain, token).await?;

    let recipients: Vec<Address> = ctx
        .wallets
        .derive_range(options.start_index, options.count)?
        .iter()
        .map(|w| w.address)
        .collect();
    let total = from_decimal(options.total, decimals)?;
    let target = total.div_ceil(recipients.len().max(1) as u128);
    let balance = ctx.balance(chain, token, funder.address).await?;

    let planner = DistributionPlanner::new(ctx.config.distribution.clone());
    let plan = {
        let mut rng = rand::thread_rng();
        planner.create_plan(
            balance.min(total),
            &recipients,
            target,
            options.randomize,
            options.variance,
            &mut rng,
        )?
    };

    #[derive(Tabled)]
    struct PlanRow {
        recipient: String,
        amount: String,
    }
    let rows: Vec<PlanRow> = plan
        .entries
        .iter()
        .map(|e| PlanRow {
            recipient: e.recipient.to_string(),
            amount: to_decimal(e.amount, decimals).to_string(),
        })
        .collect();
    println!("{}", Table::new(&rows));
    println!("Plan total: {}", to_decimal(plan.total, decimals));

    let executor = FunderTransfer::new(
        ctx.transactor.clone(),
        funder,
        chain,
        token,
        ctx.receipt_timeout(),
        ctx.cancel.clone(),
    );
    let outcome = planner.execute(&plan, &executor, &ctx.cancel).await?;
    println!(
        "Sent {} to {} recipients, {} failed",
        to_decimal(outcome.succeeded_amount, decimals),
        outcome.transaction_hashes.len(),
        outcome.per_recipient_errors.len()
    );
    for failure in &outcome.per_recipient_errors {
        println!(
            "  {} ({}): {}",
            failure.recipient,
            to_decimal(failure.amount, decimals),
            failure.reason
        );
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use crate::domain::Stage;
    use crate::strategy::context::tests::TestBed;

    #[test]
    fn parses_run_flags() {
        let cli = Cli::try_parse_from([
            "lpflow",
            "run",
            "--wallets",
            "5",
            "--concurrency",
            "2",
            "--retry-failed",
            "--dry-run",
        ])
        .unwrap();
        assert!(cli.dry_run);
        match cli.command {
            Commands::Run {
                wallets,
                concurrency,
                retry_failed,
                start_index,
            } => {
                assert_eq!(wallets, Some(5));
                assert_eq!(concurrency, Some(2));
                assert!(retry_failed);
                assert_eq!(start_index, None);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn reset_needs_a_target() {
        assert!(Cli::try_parse_from(["lpflow", "reset"]).is_err());
        assert!(Cli::try_parse_from(["lpflow", "reset", "--all"]).is_ok());
        let address = Address::repeat_byte(0x0a).to_string();
        assert!(Cli::try_parse_from(["lpflow", "reset", address.as_str(), "--all"]).is_err());
    }

    #[test]
    fn distribute_parses_decimal_total() {
        let cli =
            Cli::try_parse_from(["lpflow", "distribute", "--total", "250.5", "--randomize"])
                .unwrap();
        match cli.command {
            Commands::Distribute { total, randomize, variance, .. } => {
                assert_eq!(total, Decimal::new(2505, 1));
                assert!(randomize);
                assert_eq!(variance, Decimal::from(10));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn status_row_shows_failure() {
        let mut state = ExecutionState::new("0xabc", 3);
        state.begin(Stage::Fund).unwrap();
        state.fail(Stage::Fund, "insufficient balance").unwrap();

        let row = StatusRow::from(&state);
        assert_eq!(row.index, 3);
        assert_eq!(row.step, "ERROR");
        assert_eq!(row.token_id, "-");
        assert!(row.failure.contains("insufficient balance"));
    }

    #[tokio::test]
    async fn reset_removes_one_or_all() {
        let bed = TestBed::new(sample_config());
        let a = bed.wallets.wallet(0).unwrap().address;
        let b = bed.wallets.wallet(1).unwrap().address;
        bed.states.load_or_create(&state_key(a), 0).await.unwrap();
        bed.states.load_or_create(&state_key(b), 1).await.unwrap();

        assert_eq!(reset_state(&bed.states, Some(a), false).await.unwrap(), 1);
        assert_eq!(reset_state(&bed.states, Some(a), false).await.unwrap(), 0);
        assert_eq!(reset_state(&bed.states, None, true).await.unwrap(), 1);
        assert!(bed.states.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn distribute_pays_every_recipient() {
        let mut config = sample_config();
        config.distribution.inter_batch_delay_ms = 0;
        let bed = TestBed::new(config);
        let ctx = bed.context();
        let options = DistributeOptions {
            total: Decimal::from(30),
            randomize: false,
            variance: Decimal::from(10),
            token: None,
            start_index: 0,
            count: 3,
        };

        let outcome = distribute(&ctx, &options).await.unwrap();

        assert!(outcome.all_succeeded());
        assert_eq!(outcome.succeeded_amount, 30_000_000);
        let token = bed.config.chains.source.token.unwrap();
        let source = bed.config.chains.source.chain_id;
        for index in 0..3 {
            let address = bed.wallets.wallet(index).unwrap().address;
            assert_eq!(bed.chain.token_balance_of(source, token, address), 10_000_000);
        }
    }
}
