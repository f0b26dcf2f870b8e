//! Strategy module
//!
//! The cross-chain liquidity pipeline and the services it runs on.
//!
//! ## Architecture
//!
//! - `context` - Services shared by every stage (clients, retry, transactor, state)
//! - `stages/` - One module per pipeline stage (fund, bridge, swap, position, collect)
//! - `orchestrator` - Per-wallet step state machine
//! - `driver` - Fleet runs with bounded concurrency
//! - `position_manager` - Harvest cycles and the periodic monitor
//! - `liquidity` - Tick ranges, deposit ratios, rebalance decisions
//! - `distribution` - Allocation plans and batched payouts
//! - `transactor` - Nonce-ordered signing and receipt waits
//!
//! ## Usage
//!
//! ```bash
//! lpflow run --wallets 10 --concurrency 4
//! lpflow harvest --interval 300
//! ```

pub mod context;
pub mod distribution;
pub mod driver;
pub mod liquidity;
pub mod orchestrator;
pub mod position_manager;
pub mod stages;
pub mod transactor;

pub use context::{state_key, ExecutionContext, PoolContext, WalletJob};
pub use distribution::{
    compute_random_parts, create_plan, DistributionPlanner, FunderTransfer, TransferExecutor,
};
pub use driver::{plan_allocations, FleetDriver, RunOptions, RunReport, WalletOutcome};
pub use liquidity::LiquidityEngine;
pub use orchestrator::StepOrchestrator;
pub use position_manager::PositionManager;
pub use transactor::Transactor;
