pub mod adapters;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod persistence;
pub mod signing;
pub mod strategy;

pub use config::AppConfig;
pub use coordination::{CancelToken, RetryPolicy, Shutdown};
pub use domain::{ExecutionState, Stage, Step};
pub use error::{LpFlowError, Result};
pub use persistence::StateRepository;
pub use signing::{Wallet, WalletDirectory};
pub use strategy::{FleetDriver, PositionManager, StepOrchestrator};
