//! External collaborators
//!
//! - [`ChainClient`]: EVM reads and explicit-nonce transaction broadcast
//! - [`BridgeClient`]: cross-chain route quotes and transfer status
//! - [`ExchangeClient`]: centralized exchange withdrawals
//!
//! The dry-run decorators wrap any of these and replace every mutating call
//! with a logged, synthetic result.

pub mod alloy_chain;
pub mod bridge;
pub mod chain;
pub mod contracts;
pub mod dry_run;
pub mod exchange;
#[cfg(test)]
pub mod fakes;
pub mod http;

pub use alloy_chain::AlloyChainClient;
pub use bridge::{BridgeClient, BridgeStatus, LifiBridgeClient, Route, RouteRequest, StatusQuery};
pub use chain::ChainClient;
pub use dry_run::{is_synthetic, DryRunChain, DryRunExchange};
pub use exchange::{
    BinanceClient, ExchangeClient, WithdrawRequest, Withdrawal, WithdrawalStatus,
};
