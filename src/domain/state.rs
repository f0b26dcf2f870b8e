use alloy::primitives::TxHash;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::position::{FeeSnapshot, HarvestBreakdown, Position, RebalanceDecision};
use crate::config::FundingSource;
use crate::error::{LpFlowError, Result};

/// Pipeline stages in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage {
    Fund,
    Bridge,
    Swap,
    Position,
    Collect,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Fund,
        Stage::Bridge,
        Stage::Swap,
        Stage::Position,
        Stage::Collect,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Fund => "fund",
            Stage::Bridge => "bridge",
            Stage::Swap => "swap",
            Stage::Position => "position",
            Stage::Collect => "collect",
        }
    }

    pub fn pending(&self) -> Step {
        match self {
            Stage::Fund => Step::FundPending,
            Stage::Bridge => Step::BridgePending,
            Stage::Swap => Step::SwapPending,
            Stage::Position => Step::PositionPending,
            Stage::Collect => Step::CollectPending,
        }
    }

    pub fn done(&self) -> Step {
        match self {
            Stage::Fund => Step::FundDone,
            Stage::Bridge => Step::BridgeDone,
            Stage::Swap => Step::SwapDone,
            Stage::Position => Step::PositionDone,
            Stage::Collect => Step::CollectDone,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-wallet pipeline state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Step {
    /// Nothing started
    Idle,
    FundPending,
    FundDone,
    BridgePending,
    BridgeDone,
    SwapPending,
    SwapDone,
    PositionPending,
    PositionDone,
    CollectPending,
    /// Terminal success
    CollectDone,
    /// Terminal failure; reason lives in `ExecutionState::failure`
    Error,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Idle => "IDLE",
            Step::FundPending => "FUND_PENDING",
            Step::FundDone => "FUND_DONE",
            Step::BridgePending => "BRIDGE_PENDING",
            Step::BridgeDone => "BRIDGE_DONE",
            Step::SwapPending => "SWAP_PENDING",
            Step::SwapDone => "SWAP_DONE",
            Step::PositionPending => "POSITION_PENDING",
            Step::PositionDone => "POSITION_DONE",
            Step::CollectPending => "COLLECT_PENDING",
            Step::CollectDone => "COLLECT_DONE",
            Step::Error => "ERROR",
        }
    }

    /// Stage that must run to move this step forward
    pub fn active_stage(&self) -> Option<Stage> {
        use Step::*;

        match self {
            Idle | FundPending => Some(Stage::Fund),
            FundDone | BridgePending => Some(Stage::Bridge),
            BridgeDone | SwapPending => Some(Stage::Swap),
            SwapDone | PositionPending => Some(Stage::Position),
            PositionDone | CollectPending => Some(Stage::Collect),
            CollectDone | Error => None,
        }
    }

    /// Check if this step can transition to another step
    pub fn can_transition_to(&self, target: Step) -> bool {
        use Step::*;

        match (self, target) {
            (Idle, FundPending) => true,
            (FundPending, FundDone) => true,
            (FundDone, BridgePending) => true,
            (BridgePending, BridgeDone) => true,
            (BridgeDone, SwapPending) => true,
            (SwapPending, SwapDone) => true,
            (SwapDone, PositionPending) => true,
            (PositionPending, PositionDone) => true,
            (PositionDone, CollectPending) => true,
            (CollectPending, CollectDone) => true,

            // Any live step may fail
            (from, Error) => !from.is_terminal(),

            _ => false,
        }
    }

    /// Get valid next steps from current step
    pub fn valid_transitions(&self) -> Vec<Step> {
        use Step::*;

        let forward = match self {
            Idle => FundPending,
            FundPending => FundDone,
            FundDone => BridgePending,
            BridgePending => BridgeDone,
            BridgeDone => SwapPending,
            SwapPending => SwapDone,
            SwapDone => PositionPending,
            PositionPending => PositionDone,
            PositionDone => CollectPending,
            CollectPending => CollectDone,
            CollectDone | Error => return Vec::new(),
        };
        vec![forward, Error]
    }

    /// Checked transition
    pub fn transition(self, target: Step) -> Result<Step> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(LpFlowError::InvalidStateTransition {
                from: self.to_string(),
                to: target.to_string(),
            })
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Step::CollectDone | Step::Error)
    }

    /// Position of this step in the forward ordering
    pub fn ordinal(&self) -> u8 {
        use Step::*;

        match self {
            Idle => 0,
            FundPending => 1,
            FundDone => 2,
            BridgePending => 3,
            BridgeDone => 4,
            SwapPending => 5,
            SwapDone => 6,
            PositionPending => 7,
            PositionDone => 8,
            CollectPending => 9,
            CollectDone => 10,
            Error => u8::MAX,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for Step {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, String> {
        match s.to_uppercase().as_str() {
            "IDLE" => Ok(Step::Idle),
            "FUND_PENDING" => Ok(Step::FundPending),
            "FUND_DONE" => Ok(Step::FundDone),
            "BRIDGE_PENDING" => Ok(Step::BridgePending),
            "BRIDGE_DONE" => Ok(Step::BridgeDone),
            "SWAP_PENDING" => Ok(Step::SwapPending),
            "SWAP_DONE" => Ok(Step::SwapDone),
            "POSITION_PENDING" => Ok(Step::PositionPending),
            "POSITION_DONE" => Ok(Step::PositionDone),
            "COLLECT_PENDING" => Ok(Step::CollectPending),
            "COLLECT_DONE" => Ok(Step::CollectDone),
            "ERROR" => Ok(Step::Error),
            _ => Err(format!("Unknown step: {}", s)),
        }
    }
}

/// Funding result snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundRecord {
    pub source: FundingSource,
    /// Planned allocation in raw source-token units
    pub amount: u128,
    /// Client-side withdrawal id (exchange source)
    #[serde(default)]
    pub withdrawal_id: Option<String>,
    #[serde(default)]
    pub tx_hash: Option<TxHash>,
    /// Source-token balance before funding, used to detect arrival
    #[serde(default)]
    pub balance_before: u128,
    #[serde(default)]
    pub received: Option<u128>,
}

/// Bridge result snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeRecord {
    pub tool: String,
    pub from_amount: u128,
    pub to_amount_min: u128,
    #[serde(default)]
    pub tx_hash: Option<TxHash>,
    /// Destination-token balance before the bridge landed
    #[serde(default)]
    pub destination_balance_before: u128,
    #[serde(default)]
    pub received: Option<u128>,
    #[serde(default)]
    pub receiving_tx: Option<String>,
}

/// Swap result snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapRecord {
    pub token_in: alloy::primitives::Address,
    pub token_out: alloy::primitives::Address,
    pub amount_in: u128,
    pub min_amount_out: u128,
    #[serde(default)]
    pub out_balance_before: u128,
    #[serde(default)]
    pub tx_hash: Option<TxHash>,
    #[serde(default)]
    pub amount_out: Option<u128>,
}

/// Position-open result snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionOpenRecord {
    pub tick_lower: i32,
    pub tick_upper: i32,
    pub amount0_desired: u128,
    pub amount1_desired: u128,
    #[serde(default)]
    pub tx_hash: Option<TxHash>,
}

/// Harvest sub-actions, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HarvestAction {
    Collect,
    Reinvest,
    CashOutSwap,
    CashOutTransfer0,
    CashOutTransfer1,
    DecreaseLiquidity,
    RebalanceSwap,
    Mint,
}

impl HarvestAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HarvestAction::Collect => "collect",
            HarvestAction::Reinvest => "reinvest",
            HarvestAction::CashOutSwap => "cash_out_swap",
            HarvestAction::CashOutTransfer0 => "cash_out_transfer0",
            HarvestAction::CashOutTransfer1 => "cash_out_transfer1",
            HarvestAction::DecreaseLiquidity => "decrease_liquidity",
            HarvestAction::RebalanceSwap => "rebalance_swap",
            HarvestAction::Mint => "mint",
        }
    }
}

impl fmt::Display for HarvestAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One sub-action of a harvest cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action: HarvestAction,
    /// `None` when the action had nothing to do
    #[serde(default)]
    pub tx_hash: Option<TxHash>,
    pub confirmed: bool,
}

/// Harvest cycle snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectRecord {
    pub decision: RebalanceDecision,
    /// Owed fees observed when the cycle started
    #[serde(default)]
    pub fees: Option<FeeSnapshot>,
    #[serde(default)]
    pub breakdown: Option<HarvestBreakdown>,
    #[serde(default)]
    pub actions: Vec<ActionRecord>,
    /// Minimum output of the cash-out swap into the settlement token
    #[serde(default)]
    pub cash_out_swap_out: Option<u128>,
    /// Settlement-token balance just before the cash-out swap
    #[serde(default)]
    pub cash_out_balance_before: Option<u128>,
    /// Settlement tokens the cash-out swap actually delivered
    #[serde(default)]
    pub cash_out_received: Option<u128>,
    /// Owed fees were zero; nothing was sent
    #[serde(default)]
    pub noop: bool,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl CollectRecord {
    pub fn new(decision: RebalanceDecision, fees: FeeSnapshot) -> Self {
        Self {
            decision,
            fees: Some(fees),
            breakdown: None,
            actions: Vec::new(),
            cash_out_swap_out: None,
            cash_out_balance_before: None,
            cash_out_received: None,
            noop: false,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn action(&self, action: HarvestAction) -> Option<&ActionRecord> {
        self.actions.iter().find(|a| a.action == action)
    }

    pub fn record_submitted(&mut self, action: HarvestAction, tx_hash: TxHash) {
        self.actions.retain(|a| a.action != action);
        self.actions.push(ActionRecord {
            action,
            tx_hash: Some(tx_hash),
            confirmed: false,
        });
    }

    /// Mark an action that needed no transaction as done
    pub fn record_skipped(&mut self, action: HarvestAction) {
        self.actions.retain(|a| a.action != action);
        self.actions.push(ActionRecord {
            action,
            tx_hash: None,
            confirmed: true,
        });
    }

    pub fn record_confirmed(&mut self, action: HarvestAction) {
        if let Some(entry) = self.actions.iter_mut().find(|a| a.action == action) {
            entry.confirmed = true;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

/// Failure details attached to the `Error` step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub stage: Stage,
    /// Step the wallet was in when it failed; an operator retry resumes here
    pub failed_at_step: Step,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Durable per-wallet execution record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub wallet_address: String,
    pub derivation_index: u32,
    pub step: Step,
    #[serde(default)]
    pub fund: Option<FundRecord>,
    #[serde(default)]
    pub bridge: Option<BridgeRecord>,
    #[serde(default)]
    pub swap: Option<SwapRecord>,
    #[serde(default)]
    pub position_open: Option<PositionOpenRecord>,
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default)]
    pub collect: Option<CollectRecord>,
    #[serde(default)]
    pub failure: Option<FailureRecord>,
    /// Incremented on every persisted write
    #[serde(default)]
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionState {
    pub fn new(wallet_address: impl Into<String>, derivation_index: u32) -> Self {
        let now = Utc::now();
        Self {
            wallet_address: wallet_address.into(),
            derivation_index,
            step: Step::Idle,
            fund: None,
            bridge: None,
            swap: None,
            position_open: None,
            position: None,
            collect: None,
            failure: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `target`, rejecting anything but the next forward step or `Error`
    pub fn advance(&mut self, target: Step) -> Result<()> {
        self.step = self.step.transition(target)?;
        Ok(())
    }

    /// Enter the stage's pending step if not already there
    pub fn begin(&mut self, stage: Stage) -> Result<()> {
        if self.step == stage.pending() {
            return Ok(());
        }
        self.advance(stage.pending())
    }

    pub fn complete(&mut self, stage: Stage) -> Result<()> {
        self.advance(stage.done())
    }

    /// Record a terminal failure
    pub fn fail(&mut self, stage: Stage, reason: impl Into<String>) -> Result<()> {
        let failed_at_step = self.step;
        self.advance(Step::Error)?;
        self.failure = Some(FailureRecord {
            stage,
            failed_at_step,
            reason: reason.into(),
            at: Utc::now(),
        });
        Ok(())
    }

    /// Operator retry: leave `Error` and resume at the step that failed.
    /// Recorded stage snapshots are kept so submitted transfers are re-polled, not re-sent.
    pub fn reopen(&mut self) -> Result<()> {
        if self.step != Step::Error {
            return Err(LpFlowError::InvalidStateTransition {
                from: self.step.to_string(),
                to: "reopen".into(),
            });
        }
        let failure = self.failure.take().ok_or_else(|| {
            LpFlowError::StateConflict(format!(
                "{} is in ERROR without a failure record",
                self.wallet_address
            ))
        })?;
        self.step = failure.failed_at_step;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.step == Step::CollectDone
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure.as_ref().map(|f| f.reason.as_str())
    }
}
