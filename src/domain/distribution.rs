use alloy::primitives::{Address, TxHash};
use serde::{Deserialize, Serialize};

/// One transfer in a distribution plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub recipient: Address,
    pub amount: u128,
}

/// Ordered split of a pooled balance; amounts sum exactly to `total`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionPlan {
    pub entries: Vec<PlanEntry>,
    pub total: u128,
}

impl DistributionPlan {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn amount_for(&self, recipient: Address) -> Option<u128> {
        self.entries
            .iter()
            .find(|e| e.recipient == recipient)
            .map(|e| e.amount)
    }

    pub fn sum(&self) -> u128 {
        self.entries.iter().map(|e| e.amount).sum()
    }
}

/// A transfer that failed inside a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientError {
    pub recipient: Address,
    pub amount: u128,
    pub reason: String,
}

/// Result of executing a plan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionOutcome {
    pub succeeded_amount: u128,
    pub transaction_hashes: Vec<TxHash>,
    pub per_recipient_errors: Vec<RecipientError>,
}

impl DistributionOutcome {
    pub fn all_succeeded(&self) -> bool {
        self.per_recipient_errors.is_empty()
    }
}
