use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::state_store::{version_conflict, StateStore};
use crate::domain::ExecutionState;
use crate::error::Result;

/// In-process store; state is lost on exit
#[derive(Default)]
pub struct MemoryStateStore {
    records: RwLock<HashMap<String, ExecutionState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, key: &str) -> Result<Option<ExecutionState>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn save(&self, state: &ExecutionState) -> Result<()> {
        let mut records = self.records.write().await;
        let stored = records.get(&state.wallet_address).map(|s| s.version);
        let expected = state.version - 1;
        if stored.unwrap_or(0) != expected {
            return Err(version_conflict(&state.wallet_address, expected, stored));
        }
        records.insert(state.wallet_address.clone(), state.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.records.write().await.remove(key).is_some())
    }

    async fn list(&self) -> Result<Vec<ExecutionState>> {
        Ok(self.records.read().await.values().cloned().collect())
    }
}
