//! Durable per-wallet execution state
//!
//! One record per wallet address. Writes are optimistic: a record carries a
//! `version`, and a store accepts a save only when it holds exactly the
//! previous version. [`StateRepository`] serializes read/modify/write per key
//! so a single process never races itself.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::domain::ExecutionState;
use crate::error::{LpFlowError, Result};

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<ExecutionState>>;

    /// Persist `state`, which must be one version ahead of the stored record
    /// (version 1 creates). Fails with `StateConflict` otherwise.
    async fn save(&self, state: &ExecutionState) -> Result<()>;

    /// Returns whether a record existed
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn list(&self) -> Result<Vec<ExecutionState>>;
}

pub(crate) fn version_conflict(key: &str, expected: i64, found: Option<i64>) -> LpFlowError {
    LpFlowError::StateConflict(format!(
        "{}: expected stored version {}, found {}",
        key,
        expected,
        found.map(|v| v.to_string()).unwrap_or_else(|| "none".into())
    ))
}

/// Checked read/modify/write over a [`StateStore`]
pub struct StateRepository {
    store: Arc<dyn StateStore>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl StateRepository {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn load(&self, key: &str) -> Result<Option<ExecutionState>> {
        self.store.load(key).await
    }

    /// Load the wallet's record, creating an `Idle` one on first run
    pub async fn load_or_create(&self, key: &str, derivation_index: u32) -> Result<ExecutionState> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        if let Some(existing) = self.store.load(key).await? {
            if existing.derivation_index != derivation_index {
                return Err(LpFlowError::StateConflict(format!(
                    "{} is recorded at derivation index {}, not {}",
                    key, existing.derivation_index, derivation_index
                )));
            }
            return Ok(existing);
        }

        let mut state = ExecutionState::new(key, derivation_index);
        state.version = 1;
        self.store.save(&state).await?;
        info!(wallet = key, derivation_index, "Created execution state");
        Ok(state)
    }

    /// Apply `f` to the stored record and persist the result atomically.
    ///
    /// Nothing is written when `f` fails.
    pub async fn update<F>(&self, key: &str, f: F) -> Result<ExecutionState>
    where
        F: FnOnce(&mut ExecutionState) -> Result<()> + Send,
    {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        let current = self
            .store
            .load(key)
            .await?
            .ok_or_else(|| LpFlowError::WalletNotFound(format!("no execution state for {}", key)))?;

        let mut next = current.clone();
        f(&mut next)?;
        next.version = current.version + 1;
        next.updated_at = Utc::now();

        self.store.save(&next).await?;
        debug!(wallet = key, step = %next.step, version = next.version, "State persisted");
        Ok(next)
    }

    /// Delete a wallet's record
    pub async fn reset(&self, key: &str) -> Result<bool> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        let existed = self.store.delete(key).await?;
        if existed {
            info!(wallet = key, "Execution state reset");
        }
        Ok(existed)
    }

    /// Every record, ordered by derivation index
    pub async fn list(&self) -> Result<Vec<ExecutionState>> {
        let mut states = self.store.list().await?;
        states.sort_by_key(|s| (s.derivation_index, s.wallet_address.clone()));
        Ok(states)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Stage, Step};
    use crate::persistence::MemoryStateStore;

    fn repo() -> StateRepository {
        StateRepository::new(Arc::new(MemoryStateStore::new()))
    }

    #[tokio::test]
    async fn load_or_create_is_idempotent() {
        let repo = repo();
        let first = repo.load_or_create("0xaa", 3).await.unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(first.step, Step::Idle);

        let again = repo.load_or_create("0xaa", 3).await.unwrap();
        assert_eq!(again, first);
        assert!(repo.load_or_create("0xaa", 4).await.is_err());
    }

    #[tokio::test]
    async fn update_bumps_version_and_persists() {
        let repo = repo();
        repo.load_or_create("0xaa", 0).await.unwrap();

        let updated = repo
            .update("0xaa", |s| s.begin(Stage::Fund))
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.step, Step::FundPending);
        assert_eq!(repo.load("0xaa").await.unwrap().unwrap(), updated);
    }

    #[tokio::test]
    async fn failed_mutation_writes_nothing() {
        let repo = repo();
        repo.load_or_create("0xaa", 0).await.unwrap();

        // Idle cannot jump to BridgeDone
        let result = repo.update("0xaa", |s| s.advance(Step::BridgeDone)).await;
        assert!(matches!(result, Err(LpFlowError::InvalidStateTransition { .. })));

        let stored = repo.load("0xaa").await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.step, Step::Idle);
    }

    #[tokio::test]
    async fn concurrent_updates_serialize() {
        let repo = Arc::new(repo());
        repo.load_or_create("0xaa", 0).await.unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let repo = repo.clone();
                tokio::spawn(async move {
                    repo.update("0xaa", |s| {
                        s.derivation_index += 1;
                        Ok(())
                    })
                    .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let stored = repo.load("0xaa").await.unwrap().unwrap();
        assert_eq!(stored.derivation_index, 16);
        assert_eq!(stored.version, 17);
    }

    #[tokio::test]
    async fn update_of_missing_record_fails() {
        let repo = repo();
        let err = repo.update("0xbb", |_| Ok(())).await.unwrap_err();
        assert!(matches!(err, LpFlowError::WalletNotFound(_)));
    }

    #[tokio::test]
    async fn reset_then_list() {
        let repo = repo();
        repo.load_or_create("0xaa", 1).await.unwrap();
        repo.load_or_create("0xbb", 0).await.unwrap();

        let listed = repo.list().await.unwrap();
        assert_eq!(listed[0].wallet_address, "0xbb");

        assert!(repo.reset("0xaa").await.unwrap());
        assert!(!repo.reset("0xaa").await.unwrap());
        assert_eq!(repo.list().await.unwrap().len(), 1);
    }
}
