use alloy::primitives::Address;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::adapters::ChainClient;
use crate::domain::ChainId;
use crate::error::{LpFlowError, Result};

/// Nonce manager for atomic nonce allocation per (chain, address)
///
/// # How it works
/// 1. Each address has its own lock; different addresses never wait on each other
/// 2. Under the lock the chain's pending count is read and merged with the cache
/// 3. A released nonce below the cache is handed out again before anything new
/// 4. Otherwise the larger of the two is handed out and the cache moves one past it
/// 5. After a stale-nonce rejection the cache is dropped and re-read from the chain
///
/// # Example
/// ```rust,ignore
/// let nonces = NonceManager::new(chain_client);
///
/// let nonce = nonces.allocate(8453, address).await?;
/// // ... sign and send with `nonce` ...
///
/// // Node said "nonce too low"
/// nonces.reset(8453, address).await?;
/// ```
pub struct NonceManager {
    chain: Arc<dyn ChainClient>,
    slots: DashMap<(ChainId, Address), Arc<Mutex<NonceSlot>>>,
}

#[derive(Debug, Default)]
struct NonceSlot {
    /// Next fresh nonce
    next: Option<u64>,
    /// Allocated below `next` but never broadcast
    released: BTreeSet<u64>,
}

impl NonceManager {
    pub fn new(chain: Arc<dyn ChainClient>) -> Self {
        Self {
            chain,
            slots: DashMap::new(),
        }
    }

    fn slot(&self, chain_id: ChainId, address: Address) -> Arc<Mutex<NonceSlot>> {
        self.slots
            .entry((chain_id, address))
            .or_default()
            .clone()
    }

    /// Allocate the next nonce atomically
    ///
    /// Concurrent callers for one address receive distinct values, lowest
    /// unused first. A failed chain query leaves the cache untouched.
    pub async fn allocate(&self, chain_id: ChainId, address: Address) -> Result<u64> {
        let slot = self.slot(chain_id, address);
        let mut slot = slot.lock().await;

        let on_chain = self.query_pending(chain_id, address).await?;

        // Holes the chain has moved past were filled by someone else
        slot.released = slot.released.split_off(&on_chain);
        if let Some(hole) = slot.released.pop_first() {
            debug!(chain_id, %address, nonce = hole, on_chain, "Reissued released nonce");
            return Ok(hole);
        }

        let next = match slot.next {
            Some(local) => local.max(on_chain),
            None => on_chain,
        };
        slot.next = Some(next + 1);

        debug!(
            chain_id,
            %address,
            nonce = next,
            on_chain,
            "Allocated nonce"
        );
        Ok(next)
    }

    /// Resynchronize the cache from the chain
    ///
    /// # Returns
    /// The chain's pending count, which is the next nonce to be allocated
    pub async fn reset(&self, chain_id: ChainId, address: Address) -> Result<u64> {
        let slot = self.slot(chain_id, address);
        let mut slot = slot.lock().await;

        let on_chain = self.query_pending(chain_id, address).await?;
        let previous = slot.next.replace(on_chain);
        slot.released.clear();

        info!(
            chain_id,
            %address,
            previous = ?previous,
            on_chain,
            "Nonce cache resynchronized"
        );
        Ok(on_chain)
    }

    /// Hand back a nonce whose transaction was never broadcast
    ///
    /// The most recent allocation rolls the cache back. An older one is kept
    /// as a hole and handed out by the next `allocate`, so later transactions
    /// from the address do not queue behind it. Returns false for a nonce
    /// that was never allocated.
    pub async fn release(&self, chain_id: ChainId, address: Address, nonce: u64) -> bool {
        let slot = self.slot(chain_id, address);
        let mut slot = slot.lock().await;

        let Some(next) = slot.next else {
            return false;
        };
        if nonce >= next || slot.released.contains(&nonce) {
            return false;
        }

        if nonce + 1 == next {
            // Fold trailing holes back into the cache
            let mut next = nonce;
            while next > 0 && slot.released.remove(&(next - 1)) {
                next -= 1;
            }
            slot.next = Some(next);
        } else {
            slot.released.insert(nonce);
        }
        debug!(chain_id, %address, nonce, "Released unused nonce");
        true
    }

    /// Cached next nonce, if any allocation happened
    pub async fn cached(&self, chain_id: ChainId, address: Address) -> Option<u64> {
        let slot = self.slots.get(&(chain_id, address))?.clone();
        let slot = slot.lock().await;
        slot.next
    }

    async fn query_pending(&self, chain_id: ChainId, address: Address) -> Result<u64> {
        self.chain
            .pending_nonce(chain_id, address)
            .await
            .map_err(|e| match e {
                LpFlowError::Network(_) | LpFlowError::RateLimited { .. } => e,
                other => LpFlowError::Network(format!(
                    "pending nonce query for {} failed: {}",
                    address, other
                )),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::fakes::FakeChain;
    use alloy::primitives::address;
    use std::collections::HashSet;

    const CHAIN: ChainId = 8453;

    #[tokio::test]
    async fn concurrent_allocations_are_consecutive() {
        let account = address!("00000000000000000000000000000000000000a1");
        let fake = Arc::new(FakeChain::new());
        fake.set_pending_nonce(CHAIN, account, 7);
        let nonces = Arc::new(NonceManager::new(fake.clone()));

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let nonces = nonces.clone();
                tokio::spawn(async move { nonces.allocate(CHAIN, account).await })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            assert!(seen.insert(handle.await.unwrap().unwrap()));
        }
        let expected: HashSet<u64> = (7..27).collect();
        assert_eq!(seen, expected);
        assert_eq!(nonces.cached(CHAIN, account).await, Some(27));
    }

    #[tokio::test]
    async fn chain_ahead_of_cache_wins() {
        let account = address!("00000000000000000000000000000000000000a2");
        let fake = Arc::new(FakeChain::new());
        fake.set_pending_nonce(CHAIN, account, 3);
        let nonces = NonceManager::new(fake.clone());

        assert_eq!(nonces.allocate(CHAIN, account).await.unwrap(), 3);
        // Another process sent two transactions from the same key
        fake.set_pending_nonce(CHAIN, account, 6);
        assert_eq!(nonces.allocate(CHAIN, account).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn query_failure_leaves_cache_untouched() {
        let account = address!("00000000000000000000000000000000000000a3");
        let fake = Arc::new(FakeChain::new());
        fake.set_pending_nonce(CHAIN, account, 10);
        let nonces = NonceManager::new(fake.clone());

        assert_eq!(nonces.allocate(CHAIN, account).await.unwrap(), 10);
        fake.fail_nonce_queries(true);
        let err = nonces.allocate(CHAIN, account).await.unwrap_err();
        assert!(matches!(err, LpFlowError::Network(_)));
        assert_eq!(nonces.cached(CHAIN, account).await, Some(11));

        fake.fail_nonce_queries(false);
        assert_eq!(nonces.allocate(CHAIN, account).await.unwrap(), 11);
    }

    #[tokio::test]
    async fn reset_drops_a_stale_cache() {
        let account = address!("00000000000000000000000000000000000000a4");
        let fake = Arc::new(FakeChain::new());
        fake.set_pending_nonce(CHAIN, account, 0);
        let nonces = NonceManager::new(fake.clone());

        for _ in 0..3 {
            nonces.allocate(CHAIN, account).await.unwrap();
        }
        // Two of those were dropped by the node
        fake.set_pending_nonce(CHAIN, account, 1);
        assert_eq!(nonces.reset(CHAIN, account).await.unwrap(), 1);
        assert_eq!(nonces.allocate(CHAIN, account).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn latest_release_rolls_the_cache_back() {
        let account = address!("00000000000000000000000000000000000000a5");
        let fake = Arc::new(FakeChain::new());
        fake.set_pending_nonce(CHAIN, account, 2);
        let nonces = NonceManager::new(fake.clone());

        nonces.allocate(CHAIN, account).await.unwrap();
        let second = nonces.allocate(CHAIN, account).await.unwrap();
        assert!(nonces.release(CHAIN, account, second).await);
        assert_eq!(nonces.cached(CHAIN, account).await, Some(second));
        assert_eq!(nonces.allocate(CHAIN, account).await.unwrap(), second);
        assert!(!nonces.release(CHAIN, account, 40).await);
    }

    #[tokio::test]
    async fn older_release_is_reissued_first() {
        let account = address!("00000000000000000000000000000000000000a6");
        let fake = Arc::new(FakeChain::new());
        fake.set_pending_nonce(CHAIN, account, 5);
        let nonces = NonceManager::new(fake.clone());

        assert_eq!(nonces.allocate(CHAIN, account).await.unwrap(), 5);
        assert_eq!(nonces.allocate(CHAIN, account).await.unwrap(), 6);
        // 5 failed before broadcast while 6 is in flight
        assert!(nonces.release(CHAIN, account, 5).await);
        assert!(!nonces.release(CHAIN, account, 5).await);

        assert_eq!(nonces.allocate(CHAIN, account).await.unwrap(), 5);
        assert_eq!(nonces.allocate(CHAIN, account).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn releasing_the_tail_folds_earlier_holes() {
        let account = address!("00000000000000000000000000000000000000a7");
        let fake = Arc::new(FakeChain::new());
        let nonces = NonceManager::new(fake.clone());

        for expected in 0..3 {
            assert_eq!(nonces.allocate(CHAIN, account).await.unwrap(), expected);
        }
        assert!(nonces.release(CHAIN, account, 1).await);
        assert!(nonces.release(CHAIN, account, 2).await);
        assert_eq!(nonces.cached(CHAIN, account).await, Some(1));
        assert_eq!(nonces.allocate(CHAIN, account).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn holes_the_chain_passed_are_dropped() {
        let account = address!("00000000000000000000000000000000000000a8");
        let fake = Arc::new(FakeChain::new());
        let nonces = NonceManager::new(fake.clone());

        nonces.allocate(CHAIN, account).await.unwrap();
        nonces.allocate(CHAIN, account).await.unwrap();
        assert!(nonces.release(CHAIN, account, 0).await);
        // Another process used nonces 0 and 1
        fake.set_pending_nonce(CHAIN, account, 2);
        assert_eq!(nonces.allocate(CHAIN, account).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn addresses_do_not_share_caches() {
        let a = address!("00000000000000000000000000000000000000b1");
        let b = address!("00000000000000000000000000000000000000b2");
        let fake = Arc::new(FakeChain::new());
        fake.set_pending_nonce(CHAIN, a, 4);
        fake.set_pending_nonce(CHAIN, b, 9);
        let nonces = NonceManager::new(fake.clone());

        assert_eq!(nonces.allocate(CHAIN, a).await.unwrap(), 4);
        assert_eq!(nonces.allocate(CHAIN, b).await.unwrap(), 9);
        assert_eq!(nonces.allocate(CHAIN, a).await.unwrap(), 5);
    }
}
