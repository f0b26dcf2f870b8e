//! Fleet of deterministically derived wallets
//!
//! Every wallet is derived from one mnemonic by index, so the fleet can be
//! rebuilt on any machine. Nonce allocation is delegated to [`NonceManager`],
//! which serializes callers per address.

use alloy::primitives::Address;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;
use zeroize::Zeroizing;

use super::nonce_manager::NonceManager;
use super::wallet::{derive_wallet, Wallet};
use crate::adapters::ChainClient;
use crate::domain::ChainId;
use crate::error::{LpFlowError, Result};

/// Derived or imported signing account
#[derive(Debug, Clone)]
pub struct WalletRecord {
    pub address: Address,
    /// `None` for imported keys (the funder)
    pub derivation_index: Option<u32>,
    pub wallet: Wallet,
}

impl WalletRecord {
    pub fn from_wallet(wallet: Wallet) -> Self {
        Self {
            address: wallet.address(),
            derivation_index: wallet.derivation_index(),
            wallet,
        }
    }
}

pub struct WalletDirectory {
    mnemonic: Zeroizing<String>,
    records: DashMap<Address, Arc<WalletRecord>>,
    nonces: NonceManager,
}

impl WalletDirectory {
    pub fn new(mnemonic: impl Into<String>, chain: Arc<dyn ChainClient>) -> Self {
        Self {
            mnemonic: Zeroizing::new(mnemonic.into()),
            records: DashMap::new(),
            nonces: NonceManager::new(chain),
        }
    }

    /// Build from the mnemonic held in the environment variable `var`
    pub fn from_env(var: &str, chain: Arc<dyn ChainClient>) -> Result<Self> {
        let mnemonic = Zeroizing::new(crate::config::secret_from_env(var)?);
        // Fail on a bad phrase at startup rather than on first use
        derive_wallet(&mnemonic, 0)?;
        Ok(Self::new(mnemonic.as_str(), chain))
    }

    /// Derive (or fetch the cached) wallet at `index`
    pub fn wallet(&self, index: u32) -> Result<Arc<WalletRecord>> {
        let wallet = derive_wallet(&self.mnemonic, index)?;
        let address = wallet.address();
        let record = self
            .records
            .entry(address)
            .or_insert_with(|| Arc::new(WalletRecord::from_wallet(wallet)))
            .clone();
        Ok(record)
    }

    /// Derive the contiguous range `[start, start + count)`
    pub fn derive_range(&self, start: u32, count: u32) -> Result<Vec<Arc<WalletRecord>>> {
        let end = start.checked_add(count).ok_or_else(|| {
            LpFlowError::InvalidParameters(format!(
                "wallet range {}+{} overflows",
                start, count
            ))
        })?;
        let records = (start..end)
            .map(|index| self.wallet(index))
            .collect::<Result<Vec<_>>>()?;
        info!(start, count, "Derived wallet fleet");
        Ok(records)
    }

    /// Make an imported key (e.g. the funder) known to the directory
    pub fn register(&self, wallet: Wallet) -> Arc<WalletRecord> {
        let record = Arc::new(WalletRecord::from_wallet(wallet));
        self.records.insert(record.address, record.clone());
        record
    }

    pub fn get(&self, address: Address) -> Result<Arc<WalletRecord>> {
        self.records
            .get(&address)
            .map(|r| r.clone())
            .ok_or_else(|| LpFlowError::WalletNotFound(address.to_string()))
    }

    pub async fn allocate_nonce(&self, chain_id: ChainId, address: Address) -> Result<u64> {
        self.nonces.allocate(chain_id, address).await
    }

    pub async fn reset_nonce(&self, chain_id: ChainId, address: Address) -> Result<u64> {
        self.nonces.reset(chain_id, address).await
    }

    pub async fn release_nonce(&self, chain_id: ChainId, address: Address, nonce: u64) -> bool {
        self.nonces.release(chain_id, address, nonce).await
    }

    pub async fn cached_nonce(&self, chain_id: ChainId, address: Address) -> Option<u64> {
        self.nonces.cached(chain_id, address).await
    }
}
