use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use ethers::signers::coins_bip39::English;
use ethers::signers::{LocalWallet, MnemonicBuilder, Signer as EthersSigner};
use tracing::info;
use zeroize::Zeroize;

use crate::error::{LpFlowError, Result};

/// Standard Ethereum account path; the wallet index is the last component
pub const DERIVATION_PATH_PREFIX: &str = "m/44'/60'/0'/0/";

/// Signing key for one on-chain account
///
/// # Security
/// The raw key material is never stored outside the inner signer, and the
/// input strings used to build it are zeroized.
#[derive(Clone)]
pub struct Wallet {
    inner: LocalWallet,
    derivation_index: Option<u32>,
}

/// Derive the wallet at `index` from a BIP-39 mnemonic.
///
/// Pure: the same mnemonic and index always produce the same address.
pub fn derive_wallet(mnemonic: &str, index: u32) -> Result<Wallet> {
    let inner = MnemonicBuilder::<English>::default()
        .phrase(mnemonic)
        .index(index)
        .map_err(|e| LpFlowError::Wallet(format!("Invalid derivation index {}: {}", index, e)))?
        .build()
        .map_err(|e| LpFlowError::Wallet(format!("Invalid mnemonic: {}", e)))?;

    Ok(Wallet {
        inner,
        derivation_index: Some(index),
    })
}

impl Wallet {
    /// Create a wallet from a private key hex string
    pub fn from_private_key(private_key: &str) -> Result<Self> {
        let mut secure_key = private_key.trim().trim_start_matches("0x").to_string();

        let parsed = secure_key
            .parse::<LocalWallet>()
            .map_err(|e| LpFlowError::Wallet(format!("Invalid private key: {}", e)));

        secure_key.zeroize();

        let inner = parsed?;
        info!("Wallet initialized: {:?}", inner.address());
        Ok(Self {
            inner,
            derivation_index: None,
        })
    }

    /// Create a wallet from the environment variable named `var`
    pub fn from_env(var: &str) -> Result<Self> {
        let mut private_key = std::env::var(var).map_err(|_| {
            LpFlowError::ConfigMissing(format!("{} environment variable not set", var))
        })?;

        let result = Self::from_private_key(&private_key);
        private_key.zeroize();
        result
    }

    pub fn address(&self) -> Address {
        Address::from(self.inner.address().0)
    }

    pub fn derivation_index(&self) -> Option<u32> {
        self.derivation_index
    }

    /// Signer for alloy providers
    pub fn alloy_signer(&self) -> Result<PrivateKeySigner> {
        let mut key_bytes = self.inner.signer().to_bytes();
        let signer = PrivateKeySigner::from_slice(key_bytes.as_slice())
            .map_err(|e| LpFlowError::Signature(format!("Failed to build signer: {}", e)));
        key_bytes.as_mut_slice().zeroize();
        signer
    }
}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet")
            .field("address", &self.address())
            .field("derivation_index", &self.derivation_index)
            .finish()
    }
}
