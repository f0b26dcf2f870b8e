pub mod directory;
pub mod hmac;
pub mod nonce_manager;
pub mod wallet;

pub use directory::{WalletDirectory, WalletRecord};
pub use hmac::{ApiCredentials, HmacAuth};
pub use nonce_manager::NonceManager;
pub use wallet::{derive_wallet, Wallet};
