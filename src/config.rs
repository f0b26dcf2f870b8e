use alloy::primitives::Address;
use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{LpFlowError, Result};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Dry run mode: compute and log, never mutate
    #[serde(default)]
    pub dry_run: bool,
    pub wallets: WalletsConfig,
    pub funding: FundingConfig,
    #[serde(default)]
    pub exchange: Option<ExchangeConfig>,
    pub chains: ChainsConfig,
    pub bridge: BridgeConfig,
    pub pool: PoolConfig,
    #[serde(default)]
    pub liquidity: LiquidityConfig,
    #[serde(default)]
    pub distribution: DistributionConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub throttle: ThrottleConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletsConfig {
    /// Environment variable holding the BIP-39 mnemonic
    #[serde(default = "default_mnemonic_env")]
    pub mnemonic_env: String,
    /// Number of wallets in the fleet
    pub count: u32,
    /// First derivation index
    #[serde(default)]
    pub start_index: u32,
}

fn default_mnemonic_env() -> String {
    "LPFLOW_MNEMONIC".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FundingSource {
    /// Withdraw from the centralized exchange into each wallet
    Exchange,
    /// Transfer from a funder key on the source chain
    Funder,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingConfig {
    pub source: FundingSource,
    /// Environment variable holding the funder private key (funder source)
    #[serde(default = "default_funder_key_env")]
    pub funder_key_env: String,
    /// Pooled amount to spread across the fleet, in source-token units
    pub total_amount: Decimal,
    /// Per-wallet target; defaults to an even split
    #[serde(default)]
    pub per_wallet_target: Option<Decimal>,
    #[serde(default)]
    pub randomize: bool,
    /// Percent variance around the target when randomized
    #[serde(default = "default_variance_pct")]
    pub variance_pct: Decimal,
    /// Floor for every wallet's allocation
    #[serde(default)]
    pub min_per_wallet: Decimal,
    /// Native amount left behind for gas when bridging native value
    #[serde(default = "default_gas_reserve")]
    pub gas_reserve: Decimal,
    #[serde(default = "default_withdrawal_timeout_secs")]
    pub withdrawal_timeout_secs: u64,
}

fn default_funder_key_env() -> String {
    "LPFLOW_FUNDER_KEY".to_string()
}

fn default_variance_pct() -> Decimal {
    Decimal::from(10)
}

fn default_gas_reserve() -> Decimal {
    Decimal::new(2, 3)
}

fn default_withdrawal_timeout_secs() -> u64 {
    1800
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_api_secret_env")]
    pub api_secret_env: String,
    /// Asset symbol withdrawn (e.g. "USDC")
    pub asset: String,
    /// Exchange network code for the source chain (e.g. "ARBITRUM")
    pub network: String,
}

fn default_api_key_env() -> String {
    "LPFLOW_EXCHANGE_API_KEY".to_string()
}

fn default_api_secret_env() -> String {
    "LPFLOW_EXCHANGE_API_SECRET".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainsConfig {
    pub source: ChainEndpoint,
    pub destination: ChainEndpoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainEndpoint {
    pub chain_id: u64,
    pub rpc_url: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Token funded and bridged on the source chain; `None` is the native coin
    #[serde(default)]
    pub token: Option<Address>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub base_url: String,
    #[serde(default = "default_integrator")]
    pub integrator: String,
    /// Token received on the destination chain (must be one side of the pool)
    pub destination_token: Address,
    /// Accepted slippage as a fraction (0.005 = 0.5%)
    #[serde(default = "default_bridge_slippage")]
    pub slippage: Decimal,
    /// Minimum amount worth bridging, in source-token units
    #[serde(default)]
    pub min_amount: Decimal,
    #[serde(default = "default_bridge_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_integrator() -> String {
    "lpflow".to_string()
}

fn default_bridge_slippage() -> Decimal {
    Decimal::new(5, 3)
}

fn default_bridge_timeout_secs() -> u64 {
    1800
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub token0: Address,
    pub token1: Address,
    /// Fee tier in hundredths of a bip (500, 3000, 10000)
    pub fee: u32,
    pub factory: Address,
    pub quoter: Address,
    pub swap_router: Address,
    pub position_manager: Address,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidityConfig {
    /// Half-width of the position range as a fraction (0.05 = ±5%)
    pub range_pct: f64,
    /// Percent of harvested value reinvested
    pub reinvest_pct: Decimal,
    /// Fee value must exceed gas cost times this multiplier
    pub safety_multiplier: Decimal,
    /// Price move (percent) from the rebalance reference that forces a rebalance
    pub price_deviation_pct: Decimal,
    pub harvest_interval_secs: u64,
    pub post_open_collect_delay_secs: u64,
    pub slippage_bps: u32,
    /// Gas units budgeted for one harvest
    pub harvest_gas_units: u64,
    /// Native coin price in pool quote (token1) units, used for gas valuation
    pub native_price_in_quote: Decimal,
    /// Cash-out is converted into this pool token when set
    #[serde(default)]
    pub settlement_token: Option<Address>,
    /// Cash-out is sent here when set; otherwise it stays in the wallet
    #[serde(default)]
    pub cash_out_address: Option<Address>,
    pub rebalance_timeout_secs: u64,
}

impl Default for LiquidityConfig {
    fn default() -> Self {
        Self {
            range_pct: 0.05,
            reinvest_pct: Decimal::from(50),
            safety_multiplier: Decimal::from(3),
            price_deviation_pct: Decimal::from(5),
            harvest_interval_secs: 3600,
            post_open_collect_delay_secs: 60,
            slippage_bps: 50,
            harvest_gas_units: 350_000,
            native_price_in_quote: Decimal::ZERO,
            settlement_token: None,
            cash_out_address: None,
            rebalance_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionConfig {
    pub batch_size: usize,
    pub inter_batch_delay_ms: u64,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            inter_batch_delay_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Jitter as a fraction of the computed delay
    pub jitter: f64,
    /// Whether unclassified failures are retried
    pub retry_unclassified: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: 0.2,
            retry_unclassified: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    pub rpc_spacing_ms: u64,
    pub bridge_spacing_ms: u64,
    pub exchange_spacing_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            rpc_spacing_ms: 50,
            bridge_spacing_ms: 1000,
            exchange_spacing_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Wallet pipelines allowed to run at once
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    /// Bound on waiting for funds to show up before acting on them
    pub settle_timeout_secs: u64,
    pub receipt_timeout_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval_ms: 5000,
            settle_timeout_secs: 900,
            receipt_timeout_secs: 300,
        }
    }
}

impl OrchestratorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settle_timeout(&self) -> Duration {
        Duration::from_secs(self.settle_timeout_secs)
    }

    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_secs(self.receipt_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateBackend {
    File,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    pub backend: StateBackend,
    /// Directory for the file backend
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// PostgreSQL connection URL for the postgres backend
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: StateBackend::File,
            dir: None,
            database_url: None,
            max_connections: default_max_connections(),
        }
    }
}

impl StateConfig {
    /// State directory, falling back to the platform data dir
    pub fn resolved_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("lpflow")
                .join("state")
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> std::result::Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> std::result::Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("dry_run", false)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(
                File::from(config_dir.join(
                    std::env::var("LPFLOW_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // LPFLOW_ORCHESTRATOR__CONCURRENCY=8 etc.
            .add_source(
                Environment::with_prefix("LPFLOW")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Load a single config file (the `--config` flag)
    pub fn load_file<P: AsRef<Path>>(path: P) -> std::result::Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(
                Environment::with_prefix("LPFLOW")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Reject inconsistent settings before any wallet is touched
    pub fn validate(&self) -> Result<()> {
        if self.wallets.count == 0 {
            return Err(LpFlowError::InvalidParameters(
                "wallets.count must be at least 1".into(),
            ));
        }
        if self.funding.source == FundingSource::Exchange && self.exchange.is_none() {
            return Err(LpFlowError::ConfigMissing(
                "[exchange] section is required when funding.source = \"exchange\"".into(),
            ));
        }
        if self.funding.total_amount <= Decimal::ZERO {
            return Err(LpFlowError::InvalidParameters(
                "funding.total_amount must be positive".into(),
            ));
        }
        let variance = self.funding.variance_pct;
        if variance < Decimal::ZERO || variance >= Decimal::from(100) {
            return Err(LpFlowError::InvalidParameters(
                "funding.variance_pct must be in [0, 100)".into(),
            ));
        }
        if self.pool.token0 >= self.pool.token1 {
            return Err(LpFlowError::InvalidParameters(
                "pool.token0 must sort below pool.token1".into(),
            ));
        }
        if self.bridge.destination_token != self.pool.token0
            && self.bridge.destination_token != self.pool.token1
        {
            return Err(LpFlowError::InvalidParameters(
                "bridge.destination_token must be one of the pool tokens".into(),
            ));
        }
        if let Some(settlement) = self.liquidity.settlement_token {
            if settlement != self.pool.token0 && settlement != self.pool.token1 {
                return Err(LpFlowError::InvalidParameters(
                    "liquidity.settlement_token must be one of the pool tokens".into(),
                ));
            }
        }
        if self.pool.fee == 0 || self.pool.fee >= 1_000_000 {
            return Err(LpFlowError::InvalidParameters(format!(
                "pool.fee {} out of range",
                self.pool.fee
            )));
        }
        if !(self.liquidity.range_pct > 0.0 && self.liquidity.range_pct.is_finite()) {
            return Err(LpFlowError::InvalidParameters(
                "liquidity.range_pct must be positive".into(),
            ));
        }
        if self.liquidity.reinvest_pct < Decimal::ZERO
            || self.liquidity.reinvest_pct > Decimal::from(100)
        {
            return Err(LpFlowError::InvalidParameters(
                "liquidity.reinvest_pct must be in [0, 100]".into(),
            ));
        }
        if self.distribution.batch_size == 0 || self.orchestrator.concurrency == 0 {
            return Err(LpFlowError::InvalidParameters(
                "distribution.batch_size and orchestrator.concurrency must be at least 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(LpFlowError::InvalidParameters(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.state.backend == StateBackend::Postgres && self.state.database_url.is_none() {
            return Err(LpFlowError::ConfigMissing(
                "state.database_url is required for the postgres backend".into(),
            ));
        }
        Ok(())
    }
}

/// Read a secret from the environment variable named in config
pub fn secret_from_env(var: &str) -> Result<String> {
    std::env::var(var)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| LpFlowError::ConfigMissing(format!("environment variable {} not set", var)))
}
