use lpflow::adapters::{
    AlloyChainClient, BinanceClient, BridgeClient, ChainClient, DryRunChain, DryRunExchange,
    ExchangeClient, LifiBridgeClient,
};
use lpflow::config::{AppConfig, FundingSource, LoggingConfig, StateBackend, StateConfig};
use lpflow::coordination::CancelToken;
use lpflow::error::{LpFlowError, Result};
use lpflow::persistence::{FileStateStore, PostgresStateStore, StateRepository, StateStore};
use lpflow::signing::{ApiCredentials, Wallet, WalletDirectory};
use lpflow::strategy::ExecutionContext;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

pub fn load_config(path: Option<&str>, dry_run: bool) -> Result<AppConfig> {
    let mut config = match path {
        Some(path) => AppConfig::load_file(path)?,
        None => AppConfig::load()?,
    };
    config.dry_run |= dry_run;
    config.validate()?;
    Ok(config)
}

pub fn init_logging(config: &LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},sqlx=warn,hyper=warn", config.level)));

    // File logging only when LPFLOW_LOG_DIR is set.
    //
    // `tracing_appender::rolling::daily` panics if it can't create the
    // initial log file, so writability is checked first.
    let log_dir = std::env::var("LPFLOW_LOG_DIR").ok();
    let file_layer = log_dir.as_deref().and_then(|dir| {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "Warning: Could not create log directory {} ({}), file logging disabled",
                dir, e
            );
            return None;
        }
        let test_path = std::path::Path::new(dir).join(".lpflow_write_test");
        match std::fs::OpenOptions::new().create(true).append(true).open(&test_path) {
            Ok(_) => {
                let _ = std::fs::remove_file(&test_path);
                let file_appender = tracing_appender::rolling::daily(dir, "lpflow.log");
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
                // Lives for the rest of the process
                Box::leak(Box::new(guard));
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(e) => {
                eprintln!(
                    "Warning: Could not write to log directory {} ({}), file logging disabled",
                    dir, e
                );
                None
            }
        }
    });

    let json_layer = config
        .json
        .then(|| tracing_subscriber::fmt::layer().json().with_target(true));
    let console_layer = (!config.json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
    });

    let file_logging_enabled = file_layer.is_some();
    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(json_layer)
        .with(file_layer)
        .init();

    if let (true, Some(dir)) = (file_logging_enabled, log_dir) {
        eprintln!("Logging to: {}/lpflow.log", dir);
    }
}

pub fn init_logging_simple() {
    // Minimal logging for read-only commands
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

pub async fn open_states(config: &StateConfig) -> Result<Arc<StateRepository>> {
    let store: Arc<dyn StateStore> = match config.backend {
        StateBackend::File => {
            let dir = config.resolved_dir();
            info!(dir = %dir.display(), "Using file state store");
            Arc::new(FileStateStore::open(dir).await?)
        }
        StateBackend::Postgres => {
            let url = config.database_url.as_deref().ok_or_else(|| {
                LpFlowError::ConfigMissing(
                    "state.database_url is required for the postgres backend".into(),
                )
            })?;
            let store = PostgresStateStore::new(url, config.max_connections).await?;
            store.migrate().await?;
            Arc::new(store)
        }
    };
    Ok(Arc::new(StateRepository::new(store)))
}

pub fn chain_client(config: &AppConfig) -> Result<Arc<dyn ChainClient>> {
    let live: Arc<dyn ChainClient> = Arc::new(AlloyChainClient::from_config(&config.chains)?);
    if config.dry_run {
        warn!("Dry run: no transaction will be broadcast");
        return Ok(Arc::new(DryRunChain::new(live)));
    }
    Ok(live)
}

fn exchange_client(config: &AppConfig) -> Result<Option<Arc<dyn ExchangeClient>>> {
    let Some(exchange) = config.exchange.as_ref() else {
        return Ok(None);
    };
    let credentials = ApiCredentials::from_env(exchange)?;
    let live: Arc<dyn ExchangeClient> =
        Arc::new(BinanceClient::new(exchange.base_url.clone(), credentials)?);
    if config.dry_run {
        return Ok(Some(Arc::new(DryRunExchange::new(live))));
    }
    Ok(Some(live))
}

/// Wire every collaborator for a pipeline, harvest or distribution run.
///
/// The funder key is required with the `funder` funding source or when
/// `require_funder` is set, and loaded opportunistically otherwise.
pub async fn build_context(
    config: Arc<AppConfig>,
    states: Arc<StateRepository>,
    cancel: CancelToken,
    require_funder: bool,
) -> Result<ExecutionContext> {
    let chain = chain_client(&config)?;
    let bridge: Arc<dyn BridgeClient> = Arc::new(LifiBridgeClient::new(
        config.bridge.base_url.clone(),
        config.bridge.integrator.clone(),
    )?);
    let exchange = exchange_client(&config)?;
    let wallets = Arc::new(WalletDirectory::from_env(&config.wallets.mnemonic_env, chain.clone())?);

    let funder_required = require_funder || config.funding.source == FundingSource::Funder;
    let funder = match Wallet::from_env(&config.funding.funder_key_env) {
        Ok(wallet) => Some(wallets.register(wallet)),
        Err(e) if funder_required => return Err(e),
        Err(_) => None,
    };

    let ctx = ExecutionContext::new(config, chain, bridge, exchange, wallets, states, cancel);
    Ok(match funder {
        Some(funder) => {
            info!(funder = %funder.address, "Funder key loaded");
            ctx.with_funder(funder)
        }
        None => ctx,
    })
}

/// Mnemonic-only directory for commands that never touch a chain
pub fn offline_wallets(config: &AppConfig) -> Result<WalletDirectory> {
    let chain = chain_client(config)?;
    WalletDirectory::from_env(&config.wallets.mnemonic_env, chain)
}
