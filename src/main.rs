use anyhow::{Context, Result};
use clap::Parser;
use lpflow::cli::{self, Cli, Commands, DistributeOptions};
use lpflow::config::AppConfig;
use lpflow::coordination::Shutdown;
use lpflow::strategy::{FleetDriver, PositionManager, RunOptions};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

mod main_runtime;

use main_runtime::{
    build_context, init_logging, init_logging_simple, load_config, offline_wallets, open_states,
};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!(error = %e, "lpflow failed");
            eprintln!("Error: {:#}", e);
            std::process::exit(2);
        }
    }
}

/// Returns whether the command fully succeeded
async fn run(cli: Cli) -> Result<bool> {
    let config =
        load_config(cli.config.as_deref(), cli.dry_run).context("failed to load configuration")?;

    match cli.command {
        Commands::Status { json } => {
            init_logging_simple();
            let states = open_states(&config.state).await.context("failed to open state store")?;
            cli::show_status(&states, json).await?;
            Ok(true)
        }
        Commands::Reset { address, all } => {
            init_logging_simple();
            let states = open_states(&config.state).await.context("failed to open state store")?;
            cli::reset_state(&states, address, all).await?;
            Ok(true)
        }
        Commands::Wallets { count, start_index } => {
            init_logging_simple();
            let wallets = offline_wallets(&config).context("failed to derive wallets")?;
            cli::show_wallets(
                &wallets,
                start_index.unwrap_or(config.wallets.start_index),
                count.unwrap_or(config.wallets.count),
            )?;
            Ok(true)
        }
        Commands::Run {
            wallets,
            start_index,
            concurrency,
            retry_failed,
        } => {
            init_logging(&config.logging);
            let options = RunOptions {
                start_index: start_index.unwrap_or(config.wallets.start_index),
                count: wallets.unwrap_or(config.wallets.count),
                concurrency: concurrency.unwrap_or(config.orchestrator.concurrency),
                retry_failed,
            };
            run_fleet(config, options).await
        }
        Commands::Distribute {
            total,
            randomize,
            variance,
            token,
            wallets,
            start_index,
        } => {
            init_logging(&config.logging);
            let options = DistributeOptions {
                total,
                randomize,
                variance,
                token,
                start_index: start_index.unwrap_or(config.wallets.start_index),
                count: wallets.unwrap_or(config.wallets.count),
            };
            let shutdown = Arc::new(Shutdown::new());
            shutdown.trigger_on_ctrl_c();
            let config = Arc::new(config);
            let states = open_states(&config.state).await.context("failed to open state store")?;
            let ctx = build_context(config, states, shutdown.token(), true)
                .await
                .context("failed to wire the funder and clients")?;
            let outcome = cli::distribute(&ctx, &options).await.context("distribution failed")?;
            Ok(outcome.all_succeeded())
        }
        Commands::Harvest { interval, once } => {
            init_logging(&config.logging);
            let shutdown = Arc::new(Shutdown::new());
            shutdown.trigger_on_ctrl_c();
            let config = Arc::new(config);
            let states = open_states(&config.state).await.context("failed to open state store")?;
            let ctx = build_context(config, states, shutdown.token(), false)
                .await
                .context("failed to wire clients")?;
            let finished = PositionManager::new(Arc::new(ctx))
                .monitor(Duration::from_secs(interval), once)
                .await?;
            info!(cycles = finished, "Harvest monitor stopped");
            Ok(true)
        }
    }
}

async fn run_fleet(config: AppConfig, options: RunOptions) -> Result<bool> {
    info!(
        dry_run = config.dry_run,
        funding = ?config.funding.source,
        wallets = options.count,
        "Starting lpflow run"
    );
    let shutdown = Arc::new(Shutdown::new());
    shutdown.trigger_on_ctrl_c();

    let config = Arc::new(config);
    let states = open_states(&config.state).await.context("failed to open state store")?;
    let ctx = build_context(config, states, shutdown.token(), false)
        .await
        .context("failed to wire clients")?;

    let report = FleetDriver::new(Arc::new(ctx)).run(options).await?;
    cli::print_report(&report)?;
    Ok(report.all_succeeded())
}
