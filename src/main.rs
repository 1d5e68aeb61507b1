//! Rewards attester
//!
//! Entry point for the long-running attestation driver. Pages undisbursed
//! rewards from the backlog, aggregates oracle and validator attestations and
//! relays them to the ledger for disbursement.

// Compiler warning configuration
#![deny(unused_imports)]
#![deny(unused_mut)]
#![deny(unused_variables)]
#![warn(dead_code)]
#![warn(unused_must_use)]

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use attester::attestation::{AttestationCollector, SubmissionCoordinator};
use attester::attester::{AttestationDelayCalculator, AttesterOptions, RewardsAttester};
use attester::clients::{
    DiscoveryBacklogSource, DiscoveryValidatorClient, DryRunLedgerClient, EvmBlockHeight, LedgerClient,
    OracleHttpClient, RelayLedgerClient, SolanaFeePayer, SolanaSlotHeight, StaticValidatorDirectory,
};
use attester::config::Config;
use attester::endpoints;
use attester::progress::SledProgressStore;
use attester::reporting::LoggingReporter;
use attester::types::AttesterCursor;

/// Operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Everything but the ledger relay; submissions are only logged
    Simulation,
    Production,
}

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Operating mode (simulation or production)
    #[arg(short, long, default_value = "simulation")]
    mode: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Metrics port, overrides `monitoring.metrics_port`
    #[arg(long)]
    metrics_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(args.verbose, args.json_logs)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting rewards attester");

    // Load configuration
    info!(path = %args.config, "Loading configuration");
    let config = load_config(&args.config)?;
    config.validate().context("Invalid configuration")?;

    // Determine operating mode
    let mode = match args.mode.as_str() {
        "production" => Mode::Production,
        "simulation" => Mode::Simulation,
        _ => {
            warn!("Unknown mode '{}', defaulting to simulation", args.mode);
            Mode::Simulation
        }
    };
    info!(?mode, "Operating mode");

    // Restore the cursor
    let progress = Arc::new(
        SledProgressStore::open(&config.storage.progress_db_path).context("Failed to open progress store")?,
    );
    let cursor = match progress.load()? {
        Some(record) => {
            info!(
                starting_block = record.cursor.starting_block,
                offset = record.cursor.offset,
                updated_at = %record.updated_at,
                "Restored cursor from progress store"
            );
            record.cursor
        }
        None => AttesterCursor::new(config.attester.starting_block, config.attester.offset),
    };

    // Initialize metrics
    if config.monitoring.enable_metrics {
        let metrics_port = args.metrics_port.unwrap_or(config.monitoring.metrics_port);
        info!(port = metrics_port, "Starting metrics server");
        tokio::spawn(async move {
            if let Err(e) = endpoints::endpoint_server(metrics_port).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    // Collaborators
    let ledger: Arc<dyn LedgerClient> = match mode {
        Mode::Simulation => Arc::new(DryRunLedgerClient::new()),
        Mode::Production => Arc::new(RelayLedgerClient::new(
            config.ledger.relay_endpoint.clone(),
            Some(config.ledger.fee_payer.clone()),
        )?),
    };
    let collector = AttestationCollector::new(
        Arc::new(DiscoveryValidatorClient::new()?),
        Arc::new(OracleHttpClient::new()?),
    );
    let coordinator = SubmissionCoordinator::new(collector, ledger)
        .with_instructions_per_transaction(config.ledger.instructions_per_transaction);
    let backlog = Arc::new(DiscoveryBacklogSource::new(
        config.backlog.endpoint.clone(),
        config.backlog.page_limit,
    )?);
    let directory = Arc::new(StaticValidatorDirectory::new(config.validators.endpoints.clone()));
    let fee_payer = Arc::new(SolanaFeePayer::new(
        &config.ledger.rpc_url,
        &config.ledger.fee_payer,
        config.ledger.min_balance_lamports,
    )?);
    info!(
        fee_payer = %fee_payer.fee_payer(),
        validators = directory.len(),
        "Collaborators initialized"
    );

    let (update_tx, update_rx) = mpsc::unbounded_channel();
    let mut attester = RewardsAttester::new(
        AttesterOptions::from_config(&config),
        cursor,
        coordinator,
        backlog,
        directory.clone(),
        fee_payer,
    )
    .with_reporter(Arc::new(LoggingReporter))
    .with_progress_sink(progress)
    .with_config_updates(update_rx);

    if config.attester.run_behind_secs > 0 {
        let eth_rpc_url = config
            .attester
            .eth_rpc_url
            .clone()
            .context("attester.eth_rpc_url is required with run_behind_secs")?;
        info!(run_behind_secs = config.attester.run_behind_secs, "Delaying recently completed claims");
        attester = attester.with_delay_calculator(AttestationDelayCalculator::new(
            Arc::new(EvmBlockHeight::new(eth_rpc_url)?),
            Arc::new(SolanaSlotHeight::new(&config.ledger.rpc_url)),
            Duration::from_secs(config.attester.run_behind_secs),
        ));
    }

    // Graceful shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal, finishing current batch");
            let _ = shutdown_tx.send(true);
        }
    });

    #[cfg(unix)]
    spawn_config_reloader(args.config.clone(), directory, update_tx);
    #[cfg(not(unix))]
    drop((directory, update_tx));

    attester.start(shutdown_rx).await?;

    info!("Shut down gracefully");
    Ok(())
}

/// Initialize logging subsystem
fn init_logging(verbose: bool, json: bool) -> Result<()> {
    let env_filter = if verbose {
        "attester=debug,info"
    } else {
        "attester=info,warn"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| env_filter.into());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    }

    Ok(())
}

/// Load configuration from file with fallback to defaults
fn load_config(path: &str) -> Result<Config> {
    if std::path::Path::new(path).exists() {
        Config::from_file_with_env(path)
            .with_context(|| format!("Failed to load config from {}", path))
    } else {
        warn!("Config file '{}' not found, using defaults", path);
        Ok(Config::default())
    }
}

/// Re-read the config file on SIGHUP and push the hot-reloadable subset
#[cfg(unix)]
fn spawn_config_reloader(
    path: String,
    directory: Arc<StaticValidatorDirectory>,
    updates: mpsc::UnboundedSender<attester::attester::ConfigUpdate>,
) {
    use attester::attester::ConfigUpdate;
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Config reload disabled: {}", e);
                return;
            }
        };

        while hangup.recv().await.is_some() {
            let config = match load_config(&path).and_then(|c| c.validate().map(|_| c).map_err(Into::into)) {
                Ok(config) => config,
                Err(e) => {
                    error!(error = %format!("{:#}", e), "Config reload failed, keeping current config");
                    continue;
                }
            };

            directory.set_endpoints(config.validators.endpoints.clone());
            let update = ConfigUpdate {
                oracle_endpoint: Some(config.oracle.endpoint),
                oracle_address: Some(config.oracle.address),
                endpoints: None,
                challenge_ids_deny_list: Some(config.attester.challenge_ids_deny_list),
                parallelism: Some(config.attester.parallelism),
            };
            info!("Reloaded configuration");
            if updates.send(update).is_err() {
                return;
            }
        }
    });
}
