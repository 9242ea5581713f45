// Copyright (c) 2024 The Botho Foundation

//! Custody deposit reconciliation service CLI.

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::{path::PathBuf, time::Duration};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bth_custody_core::{Amount, CustodyConfig};
use bth_custody_service::{
    db::Database,
    metrics,
    service::{build_engine, CustodyService, RunMode},
    staking::StakingJob,
    sweep::{SweepRecorder, SweptDeposit},
};

#[derive(Parser)]
#[command(name = "bth-custody")]
#[command(about = "On-chain deposit reconciliation for custodial accounts")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "custody.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reconciliation service until Ctrl-C
    Run {
        /// Deposit discovery front-end: address or follow
        #[arg(long, default_value = "address")]
        mode: RunMode,
    },

    /// Create or upgrade the database schema and exit
    Migrate,

    /// Show ledger, cursor and staking status
    Status,

    /// Run the staking accrual for one day
    Accrue {
        /// Day to accrue (YYYY-MM-DD), today in UTC by default
        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// Record the inbound deposit behind a sweep
    RecordDeposit {
        #[arg(long)]
        tx_hash: String,

        /// Log index of a token transfer; omit for the native coin
        #[arg(long)]
        log_index: Option<u32>,

        #[arg(long)]
        from: String,

        #[arg(long)]
        to: String,

        /// Asset symbol as configured
        #[arg(long)]
        asset: String,

        /// Amount in the asset's smallest unit
        #[arg(long)]
        amount: Amount,

        #[arg(long)]
        block: u64,

        #[arg(long)]
        block_hash: Option<String>,
    },

    /// Rewind an address's scan progress so its range is scanned again
    ResetProgress {
        address: String,

        /// Last block to treat as scanned; clears progress when omitted
        #[arg(long)]
        to_block: Option<u64>,
    },

    /// Validate configuration file
    ValidateConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match CustodyConfig::from_file(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {:?}: {}", cli.config, e);
            std::process::exit(1);
        }
    };

    init_logging(cli.log_level.as_deref().unwrap_or(&config.logging.level))?;

    if matches!(cli.command, Commands::ValidateConfig) {
        return validate_config(&config);
    }

    let db = open_database(&config)?;

    match cli.command {
        Commands::Run { mode } => {
            metrics::init_metrics();
            let engine = build_engine(&config, db)?;
            CustodyService::new(config, engine).run(mode).await
        }
        Commands::Migrate => {
            info!("Database migration complete");
            Ok(())
        }
        Commands::Status => show_status(&config, &db),
        Commands::Accrue { date } => {
            let day = date.unwrap_or_else(|| Utc::now().date_naive());
            let report = StakingJob::new(db, config.staking.clone()).run_for(day)?;
            println!(
                "Accrual for {}: {} accrued, {} already accrued, {} matured",
                day, report.accrued, report.already_accrued, report.matured
            );
            Ok(())
        }
        Commands::RecordDeposit {
            tx_hash,
            log_index,
            from,
            to,
            asset,
            amount,
            block,
            block_hash,
        } => {
            let recorder = SweepRecorder::new(build_engine(&config, db)?);
            let record = recorder
                .record(&SweptDeposit {
                    tx_hash,
                    log_index,
                    from_address: from,
                    to_address: to,
                    asset,
                    amount,
                    block_number: block,
                    block_hash,
                })
                .await?;
            println!(
                "Deposit {}: {:?}, status {}, {} credited",
                record.deposit_id, record.outcome, record.status, record.credited
            );
            Ok(())
        }
        Commands::ResetProgress { address, to_block } => {
            let address = bth_custody_core::normalize_address(&address)?;
            if db.reset_progress(&address, to_block)? {
                println!("Progress for {} reset to {:?}", address, to_block);
            } else {
                println!("No progress recorded for {}", address);
            }
            Ok(())
        }
        Commands::ValidateConfig => Ok(()),
    }
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    Ok(())
}

fn open_database(config: &CustodyConfig) -> Result<Database> {
    let url = config
        .database
        .url
        .as_deref()
        .context("database.url is not set")?;
    info!("Opening database at {}", url);
    let db = Database::open(url, Duration::from_millis(config.database.busy_timeout_ms))?;
    db.migrate()?;
    Ok(db)
}

fn validate_config(config: &CustodyConfig) -> Result<()> {
    let registry = config.registry()?;
    println!("Configuration is valid.");
    println!("  Chain ID: {}", config.chain.chain_id);
    println!("  RPC endpoints: {:?}", config.chain.rpc_urls);
    println!(
        "  Required confirmations: {}",
        config.chain.required_confirmations
    );
    println!(
        "  Assets: {}",
        registry
            .all()
            .map(|a| a.symbol.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!(
        "  Scanner: {} addresses per page, {} concurrent",
        config.scanner.page_size, config.scanner.concurrency
    );
    Ok(())
}

fn show_status(config: &CustodyConfig, db: &Database) -> Result<()> {
    let chain_id = config.chain.chain_id;
    let counts = db.deposit_counts()?;

    println!("Monitored addresses: {}", db.monitored_count(chain_id)?);
    println!(
        "Deposits: {} pending, {} confirmed ({} awaiting credit), {} orphaned",
        counts.pending, counts.confirmed, counts.awaiting_credit, counts.orphaned
    );

    match db.chain_cursor(chain_id)? {
        Some(cursor) => println!(
            "Follower cursor: block {} ({}), backfill next {:?} down to {}",
            cursor.last_block, cursor.last_hash, cursor.backfill_next, cursor.backfill_floor
        ),
        None => println!("Follower cursor: not started"),
    }

    let totals = db.balance_totals()?;
    if !totals.is_empty() {
        println!("Credited balances:");
        for (asset, total) in totals {
            println!("  {}: {}", asset, total);
        }
    }

    let (positions, accrued) = db.staking_summary()?;
    println!(
        "Staking: {} active positions, {} accrued in total",
        positions, accrued
    );
    Ok(())
}
