// Copyright (c) 2024 The Botho Foundation

//! Service runner: wires the engine, one front-end and the background jobs
//! together and coordinates shutdown.

use anyhow::Context;
use bth_custody_core::CustodyConfig;
use std::{future::Future, net::SocketAddr, str::FromStr, sync::Arc, time::Duration};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::{
    chain::JsonRpcClient,
    db::Database,
    engine::{DepositEngine, EngineSettings, SettlementReport},
    error::EngineError,
    follower::BlockFollower,
    metrics,
    scanner::AddressScanner,
    schedule::RecurringTask,
    staking::StakingJob,
    worker::ScanWorker,
};

/// Which front-end discovers deposits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Page through monitored addresses
    Address,
    /// Follow the chain tip block by block
    Follow,
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "address" => Ok(RunMode::Address),
            "follow" => Ok(RunMode::Follow),
            _ => Err(format!("Unknown run mode: {} (expected address or follow)", s)),
        }
    }
}

/// Build the deposit engine backed by the configured JSON-RPC endpoints.
pub fn build_engine(config: &CustodyConfig, db: Database) -> anyhow::Result<DepositEngine> {
    let client = JsonRpcClient::from_config(&config.chain).context("Failed to build RPC client")?;
    let registry = config.registry().context("Invalid token registry")?;
    Ok(DepositEngine::new(
        Arc::new(client),
        db,
        Arc::new(registry),
        EngineSettings::from_config(config),
    ))
}

pub struct CustodyService {
    config: CustodyConfig,
    engine: DepositEngine,
    shutdown_tx: broadcast::Sender<()>,
}

impl CustodyService {
    pub fn new(config: CustodyConfig, engine: DepositEngine) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            engine,
            shutdown_tx,
        }
    }

    /// Run until Ctrl-C.
    pub async fn run(self, mode: RunMode) -> anyhow::Result<()> {
        self.run_until(mode, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Received shutdown signal");
        })
        .await
    }

    /// Run until `stop` completes, then shut every task down.
    pub async fn run_until(
        self,
        mode: RunMode,
        stop: impl Future<Output = ()>,
    ) -> anyhow::Result<()> {
        info!(?mode, chain_id = self.config.chain.chain_id, "Starting custody service");
        let mut handles = Vec::new();

        if let Some(listen) = self.config.metrics.listen_addr.as_deref() {
            let addr: SocketAddr = listen
                .parse()
                .with_context(|| format!("Invalid metrics listen address {}", listen))?;
            let shutdown = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                if let Err(e) = metrics::start_metrics_server(addr, shutdown).await {
                    error!("Metrics server error: {}", e);
                }
            }));
        }

        let chain_id = self.config.chain.chain_id;
        match mode {
            RunMode::Address => {
                let scanner = AddressScanner::new(self.engine.clone(), self.config.scanner.clone());
                let worker = ScanWorker::new(scanner, chain_id, self.config.scanner.clone());
                handles.push(tokio::spawn(worker.run(self.shutdown_tx.subscribe())));
            }
            RunMode::Follow => {
                let follower =
                    BlockFollower::new(self.engine.clone(), chain_id, self.config.follower.clone());
                handles.push(tokio::spawn(follower.run(self.shutdown_tx.subscribe())));
            }
        }

        // Confirmation and credit also run on their own schedule so deposits
        // settle while a front-end is busy with a long backfill.
        let settlement = RecurringTask::new(
            "settlement",
            Duration::from_secs(self.config.settlement.interval_secs.max(1)),
        );
        let engine = self.engine.clone();
        handles.push(tokio::spawn(settlement.run(
            self.shutdown_tx.subscribe(),
            move || {
                let engine = engine.clone();
                async move {
                    let result: Result<_, EngineError> = async {
                        let latest = engine.latest_block().await?;
                        engine.confirm_and_settle(latest).await
                    }
                    .await;
                    match result {
                        Ok(report) if report != SettlementReport::default() => info!(
                            confirmed = report.confirmed,
                            credited = report.credited,
                            orphaned = report.orphaned,
                            "Settlement pass"
                        ),
                        Ok(_) => {}
                        Err(e) => {
                            metrics::record_unit_error("settlement");
                            warn!("Settlement pass failed: {}", e);
                        }
                    }
                }
            },
        )));

        let staking = StakingJob::new(self.engine.db().clone(), self.config.staking.clone());
        handles.push(tokio::spawn(staking.run(self.shutdown_tx.subscribe())));

        stop.await;

        let _ = self.shutdown_tx.send(());
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Task failed during shutdown: {}", e);
            }
        }

        info!("Custody service stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain::mock::MockChain,
        db::test_utils::{addr, test_db, tx},
        engine::tests::{engine, USDT},
    };

    const CONFIG: &str = r#"
        [chain]
        chain_id = 1
        rpc_urls = ["http://127.0.0.1:8545"]

        [database]
        url = ":memory:"

        [scanner]
        idle_sleep_ms = 10
        initial_lookback = 20

        [follower]
        poll_interval_ms = 10
        backfill_lookback = 20

        [[tokens]]
        symbol = "USDT"
        contract = "0xdac17f958d2ee523a2206206994597c13d831ec7"
        decimals = 6
    "#;

    #[test]
    fn test_run_mode_parse() {
        assert_eq!("address".parse::<RunMode>().unwrap(), RunMode::Address);
        assert_eq!("follow".parse::<RunMode>().unwrap(), RunMode::Follow);
        assert!("sweep".parse::<RunMode>().is_err());
    }

    #[test]
    fn test_build_engine_from_config() {
        let config = CustodyConfig::from_toml(CONFIG).unwrap();
        let engine = build_engine(&config, test_db()).unwrap();
        assert_eq!(engine.registry().contracts(), vec![USDT.to_string()]);
        assert_eq!(engine.settings().required_confirmations, 12);
    }

    async fn run_mode(mode: RunMode) {
        let db = test_db();
        db.insert_monitored_address(&addr(0xab), 42, 1).unwrap();
        let chain = Arc::new(MockChain::new(120));
        chain.set_balance(&addr(0xab), Some(USDT), 5);
        chain.add_token_transfer(105, &tx(1), 0, USDT, &addr(0x11), &addr(0xab), 5);

        let config = CustodyConfig::from_toml(CONFIG).unwrap();
        let service = CustodyService::new(config, engine(chain, db.clone()));
        service
            .run_until(mode, tokio::time::sleep(Duration::from_millis(300)))
            .await
            .unwrap();

        assert_eq!(db.balance(42, "USDT").unwrap(), 5);
    }

    #[tokio::test]
    async fn test_address_mode_credits_deposit() {
        run_mode(RunMode::Address).await;
    }

    #[tokio::test]
    async fn test_follow_mode_backfills_and_credits_deposit() {
        run_mode(RunMode::Follow).await;
    }
}
