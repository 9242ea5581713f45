// Copyright (c) 2024 The Botho Foundation

//! Prometheus metrics for the reconciliation service.
//!
//! ## Metrics Exported
//!
//! - `custody_deposits_total{outcome}` - ledger upserts by outcome (counter)
//! - `custody_confirmations_total` - deposits that became confirmed (counter)
//! - `custody_credits_total` - deposits credited to a balance (counter)
//! - `custody_orphaned_total` - deposits orphaned by reorgs (counter)
//! - `custody_unit_errors_total{stage}` - failed units of work (counter)
//! - `custody_rpc_retries_total{operation}` - retried chain calls (counter)
//! - `custody_blocks_scanned_total{source}` - blocks covered per front-end (counter)
//! - `custody_accruals_total` - staking accruals written (counter)
//! - `custody_chain_head` - last observed head height (gauge)
//! - `custody_followed_block` - follower cursor height (gauge)
//! - `custody_addresses_monitored` - monitored addresses (gauge)
//! - `custody_address_scan_seconds` - duration of one address pass (histogram)

use bth_custody_core::{ScanRange, UpsertOutcome};
use http_body_util::Full;
use hyper::{
    body::Bytes, server::conn::http1, service::service_fn, Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::{convert::Infallible, net::SocketAddr};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::schedule::ShutdownSignal;

lazy_static! {
    /// Global Prometheus registry for all metrics.
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref DEPOSITS: IntCounterVec = IntCounterVec::new(
        Opts::new("custody_deposits_total", "Deposit ledger upserts by outcome"),
        &["outcome"]
    ).expect("Failed to create deposits metric");

    pub static ref CONFIRMATIONS: IntCounter = IntCounter::new(
        "custody_confirmations_total",
        "Deposits that reached the required confirmation depth"
    ).expect("Failed to create confirmations metric");

    pub static ref CREDITS: IntCounter = IntCounter::new(
        "custody_credits_total",
        "Deposits credited to a user balance"
    ).expect("Failed to create credits metric");

    pub static ref ORPHANED: IntCounter = IntCounter::new(
        "custody_orphaned_total",
        "Deposits orphaned by chain reorganizations"
    ).expect("Failed to create orphaned metric");

    pub static ref UNIT_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("custody_unit_errors_total", "Failed units of work by stage"),
        &["stage"]
    ).expect("Failed to create unit_errors metric");

    pub static ref RPC_RETRIES: IntCounterVec = IntCounterVec::new(
        Opts::new("custody_rpc_retries_total", "Chain calls retried by operation"),
        &["operation"]
    ).expect("Failed to create rpc_retries metric");

    pub static ref BLOCKS_SCANNED: IntCounterVec = IntCounterVec::new(
        Opts::new("custody_blocks_scanned_total", "Blocks covered by source"),
        &["source"]
    ).expect("Failed to create blocks_scanned metric");

    pub static ref ACCRUALS: IntCounter = IntCounter::new(
        "custody_accruals_total",
        "Staking accruals written"
    ).expect("Failed to create accruals metric");

    pub static ref CHAIN_HEAD: IntGauge = IntGauge::new(
        "custody_chain_head",
        "Last observed chain head height"
    ).expect("Failed to create chain_head metric");

    pub static ref FOLLOWED_BLOCK: IntGauge = IntGauge::new(
        "custody_followed_block",
        "Height of the block follower cursor"
    ).expect("Failed to create followed_block metric");

    pub static ref ADDRESSES_MONITORED: IntGauge = IntGauge::new(
        "custody_addresses_monitored",
        "Monitored deposit addresses"
    ).expect("Failed to create addresses_monitored metric");

    pub static ref ADDRESS_SCAN_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new("custody_address_scan_seconds", "Duration of one address pass")
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0])
    ).expect("Failed to create address_scan_seconds metric");
}

/// Register every metric with [`REGISTRY`]. Call once at startup.
pub fn init_metrics() {
    REGISTRY
        .register(Box::new(DEPOSITS.clone()))
        .expect("Failed to register deposits");
    REGISTRY
        .register(Box::new(CONFIRMATIONS.clone()))
        .expect("Failed to register confirmations");
    REGISTRY
        .register(Box::new(CREDITS.clone()))
        .expect("Failed to register credits");
    REGISTRY
        .register(Box::new(ORPHANED.clone()))
        .expect("Failed to register orphaned");
    REGISTRY
        .register(Box::new(UNIT_ERRORS.clone()))
        .expect("Failed to register unit_errors");
    REGISTRY
        .register(Box::new(RPC_RETRIES.clone()))
        .expect("Failed to register rpc_retries");
    REGISTRY
        .register(Box::new(BLOCKS_SCANNED.clone()))
        .expect("Failed to register blocks_scanned");
    REGISTRY
        .register(Box::new(ACCRUALS.clone()))
        .expect("Failed to register accruals");
    REGISTRY
        .register(Box::new(CHAIN_HEAD.clone()))
        .expect("Failed to register chain_head");
    REGISTRY
        .register(Box::new(FOLLOWED_BLOCK.clone()))
        .expect("Failed to register followed_block");
    REGISTRY
        .register(Box::new(ADDRESSES_MONITORED.clone()))
        .expect("Failed to register addresses_monitored");
    REGISTRY
        .register(Box::new(ADDRESS_SCAN_SECONDS.clone()))
        .expect("Failed to register address_scan_seconds");
}

/// Count the blocks in `range` against `source`.
pub fn record_blocks(source: &str, range: ScanRange) {
    BLOCKS_SCANNED.with_label_values(&[source]).inc_by(range.len());
}

pub fn record_upsert(outcome: UpsertOutcome) {
    let label = match outcome {
        UpsertOutcome::New => "new",
        UpsertOutcome::Updated => "updated",
        UpsertOutcome::Duplicate => "duplicate",
    };
    DEPOSITS.with_label_values(&[label]).inc();
}

pub fn record_unit_error(stage: &str) {
    UNIT_ERRORS.with_label_values(&[stage]).inc();
}

/// Serve `GET /metrics` until shutdown.
pub async fn start_metrics_server(
    addr: SocketAddr,
    mut shutdown: ShutdownSignal,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(
        "Prometheus metrics server listening on http://{}/metrics",
        addr
    );

    loop {
        let (stream, _) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown.recv() => {
                info!("Metrics server shutting down");
                return Ok(());
            }
        };
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            let service = service_fn(handle_metrics_request);

            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                error!("Error serving metrics connection: {:?}", err);
            }
        });
    }
}

/// Render the registry in the Prometheus text format.
pub fn render() -> Result<Vec<u8>, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(buffer)
}

async fn handle_metrics_request(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = if req.method() != hyper::Method::GET {
        Response::builder()
            .status(StatusCode::METHOD_NOT_ALLOWED)
            .body(Full::new(Bytes::from("Method not allowed")))
    } else if req.uri().path() != "/metrics" && req.uri().path() != "/" {
        Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not found. Try /metrics")))
    } else {
        match render() {
            Ok(buffer) => Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", TextEncoder::new().format_type())
                .body(Full::new(Bytes::from(buffer))),
            Err(e) => {
                error!("Failed to encode metrics: {}", e);
                Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Full::new(Bytes::from(format!("Failed to encode metrics: {}", e))))
            }
        }
    };

    Ok(response.unwrap_or_else(|_| Response::new(Full::new(Bytes::new()))))
}
