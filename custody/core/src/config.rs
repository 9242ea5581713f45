// Copyright (c) 2024 The Botho Foundation

//! Configuration for the reconciliation service.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{
    address::AddressError,
    tokens::{Asset, TokenRegistry},
};

/// Fatal configuration problems, reported before any loop starts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("database.url is required")]
    MissingDatabaseUrl,
    #[error("chain.rpc_urls must contain at least one endpoint")]
    MissingRpcEndpoint,
    #[error("Invalid contract address for token {symbol}: {source}")]
    InvalidToken {
        symbol: String,
        #[source]
        source: AddressError,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustodyConfig {
    pub chain: ChainConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub scanner: ScannerSettings,

    #[serde(default)]
    pub follower: FollowerSettings,

    #[serde(default)]
    pub settlement: SettlementSettings,

    #[serde(default)]
    pub staking: StakingSettings,

    #[serde(default)]
    pub metrics: MetricsSettings,

    #[serde(default)]
    pub logging: LoggingSettings,

    /// Token contracts in scope, in addition to the native coin
    #[serde(default)]
    pub tokens: Vec<Asset>,
}

/// Chain RPC configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Chain ID (1 for mainnet, etc.)
    pub chain_id: u64,

    /// JSON-RPC endpoints, tried in order on failure
    #[serde(default)]
    pub rpc_urls: Vec<String>,

    /// Ticker of the native coin
    #[serde(default = "default_native_symbol")]
    pub native_symbol: String,

    /// Number of confirmations required before a deposit is credited
    #[serde(default = "default_confirmations")]
    pub required_confirmations: u64,

    /// Attempts per RPC call before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay of the linear backoff between attempts
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum requests per JSON-RPC batch
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Optional bearer credential for the RPC provider
    #[serde(default)]
    pub auth: Option<ChainAuth>,
}

fn default_native_symbol() -> String {
    "ETH".to_string()
}

fn default_confirmations() -> u64 {
    12
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_batch_size() -> usize {
    20
}

/// How the RPC credential is obtained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChainAuth {
    /// A fixed bearer token
    Static { token: String },
    /// Exchange client credentials for a token at `url`
    Endpoint {
        url: String,
        client_id: String,
        client_secret: String,
    },
}

/// Relational store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database path, or `:memory:`
    pub url: Option<String>,

    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

fn default_busy_timeout() -> u64 {
    5_000
}

/// Address-paging scanner knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerSettings {
    /// Addresses per page
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Concurrent address scans
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Maximum blocks covered by one address pass
    #[serde(default = "default_block_window")]
    pub block_window: u64,

    /// Blocks fetched per native-transfer sub-batch
    #[serde(default = "default_native_batch")]
    pub native_batch_size: u64,

    /// Blocks per log query
    #[serde(default = "default_log_range")]
    pub log_range: u64,

    /// Recipients per log filter
    #[serde(default = "default_address_group")]
    pub address_group_size: usize,

    /// How far behind the head a never-scanned address starts
    #[serde(default = "default_initial_lookback")]
    pub initial_lookback: u64,

    /// Minimum delay before an address is scanned again
    #[serde(default = "default_rescan_interval")]
    pub rescan_interval_secs: u64,

    /// Interval after which zero-balance assets are scanned anyway
    #[serde(default = "default_force_refresh")]
    pub force_refresh_secs: u64,

    /// Sleep when no address is due
    #[serde(default = "default_idle_sleep")]
    pub idle_sleep_ms: u64,

    /// Period of the monitored-address reload timer
    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,
}

fn default_page_size() -> u32 {
    500
}

fn default_concurrency() -> usize {
    4
}

fn default_block_window() -> u64 {
    2_000
}

fn default_native_batch() -> u64 {
    10
}

fn default_log_range() -> u64 {
    1_000
}

fn default_address_group() -> usize {
    100
}

fn default_initial_lookback() -> u64 {
    5_000
}

fn default_rescan_interval() -> u64 {
    30
}

fn default_force_refresh() -> u64 {
    6 * 60 * 60
}

fn default_idle_sleep() -> u64 {
    2_000
}

fn default_reload_interval() -> u64 {
    60
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            concurrency: default_concurrency(),
            block_window: default_block_window(),
            native_batch_size: default_native_batch(),
            log_range: default_log_range(),
            address_group_size: default_address_group(),
            initial_lookback: default_initial_lookback(),
            rescan_interval_secs: default_rescan_interval(),
            force_refresh_secs: default_force_refresh(),
            idle_sleep_ms: default_idle_sleep(),
            reload_interval_secs: default_reload_interval(),
        }
    }
}

/// Block-following front-end knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowerSettings {
    /// Blocks processed per step
    #[serde(default = "default_follow_batch")]
    pub batch_size: u64,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Blocks below the starting cursor covered by the backfill
    #[serde(default)]
    pub backfill_lookback: u64,

    /// Processed block hashes kept for reorg walk-back
    #[serde(default = "default_reorg_window")]
    pub reorg_window: u64,
}

fn default_follow_batch() -> u64 {
    10
}

fn default_poll_interval() -> u64 {
    3_000
}

fn default_reorg_window() -> u64 {
    64
}

impl Default for FollowerSettings {
    fn default() -> Self {
        Self {
            batch_size: default_follow_batch(),
            poll_interval_ms: default_poll_interval(),
            backfill_lookback: 0,
            reorg_window: default_reorg_window(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementSettings {
    /// Period of the standalone confirmation/credit task
    #[serde(default = "default_settlement_interval")]
    pub interval_secs: u64,
}

fn default_settlement_interval() -> u64 {
    15
}

impl Default for SettlementSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_settlement_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StakingSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Delay after UTC midnight before the daily run
    #[serde(default = "default_rollover_offset")]
    pub rollover_offset_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_rollover_offset() -> u64 {
    5 * 60
}

impl Default for StakingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            rollover_offset_secs: default_rollover_offset(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSettings {
    /// Address for the Prometheus endpoint; disabled when unset
    pub listen_addr: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Default filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl CustodyConfig {
    /// Load and validate configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: CustodyConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.database.url.as_deref() {
            Some(url) if !url.trim().is_empty() => {}
            _ => return Err(ConfigError::MissingDatabaseUrl),
        }

        if self.chain.rpc_urls.iter().all(|u| u.trim().is_empty()) {
            return Err(ConfigError::MissingRpcEndpoint);
        }

        if self.chain.required_confirmations == 0 {
            return Err(ConfigError::Invalid(
                "chain.required_confirmations must be at least 1".to_string(),
            ));
        }
        if self.chain.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "chain.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.chain.max_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "chain.max_batch_size must be at least 1".to_string(),
            ));
        }
        if self.scanner.page_size == 0 || self.scanner.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "scanner.page_size and scanner.concurrency must be at least 1".to_string(),
            ));
        }
        if self.scanner.address_group_size == 0 {
            return Err(ConfigError::Invalid(
                "scanner.address_group_size must be at least 1".to_string(),
            ));
        }

        self.registry().map(|_| ())
    }

    /// Build the token registry for the configured chain.
    pub fn registry(&self) -> Result<TokenRegistry, ConfigError> {
        for token in &self.tokens {
            match token.contract.as_deref() {
                Some(contract) => {
                    crate::address::normalize_address(contract).map_err(|source| {
                        ConfigError::InvalidToken {
                            symbol: token.symbol.clone(),
                            source,
                        }
                    })?;
                }
                None => {
                    return Err(ConfigError::Invalid(format!(
                        "token {} has no contract address",
                        token.symbol
                    )))
                }
            }
        }

        TokenRegistry::new(
            Asset::native(self.chain.native_symbol.clone()),
            self.tokens.clone(),
        )
        .map_err(|source| ConfigError::InvalidToken {
            symbol: "<token>".to_string(),
            source,
        })
    }
}

impl Default for CustodyConfig {
    fn default() -> Self {
        Self {
            chain: ChainConfig {
                chain_id: 1,
                rpc_urls: vec!["http://localhost:8545".to_string()],
                native_symbol: default_native_symbol(),
                required_confirmations: default_confirmations(),
                max_attempts: default_max_attempts(),
                retry_delay_ms: default_retry_delay_ms(),
                request_timeout_secs: default_request_timeout(),
                max_batch_size: default_max_batch_size(),
                auth: None,
            },
            database: DatabaseConfig {
                url: Some("custody.db".to_string()),
                busy_timeout_ms: default_busy_timeout(),
            },
            scanner: ScannerSettings::default(),
            follower: FollowerSettings::default(),
            settlement: SettlementSettings::default(),
            staking: StakingSettings::default(),
            metrics: MetricsSettings::default(),
            logging: LoggingSettings::default(),
            tokens: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [chain]
        chain_id = 1
        rpc_urls = ["http://node-a:8545", "http://node-b:8545"]

        [database]
        url = "custody.db"

        [scanner]
        concurrency = 8

        [[tokens]]
        symbol = "USDT"
        contract = "0xdAC17F958D2ee523a2206206994597C13D831ec7"
        decimals = 6
    "#;

    #[test]
    fn test_default_config() {
        let config = CustodyConfig::default();
        assert_eq!(config.chain.required_confirmations, 12);
        assert_eq!(config.scanner.page_size, 500);
        assert_eq!(config.scanner.concurrency, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_sample() {
        let config = CustodyConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.chain.rpc_urls.len(), 2);
        assert_eq!(config.chain.max_attempts, 3);
        assert_eq!(config.scanner.concurrency, 8);
        assert_eq!(config.scanner.page_size, 500);

        let registry = config.registry().unwrap();
        assert_eq!(registry.native().symbol, "ETH");
        assert_eq!(registry.tokens()[0].decimals, 6);
    }

    #[test]
    fn test_missing_database_is_fatal() {
        let content = r#"
            [chain]
            chain_id = 1
            rpc_urls = ["http://node-a:8545"]
        "#;
        assert!(matches!(
            CustodyConfig::from_toml(content),
            Err(ConfigError::MissingDatabaseUrl)
        ));
    }

    #[test]
    fn test_missing_rpc_is_fatal() {
        let content = r#"
            [chain]
            chain_id = 1

            [database]
            url = "custody.db"
        "#;
        assert!(matches!(
            CustodyConfig::from_toml(content),
            Err(ConfigError::MissingRpcEndpoint)
        ));
    }

    #[test]
    fn test_invalid_token_contract() {
        let mut config = CustodyConfig::default();
        config.tokens.push(Asset {
            symbol: "BAD".to_string(),
            contract: Some("0x1234".to_string()),
            decimals: 18,
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidToken { .. })
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custody.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        assert!(CustodyConfig::from_file(&path).is_ok());

        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            CustodyConfig::from_file(&missing),
            Err(ConfigError::Io(_))
        ));
    }
}
