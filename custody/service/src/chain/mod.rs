// Copyright (c) 2024 The Botho Foundation

//! Chain access.
//!
//! Everything above this module talks to the chain through [`ChainClient`],
//! so tests swap in a scripted chain and production uses [`JsonRpcClient`].

pub mod auth;
#[cfg(test)]
pub mod mock;
pub mod rpc;
pub mod types;

use async_trait::async_trait;
use bth_custody_core::{Amount, Asset};

use crate::error::ChainError;

pub use auth::{Credential, CredentialManager, CredentialSource};
pub use rpc::JsonRpcClient;
pub use types::{Block, Log, LogFilter, Transaction};

/// Read access to an account-based chain.
///
/// Every method already retries internally; an `Err` means the retry
/// budget is spent or the failure is permanent.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Height of the chain head.
    async fn latest_block(&self) -> Result<u64, ChainError>;

    /// Event logs matching `filter`.
    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<Log>, ChainError>;

    /// Full blocks (with transaction bodies), in the order requested.
    async fn get_blocks_with_transactions(&self, heights: &[u64])
        -> Result<Vec<Block>, ChainError>;

    /// Balance of `address` in `asset` at the head.
    async fn get_balance(&self, address: &str, asset: &Asset) -> Result<Amount, ChainError>;

    /// Canonical hash at `height`, or `None` if the chain is not that tall.
    async fn block_hash(&self, height: u64) -> Result<Option<String>, ChainError>;
}
