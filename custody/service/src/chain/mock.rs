// Copyright (c) 2024 The Botho Foundation

//! Scriptable in-memory chain for tests.

use async_trait::async_trait;
use bth_custody_core::{address::address_to_topic, Amount, Asset, TRANSFER_TOPIC};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex,
    },
};

use super::{
    types::{Block, Log, LogFilter, Transaction},
    ChainClient,
};
use crate::{
    error::{ChainError, RpcError},
    retry::RetryError,
};

/// Deterministic block hash for `number` on fork `fork`.
pub fn mock_hash(number: u64, fork: u32) -> String {
    format!("0x{:08x}{:056x}", fork, number)
}

fn unavailable(operation: &'static str) -> ChainError {
    RetryError::Exhausted {
        operation,
        attempts: 3,
        last: RpcError::Status {
            status: 503,
            body: "scripted failure".to_string(),
        },
    }
}

#[derive(Default)]
struct State {
    head: u64,
    /// Height at which each fork starts; fork 0 covers everything below
    forks: BTreeMap<u64, u32>,
    transactions: BTreeMap<u64, Vec<Transaction>>,
    logs: Vec<Log>,
    balances: HashMap<(String, Option<String>), Amount>,
    failing_log_ranges: HashSet<u64>,
    failing_blocks: HashSet<u64>,
    fail_balances: bool,
    fail_head: bool,
}

impl State {
    fn fork_at(&self, height: u64) -> u32 {
        self.forks
            .range(..=height)
            .next_back()
            .map(|(_, fork)| *fork)
            .unwrap_or(0)
    }

    fn hash_at(&self, height: u64) -> String {
        mock_hash(height, self.fork_at(height))
    }

    fn block(&self, height: u64) -> Block {
        Block {
            number: height,
            hash: self.hash_at(height),
            parent_hash: if height == 0 {
                mock_hash(0, 0)
            } else {
                self.hash_at(height - 1)
            },
            transactions: self.transactions.get(&height).cloned().unwrap_or_default(),
        }
    }
}

#[derive(Default)]
pub struct MockChain {
    state: Mutex<State>,
    pub log_calls: AtomicU32,
    pub balance_calls: AtomicU32,
    pub block_calls: AtomicU32,
}

impl MockChain {
    pub fn new(head: u64) -> Self {
        let chain = Self::default();
        chain.set_head(head);
        chain
    }

    pub fn set_head(&self, head: u64) {
        self.state.lock().unwrap().head = head;
    }

    pub fn hash_at(&self, height: u64) -> String {
        self.state.lock().unwrap().hash_at(height)
    }

    pub fn add_native_transfer(
        &self,
        height: u64,
        tx_hash: &str,
        from: &str,
        to: &str,
        value: Amount,
    ) {
        self.state
            .lock()
            .unwrap()
            .transactions
            .entry(height)
            .or_default()
            .push(Transaction {
                hash: tx_hash.to_string(),
                from: from.to_string(),
                to: Some(to.to_string()),
                value,
            });
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_token_transfer(
        &self,
        height: u64,
        tx_hash: &str,
        log_index: u32,
        contract: &str,
        from: &str,
        to: &str,
        amount: Amount,
    ) {
        let mut state = self.state.lock().unwrap();
        let block_hash = state.hash_at(height);
        state.logs.push(Log {
            address: contract.to_string(),
            topics: vec![
                TRANSFER_TOPIC.to_string(),
                address_to_topic(from).unwrap(),
                address_to_topic(to).unwrap(),
            ],
            data: format!("0x{:064x}", amount),
            block_number: height,
            block_hash: Some(block_hash),
            transaction_hash: tx_hash.to_string(),
            log_index,
            removed: false,
        });
    }

    pub fn set_balance(&self, address: &str, contract: Option<&str>, amount: Amount) {
        self.state.lock().unwrap().balances.insert(
            (address.to_ascii_lowercase(), contract.map(str::to_ascii_lowercase)),
            amount,
        );
    }

    /// Replace every block from `height` up with fork `fork`, dropping
    /// their transactions and logs.
    pub fn reorg_at(&self, height: u64, fork: u32) {
        let mut state = self.state.lock().unwrap();
        state.forks.split_off(&height);
        state.forks.insert(height, fork);
        state.transactions.split_off(&height);
        state.logs.retain(|log| log.block_number < height);
    }

    /// `get_logs` calls whose range starts at `from_block` fail.
    pub fn fail_logs_from(&self, from_block: u64) {
        self.state.lock().unwrap().failing_log_ranges.insert(from_block);
    }

    pub fn fail_block(&self, height: u64) {
        self.state.lock().unwrap().failing_blocks.insert(height);
    }

    pub fn fail_balances(&self, fail: bool) {
        self.state.lock().unwrap().fail_balances = fail;
    }

    pub fn fail_head(&self, fail: bool) {
        self.state.lock().unwrap().fail_head = fail;
    }

    pub fn heal(&self) {
        let mut state = self.state.lock().unwrap();
        state.failing_log_ranges.clear();
        state.failing_blocks.clear();
        state.fail_balances = false;
        state.fail_head = false;
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn latest_block(&self) -> Result<u64, ChainError> {
        let state = self.state.lock().unwrap();
        if state.fail_head {
            return Err(unavailable("eth_blockNumber"));
        }
        Ok(state.head)
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<Log>, ChainError> {
        self.log_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        if state.failing_log_ranges.contains(&filter.from_block) {
            return Err(unavailable("eth_getLogs"));
        }

        let recipients = filter.topics.get(2).cloned().flatten();
        Ok(state
            .logs
            .iter()
            .filter(|log| {
                log.block_number >= filter.from_block && log.block_number <= filter.to_block
            })
            .filter(|log| {
                filter.address.is_empty()
                    || filter
                        .address
                        .iter()
                        .any(|a| a.eq_ignore_ascii_case(&log.address))
            })
            .filter(|log| match &recipients {
                Some(topics) => topics.iter().any(|t| log.topics.get(2) == Some(t)),
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn get_blocks_with_transactions(
        &self,
        heights: &[u64],
    ) -> Result<Vec<Block>, ChainError> {
        self.block_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        heights
            .iter()
            .map(|height| {
                if state.failing_blocks.contains(height) {
                    return Err(unavailable("eth_getBlockByNumber"));
                }
                if *height > state.head {
                    return Err(RetryError::Permanent {
                        operation: "eth_getBlockByNumber",
                        source: RpcError::Malformed(format!("block {} not available", height)),
                    });
                }
                Ok(state.block(*height))
            })
            .collect()
    }

    async fn get_balance(&self, address: &str, asset: &Asset) -> Result<Amount, ChainError> {
        self.balance_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        if state.fail_balances {
            return Err(unavailable("eth_getBalance"));
        }
        let key = (
            address.to_ascii_lowercase(),
            asset.contract.as_ref().map(|c| c.to_ascii_lowercase()),
        );
        Ok(state.balances.get(&key).copied().unwrap_or(0))
    }

    async fn block_hash(&self, height: u64) -> Result<Option<String>, ChainError> {
        let state = self.state.lock().unwrap();
        if height > state.head {
            return Ok(None);
        }
        Ok(Some(state.hash_at(height)))
    }
}
