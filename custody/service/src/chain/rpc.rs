// Copyright (c) 2024 The Botho Foundation

//! JSON-RPC client with endpoint failover, batching and bearer auth.

use async_trait::async_trait;
use bth_custody_core::{address::address_to_topic, config::ChainConfig, Amount, Asset};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, warn};

use super::{
    auth::CredentialManager,
    types::{
        parse_amount, parse_quantity, parse_word, to_quantity, Block, BlockHeader, Log, LogFilter,
    },
    ChainClient,
};
use crate::{
    error::{ChainError, RpcError},
    retry::{retry, RetryError, RetryPolicy},
};

/// `balanceOf(address)` selector.
const BALANCE_OF_SELECTOR: &str = "70a08231";

pub struct JsonRpcClient {
    http: reqwest::Client,
    endpoints: Vec<String>,
    /// Index into `endpoints` of the endpoint currently in use
    active: AtomicUsize,
    policy: RetryPolicy,
    max_batch: usize,
    credentials: Option<Arc<CredentialManager>>,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn new(
        endpoints: Vec<String>,
        policy: RetryPolicy,
        timeout: Duration,
        max_batch: usize,
        credentials: Option<Arc<CredentialManager>>,
    ) -> Result<Self, RpcError> {
        if endpoints.is_empty() {
            return Err(RpcError::Malformed("no RPC endpoints configured".to_string()));
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoints,
            active: AtomicUsize::new(0),
            policy,
            max_batch: max_batch.max(1),
            credentials,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn from_config(config: &ChainConfig) -> Result<Self, RpcError> {
        let timeout = Duration::from_secs(config.request_timeout_secs);
        let credentials = match &config.auth {
            Some(auth) => Some(Arc::new(CredentialManager::from_config(auth, timeout)?)),
            None => None,
        };
        Self::new(
            config.rpc_urls.clone(),
            RetryPolicy::new(
                config.max_attempts,
                Duration::from_millis(config.retry_delay_ms),
            ),
            timeout,
            config.max_batch_size,
            credentials,
        )
    }

    fn endpoint(&self) -> (usize, &str) {
        let index = self.active.load(Ordering::Relaxed) % self.endpoints.len();
        (index, &self.endpoints[index])
    }

    /// Move off endpoint `failed` unless another caller already did.
    fn fail_over(&self, failed: usize) {
        if self.endpoints.len() < 2 {
            return;
        }
        let next = (failed + 1) % self.endpoints.len();
        if self
            .active
            .compare_exchange(failed, next, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            warn!(
                from = %self.endpoints[failed],
                to = %self.endpoints[next],
                "Failing over to next RPC endpoint"
            );
        }
    }

    fn request(&self, method: &str, params: Value) -> (u64, Value) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        (
            id,
            json!({
                "jsonrpc": "2.0",
                "method": method,
                "params": params,
                "id": id,
            }),
        )
    }

    /// One HTTP exchange, no retries.
    async fn send_once(&self, body: &Value) -> Result<Value, RpcError> {
        let (index, url) = self.endpoint();

        let credential = match &self.credentials {
            Some(manager) => Some(manager.current().await?),
            None => None,
        };

        let mut request = self.http.post(url).json(body);
        if let Some(credential) = &credential {
            request = request.bearer_auth(&credential.token);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                self.fail_over(index);
                return Err(RpcError::Transport(e));
            }
        };

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            if let (Some(manager), Some(credential)) = (&self.credentials, &credential) {
                manager.refresh(Some(credential.generation)).await?;
            }
            return Err(RpcError::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                self.fail_over(index);
            }
            return Err(RpcError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json().await?)
    }

    /// Single call, retried.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: Value,
    ) -> Result<T, ChainError> {
        retry(method, self.policy, |_| {
            let (_, body) = self.request(method, params.clone());
            async move {
                let response = self.send_once(&body).await?;
                extract_result(response)
            }
        })
        .await
    }

    /// Many calls of one method, sent as JSON-RPC batches of at most
    /// `max_batch` and returned in request order.
    pub async fn batch<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: Vec<Value>,
    ) -> Result<Vec<T>, ChainError> {
        let mut results = Vec::with_capacity(params.len());
        for chunk in params.chunks(self.max_batch) {
            let chunk_results: Vec<T> = retry(method, self.policy, |_| {
                let mut ids = Vec::with_capacity(chunk.len());
                let mut bodies = Vec::with_capacity(chunk.len());
                for p in chunk {
                    let (id, body) = self.request(method, p.clone());
                    ids.push(id);
                    bodies.push(body);
                }
                async move {
                    let response = self.send_once(&Value::Array(bodies)).await?;
                    order_batch(response, &ids)
                }
            })
            .await?;
            debug!(method, count = chunk_results.len(), "Batch complete");
            results.extend(chunk_results);
        }
        Ok(results)
    }
}

fn malformed(operation: &'static str, source: RpcError) -> ChainError {
    RetryError::Permanent { operation, source }
}

/// Pull `result` out of a response object, or turn `error` into an error.
fn extract_result<T: DeserializeOwned>(mut response: Value) -> Result<T, RpcError> {
    if let Some(error) = response.get("error").filter(|e| !e.is_null()) {
        return Err(RpcError::Rpc {
            code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
        });
    }
    let result = response
        .get_mut("result")
        .map(Value::take)
        .ok_or_else(|| RpcError::Malformed("no result in response".to_string()))?;
    serde_json::from_value(result).map_err(|e| RpcError::Malformed(e.to_string()))
}

/// Match batch responses to request ids; providers may reorder them.
fn order_batch<T: DeserializeOwned>(response: Value, ids: &[u64]) -> Result<Vec<T>, RpcError> {
    let items = match response {
        Value::Array(items) => items,
        other => {
            // A single error object for the whole batch
            return Err(match extract_result::<Value>(other) {
                Err(e) => e,
                Ok(_) => RpcError::Malformed("batch response is not an array".to_string()),
            });
        }
    };

    let mut by_id: HashMap<u64, Value> = HashMap::with_capacity(items.len());
    for item in items {
        if let Some(id) = item.get("id").and_then(Value::as_u64) {
            by_id.insert(id, item);
        }
    }

    ids.iter()
        .map(|id| {
            let item = by_id
                .remove(id)
                .ok_or_else(|| RpcError::Malformed(format!("missing batch response {}", id)))?;
            extract_result(item)
        })
        .collect()
}

#[async_trait]
impl ChainClient for JsonRpcClient {
    async fn latest_block(&self) -> Result<u64, ChainError> {
        let head: String = self.call("eth_blockNumber", json!([])).await?;
        parse_quantity(&head).map_err(|e| malformed("eth_blockNumber", e))
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<Log>, ChainError> {
        self.call("eth_getLogs", json!([filter])).await
    }

    async fn get_blocks_with_transactions(
        &self,
        heights: &[u64],
    ) -> Result<Vec<Block>, ChainError> {
        let params = heights
            .iter()
            .map(|h| json!([to_quantity(*h), true]))
            .collect();
        let blocks: Vec<Option<Block>> = self.batch("eth_getBlockByNumber", params).await?;

        blocks
            .into_iter()
            .zip(heights)
            .map(|(block, height)| {
                block.ok_or_else(|| {
                    malformed(
                        "eth_getBlockByNumber",
                        RpcError::Malformed(format!("block {} not available", height)),
                    )
                })
            })
            .collect()
    }

    async fn get_balance(&self, address: &str, asset: &Asset) -> Result<Amount, ChainError> {
        match &asset.contract {
            None => {
                let balance: String = self
                    .call("eth_getBalance", json!([address, "latest"]))
                    .await?;
                parse_amount(&balance).map_err(|e| malformed("eth_getBalance", e))
            }
            Some(contract) => {
                let topic = address_to_topic(address).map_err(|e| {
                    malformed("eth_call", RpcError::Malformed(e.to_string()))
                })?;
                let data = format!("0x{}{}", BALANCE_OF_SELECTOR, &topic[2..]);
                let output: String = self
                    .call("eth_call", json!([{ "to": contract, "data": data }, "latest"]))
                    .await?;
                parse_word(&output).map_err(|e| malformed("eth_call", e))
            }
        }
    }

    async fn block_hash(&self, height: u64) -> Result<Option<String>, ChainError> {
        let header: Option<BlockHeader> = self
            .call("eth_getBlockByNumber", json!([to_quantity(height), false]))
            .await?;
        Ok(header.map(|h| h.hash))
    }
}
