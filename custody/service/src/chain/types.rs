// Copyright (c) 2024 The Botho Foundation

//! Wire types for the account-based chain's JSON-RPC.

use bth_custody_core::{address::topic_to_address, Amount, TRANSFER_TOPIC};
use serde::{de::Error as _, Deserialize, Deserializer, Serialize};

use crate::error::RpcError;

/// Filter for `eth_getLogs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFilter {
    #[serde(serialize_with = "serialize_quantity")]
    pub from_block: u64,
    #[serde(serialize_with = "serialize_quantity")]
    pub to_block: u64,
    /// Emitting contracts
    pub address: Vec<String>,
    /// Positional topic filters; `None` matches anything
    pub topics: Vec<Option<Vec<String>>>,
}

impl LogFilter {
    /// Token transfers into any of `recipients`, emitted by any of `contracts`.
    pub fn transfers_to(
        contracts: Vec<String>,
        recipient_topics: Vec<String>,
        from_block: u64,
        to_block: u64,
    ) -> Self {
        Self {
            from_block,
            to_block,
            address: contracts,
            topics: vec![
                Some(vec![TRANSFER_TOPIC.to_string()]),
                None,
                Some(recipient_topics),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Log {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    #[serde(deserialize_with = "deserialize_quantity")]
    pub block_number: u64,
    #[serde(default)]
    pub block_hash: Option<String>,
    pub transaction_hash: String,
    #[serde(deserialize_with = "deserialize_quantity_u32")]
    pub log_index: u32,
    #[serde(default)]
    pub removed: bool,
}

/// Decoded token `Transfer(from, to, value)` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenTransfer {
    pub from: String,
    pub to: String,
    pub amount: Amount,
}

impl Log {
    /// Decode a token transfer, or `None` if this log is something else.
    pub fn decode_transfer(&self) -> Option<TokenTransfer> {
        if self.removed || self.topics.len() != 3 {
            return None;
        }
        if !self.topics[0].eq_ignore_ascii_case(TRANSFER_TOPIC) {
            return None;
        }
        let from = topic_to_address(&self.topics[1]).ok()?;
        let to = topic_to_address(&self.topics[2]).ok()?;
        let amount = parse_word(&self.data).ok()?;
        Some(TokenTransfer { from, to, amount })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub hash: String,
    pub from: String,
    /// `None` for contract creation
    #[serde(default)]
    pub to: Option<String>,
    #[serde(deserialize_with = "deserialize_amount")]
    pub value: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    #[serde(deserialize_with = "deserialize_quantity")]
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
}

/// Header-only block, as returned without transaction bodies.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    #[serde(deserialize_with = "deserialize_quantity")]
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
}

/// Format a block number as a JSON-RPC quantity.
pub fn to_quantity(value: u64) -> String {
    format!("0x{:x}", value)
}

/// Parse a `0x`-prefixed hex quantity.
pub fn parse_quantity(value: &str) -> Result<u64, RpcError> {
    let body = value
        .strip_prefix("0x")
        .ok_or_else(|| RpcError::Malformed(format!("quantity without 0x: {}", value)))?;
    if body.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(body, 16)
        .map_err(|e| RpcError::Malformed(format!("bad quantity {}: {}", value, e)))
}

/// Parse a `0x`-prefixed hex amount that must fit in 128 bits.
pub fn parse_amount(value: &str) -> Result<Amount, RpcError> {
    let body = value
        .strip_prefix("0x")
        .ok_or_else(|| RpcError::Malformed(format!("amount without 0x: {}", value)))?;
    let body = body.trim_start_matches('0');
    if body.is_empty() {
        return Ok(0);
    }
    if body.len() > 32 {
        return Err(RpcError::Malformed(format!("amount exceeds 128 bits: {}", value)));
    }
    u128::from_str_radix(body, 16)
        .map_err(|e| RpcError::Malformed(format!("bad amount {}: {}", value, e)))
}

/// Parse an ABI-encoded uint256 word (e.g. log data or `balanceOf` output).
pub fn parse_word(data: &str) -> Result<Amount, RpcError> {
    let body = data.strip_prefix("0x").unwrap_or(data);
    if body.is_empty() {
        return Ok(0);
    }
    if hex::decode(body).is_err() {
        return Err(RpcError::Malformed(format!("data is not hex: {}", data)));
    }
    let word = if body.len() > 64 { &body[..64] } else { body };
    parse_amount(&format!("0x{}", word))
}

fn serialize_quantity<S: serde::Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&to_quantity(*value))
}

fn deserialize_quantity<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let s = String::deserialize(deserializer)?;
    parse_quantity(&s).map_err(D::Error::custom)
}

fn deserialize_quantity_u32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    let value = deserialize_quantity(deserializer)?;
    u32::try_from(value).map_err(D::Error::custom)
}

fn deserialize_amount<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Amount, D::Error> {
    let s = String::deserialize(deserializer)?;
    parse_amount(&s).map_err(D::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_quantities() {
        assert_eq!(parse_quantity("0x69").unwrap(), 105);
        assert_eq!(parse_quantity("0x").unwrap(), 0);
        assert!(parse_quantity("105").is_err());
        assert_eq!(to_quantity(105), "0x69");

        assert_eq!(parse_amount("0x0de0b6b3a7640000").unwrap(), 1_000_000_000_000_000_000);
        assert!(parse_amount(&format!("0x1{}", "0".repeat(32))).is_err());
    }

    #[test]
    fn test_parse_word() {
        let word = format!("0x{:064x}", 5u128);
        assert_eq!(parse_word(&word).unwrap(), 5);
        assert_eq!(parse_word("0x").unwrap(), 0);
        assert!(parse_word("0xzz").is_err());
    }

    #[test]
    fn test_decode_transfer_log() {
        let log: Log = serde_json::from_value(json!({
            "address": "0xdac17f958d2ee523a2206206994597c13d831ec7",
            "topics": [
                TRANSFER_TOPIC,
                "0x0000000000000000000000001111111111111111111111111111111111111111",
                "0x000000000000000000000000abcabcabcabcabcabcabcabcabcabcabcabcabca"
            ],
            "data": format!("0x{:064x}", 5u128),
            "blockNumber": "0x69",
            "blockHash": "0xbeef",
            "transactionHash": "0xfeed",
            "logIndex": "0x3",
            "removed": false
        }))
        .unwrap();

        assert_eq!(log.block_number, 105);
        assert_eq!(log.log_index, 3);

        let transfer = log.decode_transfer().unwrap();
        assert_eq!(transfer.amount, 5);
        assert_eq!(transfer.to, "0xabcabcabcabcabcabcabcabcabcabcabcabcabca");
        assert_eq!(transfer.from, "0x1111111111111111111111111111111111111111");
    }

    #[test]
    fn test_removed_log_is_ignored() {
        let log = Log {
            address: "0x0".to_string(),
            topics: vec![TRANSFER_TOPIC.to_string()],
            data: "0x".to_string(),
            block_number: 1,
            block_hash: None,
            transaction_hash: "0x1".to_string(),
            log_index: 0,
            removed: true,
        };
        assert!(log.decode_transfer().is_none());
    }

    #[test]
    fn test_filter_serialization() {
        let filter = LogFilter::transfers_to(
            vec!["0xcontract".to_string()],
            vec!["0xtopic".to_string()],
            100,
            110,
        );
        let value = serde_json::to_value(&filter).unwrap();
        assert_eq!(value["fromBlock"], "0x64");
        assert_eq!(value["toBlock"], "0x6e");
        assert_eq!(value["topics"][1], serde_json::Value::Null);
        assert_eq!(value["topics"][2][0], "0xtopic");
    }

    #[test]
    fn test_block_deserialization() {
        let block: Block = serde_json::from_value(json!({
            "number": "0x69",
            "hash": "0xaa",
            "parentHash": "0xbb",
            "transactions": [
                {"hash": "0x01", "from": "0x02", "to": null, "value": "0x0"},
                {"hash": "0x03", "from": "0x02", "to": "0x04", "value": "0x5"}
            ]
        }))
        .unwrap();
        assert_eq!(block.number, 105);
        assert_eq!(block.transactions.len(), 2);
        assert!(block.transactions[0].to.is_none());
        assert_eq!(block.transactions[1].value, 5);
    }
}
