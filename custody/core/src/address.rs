// Copyright (c) 2024 The Botho Foundation

//! Custodial deposit addresses.

use serde::{Deserialize, Serialize};

/// Errors from parsing an account address or a log topic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("address must start with 0x: {0}")]
    MissingPrefix(String),
    #[error("address must be 42 characters, got {0}")]
    BadLength(usize),
    #[error("address must be valid hex: {0}")]
    NotHex(String),
    #[error("topic is not a 32-byte word: {0}")]
    BadTopic(String),
}

/// A deposit address assigned to a user. Provisioned elsewhere; read-only here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoredAddress {
    /// Monotonic row id, used as the paging cursor
    pub id: i64,
    /// Lowercase 0x-prefixed address
    pub address: String,
    pub user_id: i64,
    pub chain_id: u64,
}

/// Validate an account address and return its canonical lowercase form.
pub fn normalize_address(address: &str) -> Result<String, AddressError> {
    let trimmed = address.trim();
    if !trimmed.starts_with("0x") && !trimmed.starts_with("0X") {
        return Err(AddressError::MissingPrefix(trimmed.to_string()));
    }
    if trimmed.len() != 42 {
        return Err(AddressError::BadLength(trimmed.len()));
    }
    if !trimmed[2..].chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(AddressError::NotHex(trimmed.to_string()));
    }
    Ok(format!("0x{}", trimmed[2..].to_ascii_lowercase()))
}

/// Left-pad an address into a 32-byte indexed log topic.
pub fn address_to_topic(address: &str) -> Result<String, AddressError> {
    let normalized = normalize_address(address)?;
    Ok(format!("0x{:0>64}", &normalized[2..]))
}

/// Extract the address held in the low 20 bytes of an indexed log topic.
pub fn topic_to_address(topic: &str) -> Result<String, AddressError> {
    let body = topic.strip_prefix("0x").unwrap_or(topic);
    if body.len() != 64 || hex::decode(body).is_err() {
        return Err(AddressError::BadTopic(topic.to_string()));
    }
    Ok(format!("0x{}", body[24..].to_ascii_lowercase()))
}
