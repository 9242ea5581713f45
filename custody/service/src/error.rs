// Copyright (c) 2024 The Botho Foundation

//! Error types for the reconciliation service.

use bth_custody_core::AddressError;

use crate::retry::{RetryError, Retryable};

/// A single failed JSON-RPC exchange.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("HTTP status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("RPC endpoint rejected the credential")]
    Unauthorized,

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Malformed RPC response: {0}")]
    Malformed(String),

    #[error("Credential refresh failed: {0}")]
    Credential(String),
}

/// JSON-RPC "invalid params" and "method not found" never succeed on retry.
const NON_RETRYABLE_CODES: &[i64] = &[-32601, -32602];

impl RpcError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, RpcError::Unauthorized)
    }
}

impl Retryable for RpcError {
    fn is_retryable(&self) -> bool {
        match self {
            RpcError::Transport(_) | RpcError::Unauthorized => true,
            RpcError::Status { status, .. } => *status == 429 || *status >= 500,
            RpcError::Rpc { code, .. } => !NON_RETRYABLE_CODES.contains(code),
            RpcError::Malformed(_) | RpcError::Credential(_) => false,
        }
    }
}

/// Failure of a chain call after the retry budget is spent.
pub type ChainError = RetryError<RpcError>;

/// Relational store failures.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        DbError::Lock(e.to_string())
    }
}

/// Failure of one unit of work (an address pass, a block batch, a sweep).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error("Invalid address: {0}")]
    Address(#[from] AddressError),

    #[error("Asset {0} is not in the token registry")]
    UnknownAsset(String),

    #[error("Address {0} is not monitored")]
    NotMonitored(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_error_retryable() {
        assert!(RpcError::Unauthorized.is_retryable());
        assert!(RpcError::Status {
            status: 429,
            body: String::new()
        }
        .is_retryable());
        assert!(RpcError::Status {
            status: 503,
            body: String::new()
        }
        .is_retryable());
        assert!(!RpcError::Status {
            status: 400,
            body: String::new()
        }
        .is_retryable());
        assert!(RpcError::Rpc {
            code: -32005,
            message: "limit exceeded".to_string()
        }
        .is_retryable());
        assert!(!RpcError::Rpc {
            code: -32602,
            message: "invalid params".to_string()
        }
        .is_retryable());
        assert!(!RpcError::Malformed("bad".to_string()).is_retryable());
    }
}
