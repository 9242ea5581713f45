// Copyright (c) 2024 The Botho Foundation

//! Registry of the assets in scope for deposit scanning.

use serde::{Deserialize, Serialize};

use crate::address::{normalize_address, AddressError};

/// `keccak256("Transfer(address,address,uint256)")`, topic0 of token transfers.
pub const TRANSFER_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

/// An asset whose deposits are reconciled.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Asset {
    /// Ticker used as the balance key (e.g. "ETH", "USDT")
    pub symbol: String,

    /// Token contract address; `None` for the chain's native coin
    #[serde(default)]
    pub contract: Option<String>,

    /// Number of decimals of the smallest unit (informational only)
    #[serde(default = "default_decimals")]
    pub decimals: u8,
}

fn default_decimals() -> u8 {
    18
}

impl Asset {
    /// The chain's native coin.
    pub fn native(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            contract: None,
            decimals: default_decimals(),
        }
    }

    /// A token contract. The address is normalized.
    pub fn token(
        symbol: impl Into<String>,
        contract: &str,
        decimals: u8,
    ) -> Result<Self, AddressError> {
        Ok(Self {
            symbol: symbol.into(),
            contract: Some(normalize_address(contract)?),
            decimals,
        })
    }

    pub fn is_native(&self) -> bool {
        self.contract.is_none()
    }
}

/// Static set of assets scanned for one chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRegistry {
    native: Asset,
    tokens: Vec<Asset>,
}

impl TokenRegistry {
    /// Build a registry. Token contracts are normalized and deduplicated.
    pub fn new(native: Asset, tokens: Vec<Asset>) -> Result<Self, AddressError> {
        let mut normalized: Vec<Asset> = Vec::with_capacity(tokens.len());
        for mut token in tokens {
            let Some(contract) = token.contract.as_deref() else {
                continue;
            };
            let contract = normalize_address(contract)?;
            if normalized
                .iter()
                .any(|t| t.contract.as_deref() == Some(contract.as_str()))
            {
                continue;
            }
            token.contract = Some(contract);
            normalized.push(token);
        }
        Ok(Self {
            native,
            tokens: normalized,
        })
    }

    pub fn native(&self) -> &Asset {
        &self.native
    }

    pub fn tokens(&self) -> &[Asset] {
        &self.tokens
    }

    /// Native coin first, then every token.
    pub fn all(&self) -> impl Iterator<Item = &Asset> {
        std::iter::once(&self.native).chain(self.tokens.iter())
    }

    /// Look up a token by contract address (any case).
    pub fn by_contract(&self, contract: &str) -> Option<&Asset> {
        let contract = contract.to_ascii_lowercase();
        self.tokens
            .iter()
            .find(|t| t.contract.as_deref() == Some(contract.as_str()))
    }

    pub fn by_symbol(&self, symbol: &str) -> Option<&Asset> {
        self.all().find(|a| a.symbol.eq_ignore_ascii_case(symbol))
    }

    /// Contract addresses of every token.
    pub fn contracts(&self) -> Vec<String> {
        self.tokens
            .iter()
            .filter_map(|t| t.contract.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USDT: &str = "0xdAC17F958D2ee523a2206206994597C13D831ec7";

    #[test]
    fn test_registry_lookup() {
        let registry = TokenRegistry::new(
            Asset::native("ETH"),
            vec![
                Asset::token("USDT", USDT, 6).unwrap(),
                Asset::token("USDT-dup", USDT, 6).unwrap(),
            ],
        )
        .unwrap();

        assert_eq!(registry.tokens().len(), 1);
        assert_eq!(registry.all().count(), 2);
        assert_eq!(registry.by_contract(USDT).unwrap().symbol, "USDT");
        assert_eq!(registry.by_symbol("eth").unwrap(), registry.native());
        assert!(registry.by_contract("0x0000000000000000000000000000000000000001").is_none());
        assert_eq!(registry.contracts(), vec![USDT.to_ascii_lowercase()]);
    }

    #[test]
    fn test_native_is_not_a_token() {
        let registry = TokenRegistry::new(
            Asset::native("ETH"),
            vec![Asset::native("ETH2")],
        )
        .unwrap();
        assert!(registry.tokens().is_empty());
        assert!(registry.native().is_native());
    }
}
