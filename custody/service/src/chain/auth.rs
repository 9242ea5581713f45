// Copyright (c) 2024 The Botho Foundation

//! Bearer credentials for authenticated RPC providers.
//!
//! Many callers share one [`CredentialManager`]. When a request is rejected
//! with 401 the caller hands back the generation it used; the first caller to
//! do so fetches a new token while the rest wait for it and reuse the result.

use async_trait::async_trait;
use bth_custody_core::config::ChainAuth;
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::RpcError;

/// A bearer token plus the refresh generation that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub generation: u64,
}

/// Somewhere new bearer tokens come from.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch(&self) -> Result<String, RpcError>;
}

/// A fixed token that never changes.
pub struct StaticToken(pub String);

#[async_trait]
impl CredentialSource for StaticToken {
    async fn fetch(&self) -> Result<String, RpcError> {
        Ok(self.0.clone())
    }
}

/// OAuth-style client-credentials token endpoint.
pub struct TokenEndpoint {
    client: reqwest::Client,
    url: String,
    client_id: String,
    client_secret: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

impl TokenEndpoint {
    pub fn new(
        url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, RpcError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        })
    }
}

#[async_trait]
impl CredentialSource for TokenEndpoint {
    async fn fetch(&self) -> Result<String, RpcError> {
        let response = self
            .client
            .post(&self.url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| RpcError::Credential(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RpcError::Credential(format!("{}: {}", status, body)));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| RpcError::Credential(e.to_string()))?;
        Ok(token.access_token)
    }
}

/// Shared, single-flight holder of the current credential.
pub struct CredentialManager {
    source: Arc<dyn CredentialSource>,
    current: RwLock<Option<Credential>>,
    refresh_lock: Mutex<()>,
}

impl CredentialManager {
    pub fn new(source: Arc<dyn CredentialSource>) -> Self {
        Self {
            source,
            current: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Build from the `[chain.auth]` config section.
    pub fn from_config(auth: &ChainAuth, timeout: Duration) -> Result<Self, RpcError> {
        let source: Arc<dyn CredentialSource> = match auth {
            ChainAuth::Static { token } => Arc::new(StaticToken(token.clone())),
            ChainAuth::Endpoint {
                url,
                client_id,
                client_secret,
            } => Arc::new(TokenEndpoint::new(
                url.clone(),
                client_id.clone(),
                client_secret.clone(),
                timeout,
            )?),
        };
        Ok(Self::new(source))
    }

    /// The current credential, fetching the first one if needed.
    pub async fn current(&self) -> Result<Credential, RpcError> {
        if let Some(credential) = self.current.read().await.clone() {
            return Ok(credential);
        }
        self.refresh(None).await
    }

    /// Replace the credential of generation `stale`.
    ///
    /// If another caller already replaced it, the newer credential is
    /// returned without contacting the source again.
    pub async fn refresh(&self, stale: Option<u64>) -> Result<Credential, RpcError> {
        let _guard = self.refresh_lock.lock().await;

        if let Some(existing) = self.current.read().await.clone() {
            let superseded = match stale {
                Some(generation) => existing.generation > generation,
                None => true,
            };
            if superseded {
                debug!(generation = existing.generation, "Credential already refreshed");
                return Ok(existing);
            }
        }

        let token = self.source.fetch().await?;
        let mut current = self.current.write().await;
        let generation = current.as_ref().map(|c| c.generation + 1).unwrap_or(1);
        let credential = Credential { token, generation };
        *current = Some(credential.clone());
        info!(generation, "Fetched new RPC credential");
        Ok(credential)
    }
}
