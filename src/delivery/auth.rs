//! Bearer tokens for the ingestion API.
//!
//! A [`TokenProvider`] knows how to fetch a fresh token; [`TokenCache`] keeps
//! the current one and only goes back to the provider when it is missing or
//! about to expire.

use async_trait::async_trait;
use serde::Deserialize;
use snafu::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::config::AuthConfig;
use crate::emit;
use crate::error::{AuthError, EmptyTokenSnafu, TokenDecodeSnafu, TokenRequestSnafu, TokenStatusSnafu};
use crate::metrics::events::TokenRefreshed;

/// Tokens expiring within this window are refreshed early.
pub const DEFAULT_EXPIRY_SKEW: Duration = Duration::from_secs(60);

/// A bearer token and when it stops being valid.
#[derive(Clone)]
pub struct AccessToken {
    pub secret: String,
    /// `None` means the token never expires.
    pub expires_at: Option<Instant>,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("secret", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl AccessToken {
    pub fn new(secret: impl Into<String>, expires_at: Option<Instant>) -> Self {
        Self {
            secret: secret.into(),
            expires_at,
        }
    }

    /// Whether the token is still usable `skew` from now.
    pub fn is_fresh(&self, skew: Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => Instant::now() + skew < expires_at,
            None => true,
        }
    }
}

/// Source of fresh bearer tokens.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn fetch(&self) -> Result<AccessToken, AuthError>;
}

/// A fixed token.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn fetch(&self) -> Result<AccessToken, AuthError> {
        ensure!(!self.token.is_empty(), EmptyTokenSnafu);
        Ok(AccessToken::new(self.token.clone(), None))
    }
}

#[derive(Deserialize)]
struct MetadataTokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Tokens from the host's instance metadata server.
pub struct MetadataServerTokenProvider {
    client: reqwest::Client,
    url: String,
    scopes: Vec<String>,
}

impl MetadataServerTokenProvider {
    pub fn new(client: reqwest::Client, url: impl Into<String>, scopes: Vec<String>) -> Self {
        Self {
            client,
            url: url.into(),
            scopes,
        }
    }
}

#[async_trait]
impl TokenProvider for MetadataServerTokenProvider {
    async fn fetch(&self) -> Result<AccessToken, AuthError> {
        let mut request = self
            .client
            .get(&self.url)
            .header("Metadata-Flavor", "Google");
        if !self.scopes.is_empty() {
            request = request.query(&[("scopes", self.scopes.join(","))]);
        }

        let response = request.send().await.context(TokenRequestSnafu)?;
        let status = response.status();
        ensure!(
            status.is_success(),
            TokenStatusSnafu {
                status: status.as_u16()
            }
        );

        let body: MetadataTokenResponse = response.json().await.context(TokenDecodeSnafu)?;
        ensure!(!body.access_token.is_empty(), EmptyTokenSnafu);

        let expires_at = body
            .expires_in
            .map(|secs| Instant::now() + Duration::from_secs(secs));
        Ok(AccessToken::new(body.access_token, expires_at))
    }
}

/// Build the provider named by the auth configuration.
pub fn provider_from_config(
    config: &AuthConfig,
    client: reqwest::Client,
) -> Arc<dyn TokenProvider> {
    match config {
        AuthConfig::Static { token } => Arc::new(StaticTokenProvider::new(token.clone())),
        AuthConfig::MetadataServer { url, scopes } => Arc::new(MetadataServerTokenProvider::new(
            client,
            url.clone(),
            scopes.clone(),
        )),
    }
}

/// Caches the current token and refreshes it on demand.
///
/// Concurrent callers share one refresh: the lock is held across the fetch.
pub struct TokenCache {
    provider: Arc<dyn TokenProvider>,
    skew: Duration,
    current: Mutex<Option<AccessToken>>,
}

impl TokenCache {
    pub fn new(provider: Arc<dyn TokenProvider>) -> Self {
        Self {
            provider,
            skew: DEFAULT_EXPIRY_SKEW,
            current: Mutex::new(None),
        }
    }

    pub fn with_skew(mut self, skew: Duration) -> Self {
        self.skew = skew;
        self
    }

    /// The cached token, refreshed first if missing or near expiry.
    pub async fn token(&self) -> Result<String, AuthError> {
        let mut current = self.current.lock().await;
        if let Some(token) = current.as_ref().filter(|t| t.is_fresh(self.skew)) {
            return Ok(token.secret.clone());
        }

        let token = self.fetch().await?;
        let secret = token.secret.clone();
        *current = Some(token);
        Ok(secret)
    }

    /// Fetch a new token unconditionally.
    pub async fn refresh(&self) -> Result<String, AuthError> {
        let mut current = self.current.lock().await;
        let token = self.fetch().await?;
        let secret = token.secret.clone();
        *current = Some(token);
        Ok(secret)
    }

    /// Drop the cached token so the next call re-authenticates.
    pub async fn invalidate(&self) {
        *self.current.lock().await = None;
    }

    async fn fetch(&self) -> Result<AccessToken, AuthError> {
        let token = self.provider.fetch().await?;
        debug!(expires_at = ?token.expires_at, "Refreshed ingestion token");
        emit!(TokenRefreshed);
        Ok(token)
    }
}
