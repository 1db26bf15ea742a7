// ABOUTME: Client credentials grant for machine-to-machine access
// ABOUTME: Fetches with Basic auth and retries transient failures with short exponential backoff

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sonata_config::{constants::SONATA_CLIENT_SECRET, ConfigError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{AuthError, AuthResult},
    oauth::{
        manager::{basic_auth_header, AuthManager, OAuthBase},
        storage::TokenStore,
        types::{OAuthConfig, TokenInfo},
    },
};

/// Total token endpoint attempts per fetch
const MAX_FETCH_ATTEMPTS: u32 = 3;
const FETCH_BACKOFF_BASE: Duration = Duration::from_millis(100);

/// No user interaction; a new token can always be fetched.
pub struct ClientCredentialsFlow {
    base: OAuthBase,
    client_secret: String,
}

impl std::fmt::Debug for ClientCredentialsFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentialsFlow")
            .field("base", &self.base)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

impl ClientCredentialsFlow {
    /// Fails when no client secret was given or found in the environment
    pub fn new(config: OAuthConfig) -> AuthResult<Self> {
        let client_secret = config
            .client_secret
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing {
                field: "client secret",
                env_var: SONATA_CLIENT_SECRET,
            })?;
        Ok(Self {
            base: OAuthBase::new(config)?,
            client_secret,
        })
    }

    /// Explicit credentials with environment fallback
    pub fn from_credentials(client_id: Option<&str>, client_secret: Option<&str>) -> AuthResult<Self> {
        Self::new(OAuthConfig::resolve(client_id, client_secret, None)?)
    }

    pub fn with_store(mut self, store: Arc<dyn TokenStore>) -> Self {
        self.base = self.base.with_store(store);
        self
    }

    pub fn config(&self) -> &OAuthConfig {
        self.base.config()
    }

    pub async fn logout(&self) -> AuthResult<()> {
        self.base.clear_token().await
    }

    async fn fetch_token(&self, cancel: &CancellationToken) -> AuthResult<TokenInfo> {
        let config = self.base.config();
        let authorization = basic_auth_header(&config.client_id, &self.client_secret);
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(AuthError::Cancelled { attempts: attempt });
            }

            let result = self
                .base
                .request_token(
                    &[("grant_type", "client_credentials")],
                    Some(authorization.clone()),
                    cancel,
                )
                .await;
            attempt += 1;

            let err = match result {
                Ok(response) => {
                    info!("Obtained client credentials token");
                    return Ok(TokenInfo::from_response(response, Utc::now().timestamp()));
                }
                Err(e) if e.is_cancelled() => return Err(AuthError::Cancelled { attempts: attempt }),
                Err(e) => e,
            };

            if !err.is_transient() {
                return Err(err);
            }
            if attempt >= MAX_FETCH_ATTEMPTS {
                return Err(AuthError::MaxRetriesExceeded {
                    attempts: attempt,
                    source: Box::new(err),
                });
            }

            let delay = FETCH_BACKOFF_BASE * 2u32.pow(attempt - 1);
            warn!(
                "Token fetch attempt {} failed ({}), retrying in {:?}",
                attempt, err, delay
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(AuthError::Cancelled { attempts: attempt }),
            }
        }
    }
}

#[async_trait]
impl AuthManager for ClientCredentialsFlow {
    async fn get_access_token(&self, cancel: &CancellationToken) -> AuthResult<String> {
        if let Some(token) = self.base.valid_token().await? {
            return Ok(token.access_token);
        }

        let _guard = self.base.fetch_guard().await;
        // Another caller may have fetched while we waited
        if let Some(token) = self.base.valid_token().await? {
            return Ok(token.access_token);
        }

        debug!("No valid client credentials token, fetching");
        let token = self.fetch_token(cancel).await?;
        let access_token = token.access_token.clone();
        self.base.set_token(token).await;
        Ok(access_token)
    }

    async fn get_cached_token(&self) -> AuthResult<Option<TokenInfo>> {
        self.base.cached_token().await
    }

    async fn refresh_token(&self, cancel: &CancellationToken) -> AuthResult<TokenInfo> {
        let _guard = self.base.fetch_guard().await;
        let token = self.fetch_token(cancel).await?;
        self.base.set_token(token.clone()).await;
        Ok(token)
    }
}
