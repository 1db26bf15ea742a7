// ABOUTME: Authorization code grant with a client secret
// ABOUTME: Interactive authorization, one-time code exchange with scope check, and refresh

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sonata_config::{constants::SONATA_CLIENT_SECRET, ConfigError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    error::{AuthError, AuthResult},
    oauth::{
        manager::{basic_auth_header, AuthManager, OAuthBase, RedirectCapture},
        pkce::generate_state,
        scope::scope_satisfied,
        storage::TokenStore,
        types::{OAuthConfig, TokenInfo, TokenResponse},
    },
};

pub struct AuthorizationCodeFlow {
    base: OAuthBase,
    client_secret: String,
}

impl std::fmt::Debug for AuthorizationCodeFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationCodeFlow")
            .field("base", &self.base)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

impl AuthorizationCodeFlow {
    /// Requires a client secret and a redirect URI
    pub fn new(config: OAuthConfig) -> AuthResult<Self> {
        let client_secret = config
            .client_secret
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing {
                field: "client secret",
                env_var: SONATA_CLIENT_SECRET,
            })?;
        let base = OAuthBase::new(config)?;
        base.redirect_uri()?;
        Ok(Self {
            base,
            client_secret,
        })
    }

    pub fn with_store(mut self, store: Arc<dyn TokenStore>) -> Self {
        self.base = self.base.with_store(store);
        self
    }

    pub fn config(&self) -> &OAuthConfig {
        self.base.config()
    }

    /// Authorization URL for `response_type=code`
    pub fn get_auth_url(&self, state: Option<&str>) -> AuthResult<String> {
        self.base.authorize_url("code", state, &[])
    }

    /// Run the interactive flow end to end and store the resulting token
    pub async fn authorize(&self, cancel: &CancellationToken) -> AuthResult<TokenInfo> {
        let state = self
            .base
            .config()
            .state
            .clone()
            .unwrap_or_else(generate_state);
        let auth_url = self.get_auth_url(Some(&state))?;

        info!("Starting authorization code flow");
        let code = self
            .base
            .capture_redirect(&auth_url, &state, RedirectCapture::Code, cancel)
            .await?;
        self.exchange_code(&code, cancel).await
    }

    /// Trade a one-time authorization code for a token
    pub async fn exchange_code(&self, code: &str, cancel: &CancellationToken) -> AuthResult<TokenInfo> {
        let redirect_uri = self.base.redirect_uri()?;
        let response = self
            .base
            .request_token(
                &[
                    ("grant_type", "authorization_code"),
                    ("code", code),
                    ("redirect_uri", redirect_uri),
                ],
                Some(self.authorization()),
                cancel,
            )
            .await?;

        let token = exchanged_token(response, &self.base.config().scope)?;

        info!("Exchanged authorization code for token");
        self.base.set_token(token.clone()).await;
        Ok(token)
    }

    /// Refresh with `previous.refresh_token`; the caller holds the fetch guard
    async fn refresh_locked(
        &self,
        previous: TokenInfo,
        cancel: &CancellationToken,
    ) -> AuthResult<TokenInfo> {
        let refresh_token = previous.refresh_token.as_deref().unwrap_or_default();

        let response = self
            .base
            .request_token(
                &[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", refresh_token),
                ],
                Some(self.authorization()),
                cancel,
            )
            .await?;

        let token = merge_refreshed(
            TokenInfo::from_response(response, Utc::now().timestamp()),
            &previous,
        );
        info!("Refreshed access token");
        self.base.set_token(token.clone()).await;
        Ok(token)
    }

    pub async fn logout(&self) -> AuthResult<()> {
        self.base.clear_token().await
    }

    fn authorization(&self) -> String {
        basic_auth_header(&self.base.config().client_id, &self.client_secret)
    }
}

/// Granted scopes must cover everything requested
fn check_granted_scope(requested: &str, granted: &str) -> AuthResult<()> {
    if scope_satisfied(requested, granted) {
        Ok(())
    } else {
        Err(AuthError::ScopeMismatch {
            requested: requested.to_string(),
            granted: granted.to_string(),
        })
    }
}

/// Token from a code exchange response. A response without `scope` was
/// granted exactly what was requested; one with `scope` must cover it.
pub(crate) fn exchanged_token(response: TokenResponse, requested: &str) -> AuthResult<TokenInfo> {
    let scope_omitted = response.scope.is_none();
    let mut token = TokenInfo::from_response(response, Utc::now().timestamp());
    if scope_omitted {
        token.scope = requested.to_string();
    } else {
        check_granted_scope(requested, &token.scope)?;
    }
    Ok(token)
}

/// Carry over what the provider left out of a refresh response
pub(crate) fn merge_refreshed(mut refreshed: TokenInfo, previous: &TokenInfo) -> TokenInfo {
    if refreshed.refresh_token.is_none() {
        refreshed.refresh_token = previous.refresh_token.clone();
    }
    if refreshed.scope.is_empty() {
        refreshed.scope = previous.scope.clone();
    }
    refreshed
}

#[async_trait]
impl AuthManager for AuthorizationCodeFlow {
    async fn get_access_token(&self, cancel: &CancellationToken) -> AuthResult<String> {
        if let Some(token) = self.base.valid_token().await? {
            return Ok(token.access_token);
        }

        let _guard = self.base.fetch_guard().await;
        // Another caller may have refreshed while we waited
        if let Some(token) = self.base.valid_token().await? {
            return Ok(token.access_token);
        }
        let previous = self
            .base
            .known_refresh_token()
            .await?
            .ok_or(AuthError::AuthorizationRequired)?;

        debug!("Access token expired, refreshing");
        Ok(self.refresh_locked(previous, cancel).await?.access_token)
    }

    async fn get_cached_token(&self) -> AuthResult<Option<TokenInfo>> {
        self.base.cached_token().await
    }

    async fn refresh_token(&self, cancel: &CancellationToken) -> AuthResult<TokenInfo> {
        let _guard = self.base.fetch_guard().await;
        let previous = self
            .base
            .known_refresh_token()
            .await?
            .ok_or(AuthError::NoRefreshToken)?;
        self.refresh_locked(previous, cancel).await
    }
}
