// ABOUTME: Authorization code grant with PKCE for public clients
// ABOUTME: No client secret; client_id and code_verifier travel in the form body

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::authorization_code::{exchanged_token, merge_refreshed};
use crate::{
    error::{AuthError, AuthResult},
    oauth::{
        manager::{AuthManager, OAuthBase, RedirectCapture},
        pkce::{generate_state, PkceChallenge, CODE_CHALLENGE_METHOD},
        storage::TokenStore,
        types::{OAuthConfig, TokenInfo},
    },
};

#[derive(Debug)]
pub struct PkceFlow {
    base: OAuthBase,
    /// Created on the first authorization URL and kept for the lifetime of the flow
    pkce: OnceLock<PkceChallenge>,
}

impl PkceFlow {
    /// Requires a redirect URI; any client secret in `config` is ignored
    pub fn new(config: OAuthConfig) -> AuthResult<Self> {
        let base = OAuthBase::new(config)?;
        base.redirect_uri()?;
        Ok(Self {
            base,
            pkce: OnceLock::new(),
        })
    }

    /// Resume with a verifier from an earlier session
    pub fn with_challenge(self, challenge: PkceChallenge) -> Self {
        Self {
            pkce: OnceLock::from(challenge),
            ..self
        }
    }

    pub fn with_store(mut self, store: Arc<dyn TokenStore>) -> Self {
        self.base = self.base.with_store(store);
        self
    }

    pub fn config(&self) -> &OAuthConfig {
        self.base.config()
    }

    /// The verifier/challenge pair, generating it on first use
    pub fn challenge(&self) -> &PkceChallenge {
        self.pkce.get_or_init(PkceChallenge::generate)
    }

    /// Authorization URL with `code_challenge` and `code_challenge_method=S256`
    pub fn get_auth_url(&self, state: Option<&str>) -> AuthResult<String> {
        let challenge = self.challenge();
        self.base.authorize_url(
            "code",
            state,
            &[
                ("code_challenge_method", CODE_CHALLENGE_METHOD),
                ("code_challenge", challenge.code_challenge.as_str()),
            ],
        )
    }

    pub async fn authorize(&self, cancel: &CancellationToken) -> AuthResult<TokenInfo> {
        let state = self
            .base
            .config()
            .state
            .clone()
            .unwrap_or_else(generate_state);
        let auth_url = self.get_auth_url(Some(&state))?;

        info!("Starting PKCE authorization flow");
        let code = self
            .base
            .capture_redirect(&auth_url, &state, RedirectCapture::Code, cancel)
            .await?;
        self.exchange_code(&code, cancel).await
    }

    /// Trade a one-time authorization code for a token, proving possession of the verifier
    pub async fn exchange_code(&self, code: &str, cancel: &CancellationToken) -> AuthResult<TokenInfo> {
        let verifier = self
            .pkce
            .get()
            .map(|pkce| pkce.code_verifier.as_str())
            .ok_or_else(|| {
                AuthError::Configuration(
                    "No code verifier: build the authorization URL before exchanging a code"
                        .to_string(),
                )
            })?;
        let redirect_uri = self.base.redirect_uri()?;
        let config = self.base.config();

        let response = self
            .base
            .request_token(
                &[
                    ("grant_type", "authorization_code"),
                    ("code", code),
                    ("redirect_uri", redirect_uri),
                    ("client_id", config.client_id.as_str()),
                    ("code_verifier", verifier),
                ],
                None,
                cancel,
            )
            .await?;

        let token = exchanged_token(response, &config.scope)?;

        info!("Exchanged PKCE authorization code for token");
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
                    ("client_id", self.base.config().client_id.as_str()),
                ],
                None,
                cancel,
            )
            .await?;

        let token = merge_refreshed(
            TokenInfo::from_response(response, Utc::now().timestamp()),
            &previous,
        );
        info!("Refreshed PKCE access token");
        self.base.set_token(token.clone()).await;
        Ok(token)
    }

    pub async fn logout(&self) -> AuthResult<()> {
        self.base.clear_token().await
    }
}

#[async_trait]
impl AuthManager for PkceFlow {
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
