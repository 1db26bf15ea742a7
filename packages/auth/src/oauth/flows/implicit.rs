// ABOUTME: Implicit grant: the token arrives in the redirect fragment, no token endpoint call
// ABOUTME: Kept for compatibility; there is no refresh, an expired token means authorizing again

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use url::Url;

use crate::{
    error::{AuthError, AuthResult},
    oauth::{
        manager::{AuthManager, OAuthBase, RedirectCapture},
        pkce::generate_state,
        scope::normalize_scope,
        storage::TokenStore,
        types::{compute_expires_at, OAuthConfig, TokenInfo, DEFAULT_EXPIRES_IN},
    },
};

/// Parse `access_token=...&expires_in=...&state=...` into a token.
///
/// A provider `error` is reported first. A missing or unparseable
/// `expires_in` means one hour.
pub fn parse_token_fragment(fragment: &str, expected_state: Option<&str>) -> AuthResult<TokenInfo> {
    let mut params: HashMap<String, String> = url::form_urlencoded::parse(fragment.as_bytes())
        .into_owned()
        .collect();

    if let Some(error) = params.remove("error") {
        return Err(AuthError::OAuth {
            error,
            description: params.remove("error_description"),
        });
    }

    let access_token = params
        .remove("access_token")
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AuthError::OAuth {
            error: "missing_access_token".to_string(),
            description: Some("Redirect fragment carries no access_token".to_string()),
        })?;
    let expires_in = params
        .remove("expires_in")
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(DEFAULT_EXPIRES_IN);
    let scope = normalize_scope([params.remove("scope").unwrap_or_default()]);

    let received_state = params.remove("state").unwrap_or_default();
    if let Some(expected) = expected_state {
        if received_state != expected {
            return Err(AuthError::StateMismatch {
                expected: expected.to_string(),
                received: received_state,
            });
        }
    }

    Ok(TokenInfo {
        access_token,
        token_type: params
            .remove("token_type")
            .unwrap_or_else(|| "Bearer".to_string()),
        expires_in,
        expires_at: compute_expires_at(Utc::now().timestamp(), expires_in),
        refresh_token: None,
        scope,
        additional_fields: HashMap::new(),
    })
}

/// Parse the fragment of a full redirect URL
pub fn parse_token_from_url(url: &str, expected_state: Option<&str>) -> AuthResult<TokenInfo> {
    let parsed = Url::parse(url)
        .map_err(|e| AuthError::Configuration(format!("Invalid redirect URL: {}", e)))?;
    parse_token_fragment(parsed.fragment().unwrap_or_default(), expected_state)
}

#[derive(Debug)]
pub struct ImplicitGrantFlow {
    base: OAuthBase,
}

impl ImplicitGrantFlow {
    /// Requires a redirect URI
    pub fn new(config: OAuthConfig) -> AuthResult<Self> {
        let base = OAuthBase::new(config)?;
        base.redirect_uri()?;
        Ok(Self { base })
    }

    pub fn with_store(mut self, store: Arc<dyn TokenStore>) -> Self {
        self.base = self.base.with_store(store);
        self
    }

    pub fn config(&self) -> &OAuthConfig {
        self.base.config()
    }

    /// Authorization URL for `response_type=token`
    pub fn get_auth_url(&self, state: Option<&str>) -> AuthResult<String> {
        self.base.authorize_url("token", state, &[])
    }

    pub async fn authorize(&self, cancel: &CancellationToken) -> AuthResult<TokenInfo> {
        let state = self
            .base
            .config()
            .state
            .clone()
            .unwrap_or_else(generate_state);
        let auth_url = self.get_auth_url(Some(&state))?;

        info!("Starting implicit grant flow");
        let fragment = self
            .base
            .capture_redirect(&auth_url, &state, RedirectCapture::Token, cancel)
            .await?;
        let token = parse_token_fragment(&fragment, Some(&state))?;

        self.base.set_token(token.clone()).await;
        Ok(token)
    }

    /// Adopt a token parsed from a redirect URL obtained out of band
    pub async fn accept_redirect(&self, url: &str, expected_state: Option<&str>) -> AuthResult<TokenInfo> {
        let token = parse_token_from_url(url, expected_state)?;
        self.base.set_token(token.clone()).await;
        Ok(token)
    }

    pub async fn logout(&self) -> AuthResult<()> {
        self.base.clear_token().await
    }
}

#[async_trait]
impl AuthManager for ImplicitGrantFlow {
    async fn get_access_token(&self, _cancel: &CancellationToken) -> AuthResult<String> {
        self.base
            .valid_token()
            .await?
            .map(|token| token.access_token)
            .ok_or(AuthError::AuthorizationRequired)
    }

    async fn get_cached_token(&self) -> AuthResult<Option<TokenInfo>> {
        self.base.cached_token().await
    }

    async fn refresh_token(&self, _cancel: &CancellationToken) -> AuthResult<TokenInfo> {
        Err(AuthError::RefreshNotSupported("implicit grant"))
    }
}
