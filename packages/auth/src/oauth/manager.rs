// ABOUTME: AuthManager capability shared by all grant flows, plus the composed base they delegate to
// ABOUTME: The base owns config, HTTP client, current token, optional store, and token endpoint plumbing

use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use reqwest::{header, Client};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::{Mutex, MutexGuard, RwLock},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::{AuthError, AuthResult},
    oauth::{
        server::CallbackServer,
        storage::TokenStore,
        types::{OAuthConfig, OAuthErrorResponse, TokenInfo, TokenResponse},
    },
};

/// Token source the request executor pulls from before every attempt.
#[async_trait]
pub trait AuthManager: Send + Sync {
    /// A valid access token, fetching or refreshing as the flow allows
    async fn get_access_token(&self, cancel: &CancellationToken) -> AuthResult<String>;

    /// Most recent token known to this manager, valid or not
    async fn get_cached_token(&self) -> AuthResult<Option<TokenInfo>>;

    /// Obtain a new token without user interaction
    async fn refresh_token(&self, cancel: &CancellationToken) -> AuthResult<TokenInfo>;
}

/// `Basic base64(client_id:client_secret)`
pub fn basic_auth_header(client_id: &str, client_secret: &str) -> String {
    format!(
        "Basic {}",
        STANDARD.encode(format!("{}:{}", client_id, client_secret))
    )
}

/// How the caller of [`OAuthBase::capture_redirect`] expects the redirect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RedirectCapture {
    /// Returns the authorization code
    Code,
    /// Returns the raw redirect fragment
    Token,
}

/// State and plumbing every flow composes
pub struct OAuthBase {
    config: OAuthConfig,
    http: Client,
    token: RwLock<Option<TokenInfo>>,
    store: Option<Arc<dyn TokenStore>>,
    fetch_lock: Mutex<()>,
}

impl std::fmt::Debug for OAuthBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthBase")
            .field("client_id", &self.config.client_id)
            .field("scope", &self.config.scope)
            .field("has_store", &self.store.is_some())
            .finish_non_exhaustive()
    }
}

impl OAuthBase {
    pub fn new(config: OAuthConfig) -> AuthResult<Self> {
        let http = Client::builder()
            .timeout(config.requests_timeout)
            .build()
            .map_err(|e| AuthError::Configuration(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self::with_http_client(config, http))
    }

    pub fn with_http_client(config: OAuthConfig, http: Client) -> Self {
        Self {
            config,
            http,
            token: RwLock::new(None),
            store: None,
            fetch_lock: Mutex::new(()),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn TokenStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    pub(crate) fn redirect_uri(&self) -> AuthResult<&str> {
        self.config.redirect_uri.as_deref().ok_or_else(|| {
            sonata_config::ConfigError::Missing {
                field: "redirect uri",
                env_var: sonata_config::constants::SONATA_REDIRECT_URI,
            }
            .into()
        })
    }

    /// Serializes token fetches so concurrent callers share one network call
    pub(crate) async fn fetch_guard(&self) -> MutexGuard<'_, ()> {
        self.fetch_lock.lock().await
    }

    async fn stored_token(&self) -> AuthResult<Option<TokenInfo>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        match store.get_cached_token().await {
            Ok(token) => Ok(token),
            Err(AuthError::Storage(message)) => {
                warn!("Ignoring unreadable token cache: {}", message);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Store first, then the in-memory token
    pub async fn cached_token(&self) -> AuthResult<Option<TokenInfo>> {
        if let Some(token) = self.stored_token().await? {
            return Ok(Some(token));
        }
        Ok(self.token.read().await.clone())
    }

    /// A non-expired token from the store or memory. A valid stored token is
    /// adopted as the current in-memory token.
    pub async fn valid_token(&self) -> AuthResult<Option<TokenInfo>> {
        let now = Utc::now().timestamp();
        if let Some(token) = self.stored_token().await? {
            if !token.is_expired_at(now) {
                debug!("Using cached token");
                *self.token.write().await = Some(token.clone());
                return Ok(Some(token));
            }
        }
        let current = self.token.read().await;
        Ok(current.as_ref().filter(|t| !t.is_expired_at(now)).cloned())
    }

    /// Refresh token from whichever known token still carries one
    pub async fn known_refresh_token(&self) -> AuthResult<Option<TokenInfo>> {
        if let Some(token) = self
            .stored_token()
            .await?
            .filter(|t| t.refresh_token.is_some())
        {
            return Ok(Some(token));
        }
        let current = self.token.read().await;
        Ok(current
            .as_ref()
            .filter(|t| t.refresh_token.is_some())
            .cloned())
    }

    /// Make `token` current and persist it. A failed cache write is logged,
    /// the token stays usable in memory.
    pub async fn set_token(&self, token: TokenInfo) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_token_to_cache(&token).await {
                warn!("Failed to save token to cache: {}", e);
            }
        }
        *self.token.write().await = Some(token);
    }

    /// Forget the current token in memory and in the store
    pub async fn clear_token(&self) -> AuthResult<()> {
        *self.token.write().await = None;
        if let Some(store) = &self.store {
            store.clear().await?;
        }
        Ok(())
    }

    /// Authorization URL with every parameter URL-encoded
    pub fn authorize_url(
        &self,
        response_type: &str,
        state: Option<&str>,
        extra: &[(&str, &str)],
    ) -> AuthResult<String> {
        let redirect_uri = self.redirect_uri()?;
        let mut url = Url::parse(&self.config.endpoints.authorize_url).map_err(|e| {
            AuthError::Configuration(format!(
                "Invalid authorization URL {}: {}",
                self.config.endpoints.authorize_url, e
            ))
        })?;

        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("client_id", &self.config.client_id)
                .append_pair("response_type", response_type)
                .append_pair("redirect_uri", redirect_uri);
            if !self.config.scope.is_empty() {
                query.append_pair("scope", &self.config.scope);
            }
            if let Some(state) = state {
                query.append_pair("state", state);
            }
            if self.config.show_dialog {
                query.append_pair("show_dialog", "true");
            }
            for (key, value) in extra {
                query.append_pair(key, value);
            }
        }

        Ok(url.into())
    }

    /// POST a form to the token endpoint. Cancellation aborts the request.
    pub(crate) async fn request_token(
        &self,
        form: &[(&str, &str)],
        authorization: Option<String>,
        cancel: &CancellationToken,
    ) -> AuthResult<TokenResponse> {
        let mut request = self
            .http
            .post(&self.config.endpoints.token_url)
            .header(header::ACCEPT, "application/json")
            .form(form);
        if let Some(value) = authorization {
            request = request.header(header::AUTHORIZATION, value);
        }

        let exchange = async {
            let response = request.send().await?;
            let status = response.status();
            let body = response.text().await?;
            Ok::<_, AuthError>((status, body))
        };

        let (status, body) = tokio::select! {
            result = exchange => result?,
            _ = cancel.cancelled() => return Err(AuthError::Cancelled { attempts: 0 }),
        };

        if !status.is_success() {
            warn!("Token endpoint returned {}", status);
            if status.as_u16() < 500 {
                if let Ok(oauth) = serde_json::from_str::<OAuthErrorResponse>(&body) {
                    return Err(AuthError::OAuth {
                        error: oauth.error,
                        description: oauth.error_description,
                    });
                }
            }
            return Err(AuthError::TokenEndpoint {
                status: status.as_u16(),
                body,
            });
        }

        Ok(serde_json::from_str(&body)?)
    }

    /// Send the user to `auth_url` and capture the redirect, either with the
    /// loopback server or by asking for the redirected URL on stdin.
    pub(crate) async fn capture_redirect(
        &self,
        auth_url: &str,
        state: &str,
        capture: RedirectCapture,
        cancel: &CancellationToken,
    ) -> AuthResult<String> {
        let redirect_uri = self.redirect_uri()?;

        if let Some(server) = CallbackServer::for_redirect_uri(redirect_uri) {
            // Bind before the browser can race us to the port
            let bound = server.with_expected_state(state).bind().await?;
            self.send_user_to(auth_url);
            return match capture {
                RedirectCapture::Code => bound.wait_for_code(cancel).await,
                RedirectCapture::Token => bound.wait_for_fragment(cancel).await,
            };
        }

        self.send_user_to(auth_url);
        println!("Paste the URL you were redirected to:");
        let entered = read_line(cancel).await?;
        match capture {
            RedirectCapture::Code => parse_response_code(&entered, Some(state)),
            RedirectCapture::Token => redirect_fragment(&entered),
        }
    }

    fn send_user_to(&self, auth_url: &str) {
        if self.config.open_browser {
            match open::that(auth_url) {
                Ok(()) => {
                    info!("Opened browser for authorization");
                    return;
                }
                Err(e) => warn!("Failed to open browser: {}", e),
            }
        }
        println!("Please visit this URL to authorize: {}", auth_url);
    }
}

async fn read_line(cancel: &CancellationToken) -> AuthResult<String> {
    let mut line = String::new();
    let mut reader = BufReader::new(tokio::io::stdin());
    tokio::select! {
        result = reader.read_line(&mut line) => { result?; }
        _ = cancel.cancelled() => return Err(AuthError::Cancelled { attempts: 0 }),
    }
    Ok(line.trim().to_string())
}

/// The `#...` part of a pasted redirect URL
pub(crate) fn redirect_fragment(url: &str) -> AuthResult<String> {
    let parsed = Url::parse(url)
        .map_err(|e| AuthError::Configuration(format!("Invalid redirect URL: {}", e)))?;
    parsed.fragment().map(str::to_string).ok_or_else(|| AuthError::OAuth {
        error: "missing_fragment".to_string(),
        description: Some("Redirect URL carries no token fragment".to_string()),
    })
}

/// Pull the authorization code out of a redirect URL.
///
/// A provider `error` is reported first, then the state is compared.
pub fn parse_response_code(url: &str, expected_state: Option<&str>) -> AuthResult<String> {
    let parsed = Url::parse(url)
        .map_err(|e| AuthError::Configuration(format!("Invalid redirect URL: {}", e)))?;
    let params: std::collections::HashMap<String, String> =
        parsed.query_pairs().into_owned().collect();

    if let Some(error) = params.get("error") {
        return Err(AuthError::OAuth {
            error: error.clone(),
            description: params.get("error_description").cloned(),
        });
    }

    if let Some(expected) = expected_state {
        let received = params.get("state").cloned().unwrap_or_default();
        if received != expected {
            return Err(AuthError::StateMismatch {
                expected: expected.to_string(),
                received,
            });
        }
    }

    params.get("code").cloned().ok_or_else(|| AuthError::OAuth {
        error: "missing_code".to_string(),
        description: Some("Redirect URL carries no authorization code".to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::types::Endpoints;

    fn base() -> OAuthBase {
        let config = OAuthConfig::new("my id")
            .with_redirect_uri("http://127.0.0.1:8080/callback")
            .with_scope(["user-read-email,playlist-read-private"])
            .with_endpoints(Endpoints {
                authorize_url: "https://auth.example.com/authorize".to_string(),
                token_url: "https://auth.example.com/token".to_string(),
            });
        OAuthBase::with_http_client(config, Client::new())
    }

    #[test]
    fn test_basic_auth_header() {
        assert_eq!(basic_auth_header("id", "secret"), "Basic aWQ6c2VjcmV0");
    }

    #[test]
    fn test_authorize_url_encodes_every_parameter() {
        let url = base()
            .authorize_url("code", Some("st&te"), &[("code_challenge_method", "S256")])
            .unwrap();
        let parsed = Url::parse(&url).unwrap();
        let pairs: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();

        assert!(url.starts_with("https://auth.example.com/authorize?client_id=my+id"));
        assert!(url.contains("redirect_uri=http%3A%2F%2F127.0.0.1%3A8080%2Fcallback"));
        assert!(pairs.contains(&("state".to_string(), "st&te".to_string())));
        assert!(pairs.contains(&(
            "scope".to_string(),
            "playlist-read-private user-read-email".to_string()
        )));
        assert!(pairs.contains(&("code_challenge_method".to_string(), "S256".to_string())));
        assert!(!pairs.iter().any(|(k, _)| k == "show_dialog"));
    }

    #[test]
    fn test_authorize_url_omits_optional_parameters() {
        let config = OAuthConfig::new("id")
            .with_redirect_uri("http://127.0.0.1:8080/callback")
            .with_show_dialog(true);
        let url = OAuthBase::with_http_client(config, Client::new())
            .authorize_url("token", None, &[])
            .unwrap();
        assert!(url.contains("response_type=token"));
        assert!(url.contains("show_dialog=true"));
        assert!(!url.contains("scope="));
        assert!(!url.contains("state="));
    }

    #[test]
    fn test_authorize_url_requires_redirect_uri() {
        let base = OAuthBase::with_http_client(OAuthConfig::new("id"), Client::new());
        assert!(matches!(
            base.authorize_url("code", None, &[]),
            Err(AuthError::Configuration(_))
        ));
    }

    #[test]
    fn test_parse_response_code() {
        let code = parse_response_code(
            "http://127.0.0.1:8080/callback?code=abc&state=xyz",
            Some("xyz"),
        )
        .unwrap();
        assert_eq!(code, "abc");
    }

    #[test]
    fn test_parse_response_code_error_wins_over_state() {
        let err = parse_response_code(
            "http://127.0.0.1:8080/callback?error=access_denied&state=other",
            Some("xyz"),
        )
        .unwrap_err();
        assert!(matches!(err, AuthError::OAuth { error, .. } if error == "access_denied"));
    }

    #[test]
    fn test_parse_response_code_state_mismatch() {
        let err = parse_response_code(
            "http://127.0.0.1:8080/callback?code=abc&state=evil",
            Some("xyz"),
        )
        .unwrap_err();
        match err {
            AuthError::StateMismatch { expected, received } => {
                assert_eq!(expected, "xyz");
                assert_eq!(received, "evil");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_set_token_then_valid_token() {
        let base = base();
        assert!(base.valid_token().await.unwrap().is_none());

        let token = TokenInfo::from_response(
            serde_json::from_str(r#"{"access_token":"tok","expires_in":3600}"#).unwrap(),
            Utc::now().timestamp(),
        );
        base.set_token(token.clone()).await;
        assert_eq!(base.valid_token().await.unwrap(), Some(token.clone()));
        assert_eq!(base.cached_token().await.unwrap(), Some(token));

        base.clear_token().await.unwrap();
        assert!(base.cached_token().await.unwrap().is_none());
    }
}
