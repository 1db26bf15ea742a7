// ABOUTME: Core type definitions for OAuth authentication
// ABOUTME: Includes the cached token shape, token endpoint responses, endpoints, and per-manager settings

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sonata_config::constants::{
    DEFAULT_AUTHORIZE_URL, DEFAULT_REQUEST_TIMEOUT_SECS, DEFAULT_TOKEN_URL, SONATA_CLIENT_ID,
    SONATA_CLIENT_SECRET, SONATA_REDIRECT_URI,
};

use crate::{error::AuthResult, oauth::scope::normalize_scope};

/// Seconds before expiry at which a token is already treated as expired.
pub const EXPIRY_MARGIN_SECS: i64 = 60;

/// Largest `expires_at` we will ever store (max 32-bit epoch).
pub const MAX_EXPIRES_AT: i64 = i32::MAX as i64;

/// `expires_in` used when the provider omits it.
pub const DEFAULT_EXPIRES_IN: i64 = 3600;

/// OAuth token as cached on disk and held in memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: i64, // Seconds, as returned
    #[serde(default)]
    pub expires_at: i64, // Unix timestamp, 0 = never computed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: String, // Space-separated, normalized
    #[serde(flatten)]
    pub additional_fields: HashMap<String, Value>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Derive the absolute expiry, clamped so absurd `expires_in` values never wrap.
pub fn compute_expires_at(now: i64, expires_in: i64) -> i64 {
    now.saturating_add(expires_in).min(MAX_EXPIRES_AT)
}

impl TokenInfo {
    /// Build a token from a token endpoint response received at `now`
    pub fn from_response(response: TokenResponse, now: i64) -> Self {
        let expires_in = response.expires_in.unwrap_or(DEFAULT_EXPIRES_IN);
        Self {
            access_token: response.access_token,
            token_type: response.token_type.unwrap_or_else(default_token_type),
            expires_in,
            expires_at: compute_expires_at(now, expires_in),
            refresh_token: response.refresh_token.filter(|t| !t.is_empty()),
            scope: normalize_scope([response.scope.unwrap_or_default()]),
            additional_fields: response.additional_fields,
        }
    }

    /// Check if token is expired with the refresh-ahead margin
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now().timestamp())
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at == 0 || self.expires_at - now < EXPIRY_MARGIN_SECS
    }

    /// Check if token is valid (not expired)
    pub fn is_valid(&self) -> bool {
        !self.is_expired()
    }

    /// Seconds left before `expires_at`, never negative
    pub fn remaining_secs(&self, now: i64) -> i64 {
        (self.expires_at - now).max(0)
    }

    /// Value for the `Authorization` header
    pub fn authorization_header(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}

/// OAuth token response from the token endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(flatten)]
    pub additional_fields: HashMap<String, Value>,
}

/// OAuth error body (`{"error": "...", "error_description": "..."}`)
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// Authorization and token endpoints of the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub authorize_url: String,
    pub token_url: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            authorize_url: DEFAULT_AUTHORIZE_URL.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
        }
    }
}

/// Settings shared by every grant flow
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub redirect_uri: Option<String>,
    pub scope: String,
    pub endpoints: Endpoints,
    pub show_dialog: bool,
    pub open_browser: bool,
    pub state: Option<String>,
    pub requests_timeout: Duration,
}

impl OAuthConfig {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: None,
            redirect_uri: None,
            scope: String::new(),
            endpoints: Endpoints::default(),
            show_dialog: false,
            open_browser: true,
            state: None,
            requests_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }

    /// Resolve credentials: explicit arguments win, environment variables are the fallback.
    /// Only the client id is mandatory here; each flow checks what else it needs.
    pub fn resolve(
        client_id: Option<&str>,
        client_secret: Option<&str>,
        redirect_uri: Option<&str>,
    ) -> AuthResult<Self> {
        let client_id = sonata_config::require(client_id, "client id", SONATA_CLIENT_ID)?;
        let mut config = Self::new(client_id);
        config.client_secret = sonata_config::env_fallback(client_secret, SONATA_CLIENT_SECRET);
        config.redirect_uri = sonata_config::env_fallback(redirect_uri, SONATA_REDIRECT_URI);
        Ok(config)
    }

    /// Resolve everything from the environment
    pub fn from_env() -> AuthResult<Self> {
        Self::resolve(None, None, None)
    }

    pub fn with_client_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_secret = Some(secret.into());
        self
    }

    pub fn with_redirect_uri(mut self, redirect_uri: impl Into<String>) -> Self {
        self.redirect_uri = Some(redirect_uri.into());
        self
    }

    /// Accepts comma or space separated scopes; stored normalized
    pub fn with_scope<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.scope = normalize_scope(scopes);
        self
    }

    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_show_dialog(mut self, show_dialog: bool) -> Self {
        self.show_dialog = show_dialog;
        self
    }

    pub fn with_open_browser(mut self, open_browser: bool) -> Self {
        self.open_browser = open_browser;
        self
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn with_requests_timeout(mut self, timeout: Duration) -> Self {
        self.requests_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn create_test_token(expires_at: i64) -> TokenInfo {
        TokenInfo {
            access_token: "test-access-token".to_string(),
            token_type: "Bearer".to_string(),
            expires_in: 3600,
            expires_at,
            refresh_token: Some("test-refresh-token".to_string()),
            scope: "playlist-read-private user-read-email".to_string(),
            additional_fields: HashMap::new(),
        }
    }

    #[test]
    fn test_zero_expiry_is_always_expired() {
        let token = create_test_token(0);
        assert!(token.is_expired());
        assert!(token.is_expired_at(0));
    }

    #[test]
    fn test_token_expired_in_past() {
        let now = Utc::now().timestamp();
        assert!(create_test_token(now - 60).is_expired_at(now));
    }

    #[test]
    fn test_token_within_margin_is_expired() {
        let now = 1_700_000_000;
        assert!(create_test_token(now + 30).is_expired_at(now));
        assert!(create_test_token(now + 59).is_expired_at(now));
    }

    #[test]
    fn test_token_outside_margin_is_valid() {
        let now = 1_700_000_000;
        assert!(!create_test_token(now + 61).is_expired_at(now));
        assert!(!create_test_token(now + 3600).is_expired_at(now));
    }

    #[test]
    fn test_token_far_future_is_valid() {
        let token = create_test_token(Utc::now().timestamp() + 3600);
        assert!(token.is_valid());
    }

    #[test]
    fn test_compute_expires_at() {
        assert_eq!(compute_expires_at(1000, 3600), 4600);
        assert_eq!(compute_expires_at(1000, 0), 1000);
    }

    #[test]
    fn test_compute_expires_at_clamps_instead_of_wrapping() {
        assert_eq!(compute_expires_at(1_700_000_000, i64::MAX), MAX_EXPIRES_AT);
        assert_eq!(compute_expires_at(1_700_000_000, 1_000_000_000), MAX_EXPIRES_AT);
        assert!(compute_expires_at(i64::MAX, i64::MAX) > 0);
    }

    #[test]
    fn test_from_response_defaults() {
        let response: TokenResponse =
            serde_json::from_str(r#"{"access_token":"tok","expires_in":3600}"#).unwrap();
        let token = TokenInfo::from_response(response, 1000);
        assert_eq!(token.access_token, "tok");
        assert_eq!(token.token_type, "Bearer");
        assert_eq!(token.expires_at, 4600);
        assert_eq!(token.refresh_token, None);
        assert_eq!(token.scope, "");
    }

    #[test]
    fn test_from_response_normalizes_scope_and_keeps_extra_fields() {
        let response: TokenResponse = serde_json::from_str(
            r#"{"access_token":"tok","token_type":"Bearer","scope":"user-read-email playlist-read-private user-read-email","id_hint":"abc"}"#,
        )
        .unwrap();
        let token = TokenInfo::from_response(response, 1000);
        assert_eq!(token.scope, "playlist-read-private user-read-email");
        assert_eq!(token.expires_in, DEFAULT_EXPIRES_IN);
        assert_eq!(
            token.additional_fields.get("id_hint"),
            Some(&Value::String("abc".to_string()))
        );
    }

    #[test]
    fn test_cache_shape_round_trips_through_json() {
        let mut token = create_test_token(1_700_003_600);
        token
            .additional_fields
            .insert("market".to_string(), Value::String("SE".to_string()));

        let json = serde_json::to_value(&token).unwrap();
        assert_eq!(json["expires_at"], 1_700_003_600);
        assert_eq!(json["market"], "SE");

        let parsed: TokenInfo = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, token);
    }

    #[test]
    fn test_authorization_header() {
        let token = create_test_token(0);
        assert_eq!(token.authorization_header(), "Bearer test-access-token");
    }

    #[test]
    fn test_config_scope_is_normalized() {
        let config = OAuthConfig::new("id").with_scope(["user-read-email,playlist-read-private"]);
        assert_eq!(config.scope, "playlist-read-private user-read-email");
        assert!(config.open_browser);
        assert_eq!(config.endpoints, Endpoints::default());
    }

    #[test]
    fn test_resolve_prefers_explicit_arguments() {
        let config = OAuthConfig::resolve(Some("id"), Some("secret"), Some("http://127.0.0.1:8080/cb"))
            .unwrap();
        assert_eq!(config.client_id, "id");
        assert_eq!(config.client_secret.as_deref(), Some("secret"));
        assert_eq!(config.redirect_uri.as_deref(), Some("http://127.0.0.1:8080/cb"));
    }
}
