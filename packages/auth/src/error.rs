// ABOUTME: Error types for authentication and OAuth operations
// ABOUTME: Separates configuration, protocol, transport, storage, and cancellation failures

use std::path::PathBuf;

use thiserror::Error;

pub type AuthResult<T> = Result<T, AuthError>;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("OAuth error: {error}{}", .description.as_deref().map(|d| format!(" ({d})")).unwrap_or_default())]
    OAuth {
        error: String,
        description: Option<String>,
    },

    #[error("Granted scope '{granted}' does not cover requested scope '{requested}'")]
    ScopeMismatch { requested: String, granted: String },

    #[error("State mismatch: expected {expected}, received {received}")]
    StateMismatch { expected: String, received: String },

    #[error("Token refresh is not supported by the {0} flow")]
    RefreshNotSupported(&'static str),

    #[error("No valid token available; the user must authorize first")]
    AuthorizationRequired,

    #[error("No refresh token available")]
    NoRefreshToken,

    #[error("Token endpoint returned {status}: {body}")]
    TokenEndpoint { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Max retries exceeded after {attempts} attempts: {source}")]
    MaxRetriesExceeded {
        attempts: u32,
        #[source]
        source: Box<AuthError>,
    },

    #[error("Operation cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },

    #[error("Callback server error: {0}")]
    CallbackServer(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Timed out waiting for cache lock {}", .0.display())]
    LockTimeout(PathBuf),

    #[error("Failed to open browser: {0}")]
    BrowserOpen(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<sonata_config::ConfigError> for AuthError {
    fn from(err: sonata_config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl AuthError {
    /// Whether this error was produced by a cancellation token rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AuthError::Cancelled { .. })
    }

    /// Whether the user has to go through an interactive authorization again.
    pub fn requires_authorization(&self) -> bool {
        matches!(
            self,
            AuthError::AuthorizationRequired
                | AuthError::NoRefreshToken
                | AuthError::RefreshNotSupported(_)
        )
    }

    /// Transient failures are the only ones the client-credentials fetch retries:
    /// 5xx from the token endpoint, or a transport error whose text names a
    /// connection reset, a timeout, or a DNS failure.
    pub fn is_transient(&self) -> bool {
        match self {
            AuthError::TokenEndpoint { status, .. } => *status >= 500,
            AuthError::Network(err) => is_transient_network_error(err),
            _ => false,
        }
    }
}

const TRANSIENT_MARKERS: &[&str] = &[
    "connection reset",
    "timed out",
    "timeout",
    "dns error",
    "failed to lookup address",
    "name resolution",
    "no such host",
];

/// Substring classifier over the full error chain of a transport error.
pub fn is_transient_network_error(err: &(dyn std::error::Error + 'static)) -> bool {
    let text = error_chain_text(err).to_lowercase();
    TRANSIENT_MARKERS.iter().any(|marker| text.contains(marker))
}

/// Join an error and all of its sources into one line.
pub fn error_chain_text(err: &(dyn std::error::Error + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("outer failure")]
    struct Outer {
        #[source]
        inner: std::io::Error,
    }

    #[test]
    fn test_error_chain_includes_sources() {
        let err = Outer {
            inner: std::io::Error::new(std::io::ErrorKind::Other, "connection reset by peer"),
        };
        let text = error_chain_text(&err);
        assert_eq!(text, "outer failure: connection reset by peer");
        assert!(is_transient_network_error(&err));
    }

    #[test]
    fn test_refused_connection_is_not_transient() {
        let err = std::io::Error::new(std::io::ErrorKind::Other, "connection refused");
        assert!(!is_transient_network_error(&err));
    }

    #[test]
    fn test_token_endpoint_5xx_is_transient() {
        let server_error = AuthError::TokenEndpoint {
            status: 503,
            body: String::new(),
        };
        let client_error = AuthError::TokenEndpoint {
            status: 400,
            body: String::new(),
        };
        assert!(server_error.is_transient());
        assert!(!client_error.is_transient());
    }

    #[test]
    fn test_protocol_errors_are_never_transient() {
        let err = AuthError::StateMismatch {
            expected: "a".to_string(),
            received: "b".to_string(),
        };
        assert!(!err.is_transient());
        assert!(err.to_string().contains("expected a"));
        assert!(err.to_string().contains("received b"));
    }

    #[test]
    fn test_oauth_error_display_with_description() {
        let err = AuthError::OAuth {
            error: "invalid_grant".to_string(),
            description: Some("Invalid authorization code".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "OAuth error: invalid_grant (Invalid authorization code)"
        );
    }

    #[test]
    fn test_requires_authorization() {
        assert!(AuthError::AuthorizationRequired.requires_authorization());
        assert!(AuthError::RefreshNotSupported("implicit grant").requires_authorization());
        assert!(!AuthError::Cancelled { attempts: 1 }.requires_authorization());
    }
}
