// ABOUTME: Error types for API request execution
// ABOUTME: Structured HTTP errors carry status, method, URL, provider message and reason, and headers

use std::fmt;

use reqwest::header::HeaderMap;
use serde::Deserialize;
use sonata_auth::AuthError;
use thiserror::Error;

use crate::retry::RetryConfig;

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("{0}")]
    Http(HttpError),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Max retries exceeded after {attempts} attempts: {source}")]
    MaxRetriesExceeded {
        attempts: u32,
        #[source]
        source: Box<ClientError>,
    },

    #[error("Request cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },

    #[error("Failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl From<HttpError> for ClientError {
    fn from(err: HttpError) -> Self {
        Self::Http(err)
    }
}

impl ClientError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            ClientError::Cancelled { .. } => true,
            ClientError::Auth(err) => err.is_cancelled(),
            _ => false,
        }
    }

    /// HTTP status of the failure, looking through a retry wrapper
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Http(err) => Some(err.status),
            ClientError::MaxRetriesExceeded { source, .. } => source.status(),
            _ => None,
        }
    }

    /// Whether the response status is one `config` would retry
    pub fn is_retryable_status(&self, config: &RetryConfig) -> bool {
        self.status().is_some_and(|status| config.is_retryable(status))
    }

    /// Credentials are missing, rejected, or need interactive authorization
    pub fn is_auth_error(&self) -> bool {
        match self {
            ClientError::Auth(err) => !err.is_cancelled(),
            ClientError::Http(err) => err.status == 401,
            _ => false,
        }
    }
}

/// A response with status >= 400
#[derive(Debug, Clone)]
pub struct HttpError {
    pub status: u16,
    pub method: String,
    pub url: String,
    pub message: String,
    pub reason: Option<String>,
    pub headers: HeaderMap,
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HTTP {} for {} {}: {}",
            self.status, self.method, self.url, self.message
        )?;
        if let Some(reason) = &self.reason {
            write!(f, " ({})", reason)?;
        }
        Ok(())
    }
}

impl std::error::Error for HttpError {}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    status: Option<u16>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

impl HttpError {
    /// Build from a failed response body.
    ///
    /// Understands `{"error": {"status", "message", "reason"}}`; anything else
    /// becomes the message verbatim. The transport status always wins.
    pub fn from_response(
        status: u16,
        method: impl Into<String>,
        url: impl Into<String>,
        headers: HeaderMap,
        body: &[u8],
    ) -> Self {
        let parsed = serde_json::from_slice::<ErrorEnvelope>(body)
            .ok()
            .map(|envelope| envelope.error);

        let (message, reason) = match parsed {
            Some(ErrorBody {
                message: Some(message),
                reason,
                ..
            }) => (message, reason),
            Some(ErrorBody { reason, status, .. }) => (
                status
                    .map(|s| format!("status {}", s))
                    .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned()),
                reason,
            ),
            None => (String::from_utf8_lossy(body).trim().to_string(), None),
        };

        Self {
            status,
            method: method.into(),
            url: url.into(),
            message,
            reason,
            headers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn error_from(body: &str) -> HttpError {
        HttpError::from_response(
            404,
            "GET",
            "https://api.example.com/v1/tracks/x",
            HeaderMap::new(),
            body.as_bytes(),
        )
    }

    #[test]
    fn test_parses_error_envelope() {
        let err = error_from(
            r#"{"error":{"status":404,"message":"Non existing id","reason":"NOT_FOUND"}}"#,
        );
        assert_eq!(err.status, 404);
        assert_eq!(err.message, "Non existing id");
        assert_eq!(err.reason.as_deref(), Some("NOT_FOUND"));
        assert_eq!(
            err.to_string(),
            "HTTP 404 for GET https://api.example.com/v1/tracks/x: Non existing id (NOT_FOUND)"
        );
    }

    #[test]
    fn test_falls_back_to_raw_body() {
        let err = error_from("<html>gateway exploded</html>");
        assert_eq!(err.message, "<html>gateway exploded</html>");
        assert_eq!(err.reason, None);
    }

    #[test]
    fn test_empty_body() {
        let err = error_from("");
        assert_eq!(err.message, "");
        assert_eq!(err.status, 404);
    }

    #[test]
    fn test_envelope_without_message() {
        let err = error_from(r#"{"error":{"status":404,"reason":"NOT_FOUND"}}"#);
        assert_eq!(err.message, "status 404");
        assert_eq!(err.reason.as_deref(), Some("NOT_FOUND"));
    }

    #[test]
    fn test_status_through_retry_wrapper() {
        let err = ClientError::MaxRetriesExceeded {
            attempts: 4,
            source: Box::new(ClientError::Http(error_from(""))),
        };
        assert_eq!(err.status(), Some(404));
        assert!(!err.is_retryable_status(&RetryConfig::default()));
        assert!(!err.is_cancelled());
    }

    #[test]
    fn test_auth_classification() {
        assert!(ClientError::Auth(AuthError::AuthorizationRequired).is_auth_error());
        assert!(!ClientError::Auth(AuthError::Cancelled { attempts: 0 }).is_auth_error());
        assert!(ClientError::Auth(AuthError::Cancelled { attempts: 0 }).is_cancelled());
    }
}
