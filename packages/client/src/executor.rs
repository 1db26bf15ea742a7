// ABOUTME: Request executor wrapping every API call with a fresh token, retries, and backoff
// ABOUTME: Network errors and retryable statuses draw on separate budgets; every wait is cancellable

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::{header::HeaderMap, Client, Method, RequestBuilder};
use serde::{de::DeserializeOwned, Serialize};
use sonata_auth::AuthManager;
use sonata_config::constants::{DEFAULT_API_BASE_URL, DEFAULT_REQUEST_TIMEOUT_SECS};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::{
    error::{ClientError, ClientResult, HttpError},
    retry::{compute_delay, RetryConfig},
};

/// Executes API requests on behalf of one [`AuthManager`]
pub struct RequestExecutor {
    auth: Arc<dyn AuthManager>,
    http: Client,
    base_url: Url,
    retry: RetryConfig,
}

impl RequestExecutor {
    pub fn new(
        auth: Arc<dyn AuthManager>,
        http: Client,
        base_url: &str,
        retry: RetryConfig,
    ) -> ClientResult<Self> {
        // Without a trailing slash `join` would drop the last path segment
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        let base_url = Url::parse(&normalized)
            .map_err(|e| ClientError::InvalidUrl(format!("{}: {}", base_url, e)))?;

        Ok(Self {
            auth,
            http,
            base_url,
            retry,
        })
    }

    /// Default API base URL, request timeout, and retry policy
    pub fn for_api(auth: Arc<dyn AuthManager>) -> ClientResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS))
            .build()?;
        Self::new(auth, http, DEFAULT_API_BASE_URL, RetryConfig::default())
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Absolute URLs are used as-is; anything else is relative to the base URL
    pub fn resolve_url(&self, path: &str) -> ClientResult<Url> {
        let resolved = if path.starts_with("http://") || path.starts_with("https://") {
            Url::parse(path)
        } else {
            self.base_url.join(path.trim_start_matches('/'))
        };
        resolved.map_err(|e| ClientError::InvalidUrl(format!("{}: {}", path, e)))
    }

    /// Run one request to completion and return the raw response body.
    ///
    /// At most `max_retries + 1` attempts are made. Network errors are retried
    /// while `max_retries` allows; retryable statuses while `status_retries`
    /// allows. The access token is fetched again before every attempt.
    pub async fn execute<B>(
        &self,
        cancel: &CancellationToken,
        method: Method,
        path: &str,
        params: &[(&str, &str)],
        body: Option<&B>,
    ) -> ClientResult<Vec<u8>>
    where
        B: Serialize + ?Sized + Sync,
    {
        let url = self.resolve_url(path)?;
        let mut attempts: u32 = 0;
        let mut network_retries: u32 = 0;
        let mut status_retries: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(ClientError::Cancelled { attempts });
            }

            let token = self.auth.get_access_token(cancel).await.map_err(|e| {
                if e.is_cancelled() {
                    ClientError::Cancelled { attempts }
                } else {
                    ClientError::Auth(e)
                }
            })?;

            let mut request = self
                .http
                .request(method.clone(), url.clone())
                .bearer_auth(&token);
            if !params.is_empty() {
                request = request.query(params);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            attempts += 1;
            debug!(attempt = attempts, %method, %url, "sending API request");

            let outcome = tokio::select! {
                result = send(request) => result,
                _ = cancel.cancelled() => return Err(ClientError::Cancelled { attempts }),
            };
            let budget_left = attempts <= self.retry.max_retries;

            let delay = match outcome {
                Ok((status, _, bytes)) if status < 400 => {
                    debug!(attempt = attempts, status, "API request succeeded");
                    return Ok(bytes);
                }
                Ok((status, headers, bytes)) => {
                    let error = HttpError::from_response(
                        status,
                        method.as_str(),
                        url.as_str(),
                        headers,
                        &bytes,
                    );
                    let retryable = self.retry.is_retryable(status)
                        && status_retries < self.retry.status_retries
                        && budget_left;
                    if !retryable {
                        return Err(ClientError::Http(error));
                    }
                    status_retries += 1;

                    let delay = compute_delay(
                        Some(status),
                        Some(&error.headers),
                        attempts - 1,
                        &self.retry,
                        Utc::now(),
                    );
                    warn!(
                        attempt = attempts,
                        status,
                        delay_ms = delay.as_millis() as u64,
                        "retryable API status, backing off"
                    );
                    delay
                }
                Err(err) => {
                    if network_retries >= self.retry.max_retries || !budget_left {
                        return Err(if attempts == 1 {
                            ClientError::Network(err)
                        } else {
                            ClientError::MaxRetriesExceeded {
                                attempts,
                                source: Box::new(ClientError::Network(err)),
                            }
                        });
                    }
                    network_retries += 1;

                    let delay = compute_delay(None, None, attempts - 1, &self.retry, Utc::now());
                    warn!(
                        attempt = attempts,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "API request failed, retrying"
                    );
                    delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    debug!(attempts, "cancelled during backoff");
                    return Err(ClientError::Cancelled { attempts });
                }
            }
        }
    }

    /// Like [`execute`](Self::execute) but decodes JSON; an empty body (204) is `None`
    pub async fn execute_json<T, B>(
        &self,
        cancel: &CancellationToken,
        method: Method,
        path: &str,
        params: &[(&str, &str)],
        body: Option<&B>,
    ) -> ClientResult<Option<T>>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized + Sync,
    {
        let bytes = self.execute(cancel, method, path, params, body).await?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
        path: &str,
        params: &[(&str, &str)],
    ) -> ClientResult<Option<T>> {
        self.execute_json::<T, ()>(cancel, Method::GET, path, params, None)
            .await
    }

    pub async fn post<T, B>(
        &self,
        cancel: &CancellationToken,
        path: &str,
        body: Option<&B>,
    ) -> ClientResult<Option<T>>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized + Sync,
    {
        self.execute_json(cancel, Method::POST, path, &[], body).await
    }

    pub async fn put<T, B>(
        &self,
        cancel: &CancellationToken,
        path: &str,
        body: Option<&B>,
    ) -> ClientResult<Option<T>>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized + Sync,
    {
        self.execute_json(cancel, Method::PUT, path, &[], body).await
    }

    pub async fn delete<T, B>(
        &self,
        cancel: &CancellationToken,
        path: &str,
        body: Option<&B>,
    ) -> ClientResult<Option<T>>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized + Sync,
    {
        self.execute_json(cancel, Method::DELETE, path, &[], body)
            .await
    }
}

async fn send(request: RequestBuilder) -> Result<(u16, HeaderMap, Vec<u8>), reqwest::Error> {
    let response = request.send().await?;
    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let bytes = response.bytes().await?;
    Ok((status, headers, bytes.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sonata_auth::{AuthResult, TokenInfo};

    struct StaticToken;

    #[async_trait]
    impl AuthManager for StaticToken {
        async fn get_access_token(&self, _cancel: &CancellationToken) -> AuthResult<String> {
            Ok("token".to_string())
        }

        async fn get_cached_token(&self) -> AuthResult<Option<TokenInfo>> {
            Ok(None)
        }

        async fn refresh_token(&self, _cancel: &CancellationToken) -> AuthResult<TokenInfo> {
            Err(sonata_auth::AuthError::NoRefreshToken)
        }
    }

    fn executor(base_url: &str) -> RequestExecutor {
        RequestExecutor::new(
            Arc::new(StaticToken),
            Client::new(),
            base_url,
            RetryConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_resolve_relative_paths_against_base() {
        let executor = executor("https://api.example.com/v1");
        assert_eq!(
            executor.resolve_url("tracks/abc").unwrap().as_str(),
            "https://api.example.com/v1/tracks/abc"
        );
        assert_eq!(
            executor.resolve_url("/me/player").unwrap().as_str(),
            "https://api.example.com/v1/me/player"
        );
    }

    #[test]
    fn test_absolute_urls_are_used_as_is() {
        let executor = executor("https://api.example.com/v1/");
        assert_eq!(
            executor
                .resolve_url("https://api.example.com/v1/me/tracks?offset=20")
                .unwrap()
                .as_str(),
            "https://api.example.com/v1/me/tracks?offset=20"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        let result = RequestExecutor::new(
            Arc::new(StaticToken),
            Client::new(),
            "not a url",
            RetryConfig::default(),
        );
        assert!(matches!(result, Err(ClientError::InvalidUrl(_))));
    }
}
