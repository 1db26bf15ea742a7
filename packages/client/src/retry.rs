// ABOUTME: Retry policy for API requests and the delay computation between attempts
// ABOUTME: Honors Retry-After on 429 (seconds or HTTP-date), otherwise linear backoff capped at 30s

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};

/// Upper bound for the computed backoff (not for an explicit Retry-After)
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

const TOO_MANY_REQUESTS: u16 = 429;

/// Two independent budgets: one for transport failures, one for retryable statuses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after network errors; also bounds the attempt loop
    pub max_retries: u32,
    /// Retries after a response whose status is in `retryable_statuses`
    pub status_retries: u32,
    pub retryable_statuses: BTreeSet<u16>,
    /// Seconds per attempt for the fallback backoff
    pub backoff_factor: f64,
    pub honor_retry_after: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            status_retries: 3,
            retryable_statuses: [429, 500, 502, 503, 504].into_iter().collect(),
            backoff_factor: 0.3,
            honor_retry_after: true,
        }
    }
}

impl RetryConfig {
    /// Never retry anything
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            status_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_status_retries(mut self, status_retries: u32) -> Self {
        self.status_retries = status_retries;
        self
    }

    pub fn with_retryable_statuses<I: IntoIterator<Item = u16>>(mut self, statuses: I) -> Self {
        self.retryable_statuses = statuses.into_iter().collect();
        self
    }

    pub fn with_backoff_factor(mut self, backoff_factor: f64) -> Self {
        self.backoff_factor = backoff_factor;
        self
    }

    pub fn with_honor_retry_after(mut self, honor: bool) -> Self {
        self.honor_retry_after = honor;
        self
    }

    pub fn is_retryable(&self, status: u16) -> bool {
        self.retryable_statuses.contains(&status)
    }

    /// `(attempt + 1) * backoff_factor` seconds, capped at [`MAX_BACKOFF`]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let secs = f64::from(attempt.saturating_add(1)) * self.backoff_factor;
        if !secs.is_finite() || secs <= 0.0 {
            return Duration::ZERO;
        }
        let millis = (secs * 1000.0).round().min(MAX_BACKOFF.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}

/// Delay before the next attempt.
///
/// `status` is `None` after a network error. A 429 with a usable
/// `Retry-After` waits exactly that long when `honor_retry_after` is set.
pub fn compute_delay(
    status: Option<u16>,
    headers: Option<&HeaderMap>,
    attempt: u32,
    config: &RetryConfig,
    now: DateTime<Utc>,
) -> Duration {
    if status == Some(TOO_MANY_REQUESTS) && config.honor_retry_after {
        let retry_after = headers
            .and_then(|h| h.get(RETRY_AFTER))
            .and_then(|value| value.to_str().ok())
            .and_then(|value| parse_retry_after(value, now));
        if let Some(delay) = retry_after {
            return delay;
        }
    }
    config.backoff(attempt)
}

/// Parse `Retry-After` as integer seconds, then as an HTTP-date.
///
/// A date that has already passed yields `None`.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let date = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    (date - now).to_std().ok().filter(|delay| !delay.is_zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use rstest::rstest;

    fn headers(retry_after: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_str(retry_after).unwrap());
        headers
    }

    #[test]
    fn test_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.status_retries, 3);
        assert!(config.is_retryable(429));
        assert!(config.is_retryable(503));
        assert!(!config.is_retryable(501));
        assert!(!config.is_retryable(404));
        assert!(config.honor_retry_after);
    }

    #[test]
    fn test_retry_after_seconds_is_exact() {
        let delay = compute_delay(
            Some(429),
            Some(&headers("2")),
            0,
            &RetryConfig::default(),
            Utc::now(),
        );
        assert_eq!(delay, Duration::from_secs(2));
    }

    #[test]
    fn test_retry_after_http_date() {
        let now = DateTime::parse_from_rfc2822("Wed, 21 Oct 2015 07:28:00 GMT")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:05 GMT", now),
            Some(Duration::from_secs(5))
        );
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:27:00 GMT", now), None);
    }

    #[test]
    fn test_past_retry_after_falls_back_to_backoff() {
        let now = Utc::now();
        let past = (now - chrono::Duration::seconds(30)).to_rfc2822();
        let delay = compute_delay(Some(429), Some(&headers(&past)), 1, &RetryConfig::default(), now);
        assert_eq!(delay, Duration::from_millis(600));
    }

    #[test]
    fn test_retry_after_ignored_when_disabled_or_not_429() {
        let config = RetryConfig::default().with_honor_retry_after(false);
        assert_eq!(
            compute_delay(Some(429), Some(&headers("20")), 0, &config, Utc::now()),
            Duration::from_millis(300)
        );
        assert_eq!(
            compute_delay(Some(503), Some(&headers("20")), 0, &RetryConfig::default(), Utc::now()),
            Duration::from_millis(300)
        );
    }

    #[test]
    fn test_garbage_retry_after_falls_back() {
        let delay = compute_delay(
            Some(429),
            Some(&headers("soon")),
            2,
            &RetryConfig::default(),
            Utc::now(),
        );
        assert_eq!(delay, Duration::from_millis(900));
    }

    #[rstest]
    #[case(0, Duration::from_millis(300))]
    #[case(1, Duration::from_millis(600))]
    #[case(9, Duration::from_secs(3))]
    #[case(1000, MAX_BACKOFF)]
    #[case(u32::MAX, MAX_BACKOFF)]
    fn test_backoff(#[case] attempt: u32, #[case] expected: Duration) {
        assert_eq!(RetryConfig::default().backoff(attempt), expected);
    }

    #[test]
    fn test_degenerate_backoff_factor() {
        assert_eq!(RetryConfig::default().with_backoff_factor(0.0).backoff(3), Duration::ZERO);
        assert_eq!(RetryConfig::default().with_backoff_factor(-1.0).backoff(3), Duration::ZERO);
        assert_eq!(
            RetryConfig::default().with_backoff_factor(f64::NAN).backoff(3),
            Duration::ZERO
        );
    }
}
