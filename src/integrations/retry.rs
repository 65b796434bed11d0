//! Retry policy for provider HTTP calls.

use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{RequestBuilder, Response};
use tracing::warn;

/// Attempts and base delay for provider requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
        }
    }

    /// Doubling backoff, never shorter than the server's `Retry-After`.
    pub fn delay(&self, attempt: usize, retry_after: Option<Duration>) -> Duration {
        let shift = attempt.saturating_sub(1).min(6) as u32;
        let backoff = self.base_delay.saturating_mul(1u32 << shift);
        match retry_after {
            Some(wait) => backoff.max(wait),
            None => backoff,
        }
    }
}

pub fn should_retry_status(status: u16) -> bool {
    status == 408 || status == 429 || status >= 500
}

fn is_retryable_transport(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Whole seconds only; HTTP-date values are ignored.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get("retry-after")?.to_str().ok()?.trim();
    raw.parse::<u64>().ok().map(Duration::from_secs)
}

/// Send, retrying rate limits, server errors and connect failures.
///
/// Non-retryable statuses come back as `Ok` so the caller can read the body.
pub async fn send_with_retry<F>(
    policy: &RetryPolicy,
    operation: &str,
    build: F,
) -> std::result::Result<Response, reqwest::Error>
where
    F: Fn() -> RequestBuilder,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let retries_left = attempt < policy.max_attempts;
        match build().send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                if retries_left && should_retry_status(status) {
                    let delay = policy.delay(attempt, parse_retry_after(response.headers()));
                    warn!(operation, status, attempt, ?delay, "Provider request failed, retrying");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Ok(response);
            }
            Err(err) if retries_left && is_retryable_transport(&err) => {
                let delay = policy.delay(attempt, None);
                warn!(operation, attempt, ?delay, "Provider unreachable, retrying: {err}");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn retryable_statuses() {
        assert!(should_retry_status(429));
        assert!(should_retry_status(503));
        assert!(!should_retry_status(400));
        assert!(!should_retry_status(401));
    }

    #[test]
    fn delay_doubles_and_respects_retry_after() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
        };
        assert_eq!(policy.delay(1, None), Duration::from_millis(100));
        assert_eq!(policy.delay(3, None), Duration::from_millis(400));
        assert_eq!(
            policy.delay(1, Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn retry_after_seconds_parsed() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("7"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));
        headers.insert("retry-after", HeaderValue::from_static("soon"));
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[tokio::test]
    async fn server_errors_are_retried_until_exhausted() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(GET).path("/flaky");
            then.status(503);
        });
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::ZERO,
        };
        let http = reqwest::Client::new();
        let url = server.url("/flaky");
        let response = send_with_retry(&policy, "test", || http.get(&url))
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 503);
        mock.assert_calls(3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(GET).path("/bad");
            then.status(400);
        });
        let http = reqwest::Client::new();
        let url = server.url("/bad");
        send_with_retry(&RetryPolicy::default(), "test", || http.get(&url))
            .await
            .unwrap();
        mock.assert_calls(1);
    }
}
