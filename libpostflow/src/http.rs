//! Shared HTTP layer for every platform client
//!
//! [`ResilientClient`] wraps one logical API call:
//!
//! - timeouts and connection failures are retried with the policy's backoff
//! - HTTP 429 sleeps for the platform's rate-limit reset header (or a default)
//!   and tries again; the wait uses up one attempt
//! - statuses accepted by the retry predicate (5xx by default) are retried
//!   with backoff, then surface as [`PlatformError::Server`]
//! - any other 4xx fails at once with the platform's parsed error message
//! - a success status other than the expected one is an error
//!
//! Platform clients differ only in URL layout, auth shape, error body format
//! and which header carries the rate-limit reset.

use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{parse_duration, HttpConfig};
use crate::error::{PlatformError, Result};

/// Decides whether a response status is worth another attempt
pub type StatusPredicate = fn(u16) -> bool;

pub fn is_server_error(status: u16) -> bool {
    (500..600).contains(&status)
}

/// Delay before the n-th retry (1-based)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `base * 2^(n-1)`, capped at `max`
    Exponential { base: Duration, max: Duration },
    /// `step * n`
    Linear { step: Duration },
    Fixed(Duration),
}

impl Backoff {
    pub fn delay(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        match *self {
            Backoff::Exponential { base, max } => {
                let factor = 2u32.saturating_pow(retry - 1);
                base.saturating_mul(factor).min(max)
            }
            Backoff::Linear { step } => step.saturating_mul(retry),
            Backoff::Fixed(delay) => delay,
        }
    }
}

/// How to wait out an HTTP 429
#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    /// Header carrying seconds-until-reset or an RFC 3339 reset time
    pub header: String,
    pub default_wait: Duration,
    /// Length of one "second" in the header; shortened in tests
    pub unit: Duration,
    pub max_wait: Duration,
}

impl RateLimitPolicy {
    pub fn new(header: &str) -> Self {
        Self {
            header: header.to_string(),
            default_wait: Duration::from_secs(60),
            unit: Duration::from_secs(1),
            max_wait: Duration::from_secs(15 * 60),
        }
    }

    /// Wait derived from the response headers, capped at `max_wait`
    pub fn wait_for(&self, headers: &HeaderMap) -> Duration {
        let value = headers
            .get(self.header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::trim);

        let wait = match value {
            Some(v) => match v.parse::<u64>() {
                Ok(units) => self.unit.saturating_mul(units.min(u32::MAX as u64) as u32),
                Err(_) => match chrono::DateTime::parse_from_rfc3339(v) {
                    Ok(reset_at) => {
                        let remaining = reset_at.timestamp_millis()
                            - chrono::Utc::now().timestamp_millis();
                        Duration::from_millis(remaining.max(0) as u64)
                    }
                    Err(_) => self.default_wait,
                },
            },
            None => self.default_wait,
        };

        wait.min(self.max_wait)
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub retryable_status: StatusPredicate,
    pub retry_network_errors: bool,
    pub rate_limit: RateLimitPolicy,
}

impl RetryPolicy {
    pub fn new(rate_limit_header: &str) -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential {
                base: Duration::from_secs(1),
                max: Duration::from_secs(30),
            },
            retryable_status: is_server_error,
            retry_network_errors: true,
            rate_limit: RateLimitPolicy::new(rate_limit_header),
        }
    }

    pub fn from_config(config: &HttpConfig, rate_limit_header: &str) -> Result<Self> {
        Ok(Self {
            max_attempts: config.max_attempts.max(1),
            backoff: Backoff::Exponential {
                base: parse_duration("http.backoff_base", &config.backoff_base)?,
                max: parse_duration("http.max_backoff", &config.max_backoff)?,
            },
            retryable_status: is_server_error,
            retry_network_errors: true,
            rate_limit: RateLimitPolicy {
                header: rate_limit_header.to_string(),
                default_wait: parse_duration(
                    "http.rate_limit_default_wait",
                    &config.rate_limit_default_wait,
                )?,
                unit: Duration::from_secs(1),
                max_wait: parse_duration("http.max_rate_limit_wait", &config.max_rate_limit_wait)?,
            },
        })
    }

    /// Same policy with exactly one attempt; callers own the retry loop
    pub fn single_attempt(mut self) -> Self {
        self.max_attempts = 1;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_rate_limit_unit(mut self, unit: Duration) -> Self {
        self.rate_limit.unit = unit;
        self
    }

    pub fn with_rate_limit_default(mut self, wait: Duration) -> Self {
        self.rate_limit.default_wait = wait;
        self
    }
}

/// Shape of a platform's error response body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorFormat {
    /// `{"error": {"message", "type", "code"}}`
    Graph,
    /// `{"error": "..."}`
    Mastodon,
}

impl ErrorFormat {
    /// Extract `(code, message)` from an error body
    pub fn parse(&self, body: &str) -> (Option<String>, String) {
        let fallback = || (None, truncate(body, 200));

        let Ok(json) = serde_json::from_str::<serde_json::Value>(body) else {
            return fallback();
        };

        match self {
            ErrorFormat::Graph => {
                let Some(error) = json.get("error") else {
                    return fallback();
                };
                let code = error.get("code").and_then(|c| match c {
                    serde_json::Value::Number(n) => Some(n.to_string()),
                    serde_json::Value::String(s) => Some(s.clone()),
                    _ => None,
                });
                let kind = error
                    .get("type")
                    .and_then(|t| t.as_str())
                    .unwrap_or("UnknownError");
                let message = error
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("Unknown error");
                let label = format!(
                    "{} ({}): {}",
                    kind,
                    code.as_deref().unwrap_or("unknown"),
                    message
                );
                (code, label)
            }
            ErrorFormat::Mastodon => match json.get("error").and_then(|e| e.as_str()) {
                Some(message) => (None, message.to_string()),
                None => fallback(),
            },
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// HTTP client with the retry and rate-limit behaviour described above
#[derive(Clone)]
pub struct ResilientClient {
    http: reqwest::Client,
    policy: RetryPolicy,
    errors: ErrorFormat,
}

impl ResilientClient {
    pub fn new(
        policy: RetryPolicy,
        errors: ErrorFormat,
        timeout: Duration,
        user_agent: &str,
    ) -> std::result::Result<Self, PlatformError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| PlatformError::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self::with_client(http, policy, errors))
    }

    pub fn with_client(http: reqwest::Client, policy: RetryPolicy, errors: ErrorFormat) -> Self {
        Self {
            http,
            policy,
            errors,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Same transport, different policy
    pub fn with_policy(&self, policy: RetryPolicy) -> Self {
        Self {
            http: self.http.clone(),
            policy,
            errors: self.errors,
        }
    }

    /// Send a request expecting `200 OK` with a JSON body
    pub async fn send_json<T, F>(&self, build: F) -> std::result::Result<T, PlatformError>
    where
        T: DeserializeOwned,
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        self.send_json_expecting(&[200], build).await
    }

    /// Send a request, accepting any status in `expected` as success
    ///
    /// `build` is called once per attempt, so bodies that cannot be cloned
    /// (multipart forms) are rebuilt each time.
    pub async fn send_json_expecting<T, F>(
        &self,
        expected: &[u16],
        build: F,
    ) -> std::result::Result<T, PlatformError>
    where
        T: DeserializeOwned,
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error: Option<PlatformError> = None;

        for attempt in 1..=max_attempts {
            let has_attempts_left = attempt < max_attempts;

            let response = match build(&self.http).send().await {
                Ok(response) => response,
                Err(e) => {
                    let retryable =
                        self.policy.retry_network_errors && (e.is_timeout() || e.is_connect());
                    let error = PlatformError::Network(e.to_string());
                    if retryable && has_attempts_left {
                        let delay = self.policy.backoff.delay(attempt);
                        warn!(
                            attempt,
                            max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Request failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        last_error = Some(error);
                        continue;
                    }
                    return Err(error);
                }
            };

            let status = response.status().as_u16();

            if status == 429 {
                let wait = self.policy.rate_limit.wait_for(response.headers());
                let error = PlatformError::RateLimit(format!(
                    "HTTP 429 from {}",
                    response.url().path()
                ));
                if has_attempts_left {
                    warn!(
                        attempt,
                        max_attempts,
                        wait_ms = wait.as_millis() as u64,
                        "Rate limited, waiting for reset"
                    );
                    tokio::time::sleep(wait).await;
                    last_error = Some(error);
                    continue;
                }
                return Err(error);
            }

            if expected.contains(&status) {
                let body = response
                    .text()
                    .await
                    .map_err(|e| PlatformError::Network(e.to_string()))?;
                return serde_json::from_str::<T>(&body).map_err(|e| {
                    PlatformError::InvalidResponse(format!("Invalid JSON response: {}", e))
                });
            }

            if (200..300).contains(&status) {
                return Err(PlatformError::UnexpectedStatus(status));
            }

            let body = response.text().await.unwrap_or_default();
            let (code, message) = self.errors.parse(&body);

            if (self.policy.retryable_status)(status) && has_attempts_left {
                let delay = self.policy.backoff.delay(attempt);
                warn!(
                    attempt,
                    max_attempts,
                    status,
                    delay_ms = delay.as_millis() as u64,
                    "Retryable status, retrying"
                );
                tokio::time::sleep(delay).await;
                last_error = Some(status_error(status, code, message));
                continue;
            }

            debug!(status, %message, "Request failed");
            return Err(status_error(status, code, message));
        }

        Err(last_error.unwrap_or_else(|| {
            PlatformError::Network(format!("Request failed after {} attempts", max_attempts))
        }))
    }
}

fn status_error(status: u16, code: Option<String>, message: String) -> PlatformError {
    match status {
        500..=599 => PlatformError::Server { status, message },
        401 => PlatformError::Authentication(message),
        400..=499 => PlatformError::Api {
            status,
            code,
            message,
        },
        _ => PlatformError::UnexpectedStatus(status),
    }
}
