//! Backoff for transient backend failures.

use crate::ProviderError;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use kestrel_config::RetryPolicyConfig;
use reqwest::header::HeaderMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::time::sleep;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub window_secs: u64,
    pub initial_delay_secs: u64,
    pub backoff_factor: u32,
    pub max_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            window_secs: 120,
            initial_delay_secs: 2,
            backoff_factor: 2,
            max_delay_secs: 20,
        }
    }
}

impl From<&RetryPolicyConfig> for RetryPolicy {
    fn from(config: &RetryPolicyConfig) -> Self {
        let defaults = Self::default();
        Self {
            window_secs: config.window_secs.unwrap_or(defaults.window_secs),
            initial_delay_secs: config
                .initial_delay_secs
                .unwrap_or(defaults.initial_delay_secs),
            backoff_factor: config.backoff_factor.unwrap_or(defaults.backoff_factor),
            max_delay_secs: config.max_delay_secs.unwrap_or(defaults.max_delay_secs),
        }
    }
}

pub(crate) fn truncate_for_error(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

/// POSTs `body` as JSON and returns the raw success body.
///
/// Transient statuses and connection failures are retried inside the policy
/// window. A request timeout is never retried.
pub(crate) async fn post_json_with_retry(
    client: &Client,
    provider: &str,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    timeout: Duration,
    policy: &RetryPolicy,
) -> Result<String> {
    let start = Instant::now();
    let mut attempt: u32 = 1;

    loop {
        let mut request = client
            .post(url)
            .header("Content-Type", "application/json")
            .timeout(timeout)
            .json(body);
        if let Some(token) = bearer {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                let headers = response.headers().clone();
                let raw_body = match response.text().await {
                    Ok(text) => text,
                    Err(err) if err.is_timeout() => {
                        return Err(ProviderError::Timeout {
                            provider: provider.to_string(),
                            secs: timeout.as_secs(),
                        }
                        .into())
                    }
                    Err(err) => return Err(anyhow!("{} response read failed: {}", provider, err)),
                };

                if status.is_success() {
                    return Ok(raw_body);
                }

                let error = ProviderError::Http {
                    provider: provider.to_string(),
                    status: status.as_u16(),
                    body: truncate_for_error(&raw_body, 600),
                };
                if !is_retryable_status(status.as_u16()) {
                    return Err(error.into());
                }

                if let Some(delay) = next_retry_delay(policy, attempt, &headers, start.elapsed()) {
                    tracing::warn!(
                        provider = %provider,
                        status = %status.as_u16(),
                        attempt = attempt,
                        delay_ms = delay.as_millis(),
                        "Retrying backend request after transient HTTP error"
                    );
                    sleep(delay).await;
                    attempt += 1;
                    continue;
                }

                return Err(error.into());
            }
            Err(err) => {
                if err.is_timeout() {
                    return Err(ProviderError::Timeout {
                        provider: provider.to_string(),
                        secs: timeout.as_secs(),
                    }
                    .into());
                }
                if !is_retryable_reqwest(&err) {
                    return Err(err.into());
                }

                if let Some(delay) =
                    next_retry_delay(policy, attempt, &HeaderMap::new(), start.elapsed())
                {
                    tracing::warn!(
                        provider = %provider,
                        attempt = attempt,
                        delay_ms = delay.as_millis(),
                        error = %err,
                        "Retrying backend request after transient network error"
                    );
                    sleep(delay).await;
                    attempt += 1;
                    continue;
                }

                return Err(err.into());
            }
        }
    }
}

pub(crate) fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_reqwest(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_request()
}

pub(crate) fn next_retry_delay(
    policy: &RetryPolicy,
    attempt: u32,
    headers: &HeaderMap,
    elapsed: Duration,
) -> Option<Duration> {
    let window = Duration::from_secs(policy.window_secs.max(1));
    if elapsed >= window {
        return None;
    }

    let mut delay =
        parse_retry_after_headers(headers).unwrap_or_else(|| exponential_delay(policy, attempt));

    let remaining = window.saturating_sub(elapsed);
    if delay > remaining {
        delay = remaining;
    }

    if delay.is_zero() {
        Some(Duration::from_millis(1))
    } else {
        Some(delay)
    }
}

pub(crate) fn exponential_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let initial = policy.initial_delay_secs.max(1);
    let factor = policy.backoff_factor.max(1) as u64;
    let max_delay = policy.max_delay_secs.max(1);

    let exponent = attempt.saturating_sub(1).min(20);
    let multiplier = factor.saturating_pow(exponent);
    Duration::from_secs(initial.saturating_mul(multiplier).min(max_delay))
}

pub(crate) fn parse_retry_after_headers(headers: &HeaderMap) -> Option<Duration> {
    if let Some(v) = headers.get("retry-after-ms").and_then(|h| h.to_str().ok()) {
        if let Ok(ms) = v.trim().parse::<u64>() {
            if ms > 0 {
                return Some(Duration::from_millis(ms));
            }
        }
    }

    let value = headers.get("retry-after").and_then(|h| h.to_str().ok())?;
    let trimmed = value.trim();
    if let Ok(secs) = trimmed.parse::<u64>() {
        if secs > 0 {
            return Some(Duration::from_secs(secs));
        }
    }

    let target = DateTime::parse_from_rfc2822(trimmed)
        .ok()?
        .with_timezone(&Utc);
    let millis = (target - Utc::now()).num_milliseconds();
    (millis > 0).then(|| Duration::from_millis(millis as u64))
}
