//! Timeout and retry combinators applied to every remote model call.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use crate::llm::gateway::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub initial_delay: Duration,
}

impl CallPolicy {
    pub fn new(timeout: Duration, max_retries: u32, initial_delay: Duration) -> Self {
        CallPolicy {
            timeout,
            max_retries,
            initial_delay,
        }
    }
}

/// Races `call` against a deadline. When the deadline wins the call future
/// is dropped; whatever it would have produced is discarded.
pub async fn with_timeout<T, Fut>(
    operation: &str,
    after: Duration,
    call: Fut,
) -> Result<T, GatewayError>
where
    Fut: Future<Output = Result<T, GatewayError>>,
{
    match tokio::time::timeout(after, call).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout {
            operation: operation.to_string(),
            after,
        }),
    }
}

/// Retries retryable failures up to `max_retries` times, sleeping
/// `initial_delay` before the first retry and doubling it each time after.
pub async fn with_retry<T, F, Fut>(
    operation: &str,
    max_retries: u32,
    initial_delay: Duration,
    mut call: F,
) -> Result<T, GatewayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let mut delay = initial_delay;
    let mut retries_left = max_retries;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if retries_left == 0 || !err.is_retryable() => return Err(err),
            Err(err) => {
                warn!(
                    operation = operation,
                    retries_left = retries_left,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying {} ({} attempt(s) left): {}",
                    operation,
                    retries_left,
                    normalize_error_message(&err)
                );
                tokio::time::sleep(delay).await;
                retries_left -= 1;
                delay = delay.saturating_mul(2);
            }
        }
    }
}

/// Each attempt gets its own deadline; timeouts count as retryable failures.
pub async fn call_with_policy<T, F, Fut>(
    operation: &str,
    policy: CallPolicy,
    mut call: F,
) -> Result<T, GatewayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    with_retry(operation, policy.max_retries, policy.initial_delay, || {
        with_timeout(operation, policy.timeout, call())
    })
    .await
}

/// One-line text for any error, with JSON error bodies unwrapped.
pub fn normalize_error_message<E: Display + ?Sized>(err: &E) -> String {
    normalize_error_text(&err.to_string())
}

pub fn normalize_error_text(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            return normalize_json_error(&value);
        }
    }
    if trimmed.is_empty() {
        "Unknown error".to_string()
    } else {
        trimmed.to_string()
    }
}

/// `{"error": {"message"}}`, then `{"message"}`, then a bare string, then the
/// compact JSON itself.
pub fn normalize_json_error(value: &Value) -> String {
    value
        .pointer("/error/message")
        .and_then(Value::as_str)
        .or_else(|| value.get("message").and_then(Value::as_str))
        .or_else(|| value.get("error").and_then(Value::as_str))
        .or_else(|| value.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| value.to_string())
}
