use std::fmt::Display;
use std::future::Future;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::backoff::calculate_backoff;
use crate::config::RetryConfig;

/// A single failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Error message from the failed attempt.
    pub error: String,
    /// When this attempt failed.
    pub timestamp: DateTime<Utc>,
}

impl RetryAttempt {
    pub fn new(attempt: u32, error: impl Into<String>) -> Self {
        Self {
            attempt,
            error: error.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Terminal outcome of one [`with_retry`] session.
///
/// Always returned, never raised: exhaustion is `success == false` with the
/// last error attached.
#[derive(Debug, Clone)]
pub struct RetryResult<T, E> {
    pub success: bool,
    pub result: Option<T>,
    /// The error from the final attempt. Earlier errors are only in `history`.
    pub error: Option<E>,
    /// Number of times the operation ran.
    pub attempts: u32,
    /// Wall-clock time from the first attempt to the returned outcome.
    pub total_time: Duration,
    /// Every failed attempt, oldest first.
    pub history: Vec<RetryAttempt>,
}

impl<T, E> RetryResult<T, E> {
    fn succeeded(value: T, attempts: u32, total_time: Duration, history: Vec<RetryAttempt>) -> Self {
        Self {
            success: true,
            result: Some(value),
            error: None,
            attempts,
            total_time,
            history,
        }
    }

    fn exhausted(error: E, attempts: u32, total_time: Duration, history: Vec<RetryAttempt>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error),
            attempts,
            total_time,
            history,
        }
    }
}

/// Run `operation` up to `config.max_retries + 1` times.
///
/// Returns on the first success. Between failed attempts the calling task
/// sleeps for `calculate_backoff(attempts_so_far - 1, config)`; other tasks
/// keep running. Every error is retried: [`is_retryable_error`] is advisory
/// and is not consulted here.
pub async fn with_retry<T, E, F, Fut>(mut operation: F, config: &RetryConfig) -> RetryResult<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let started = Instant::now();
    let max_attempts = config.max_attempts();
    let mut history = Vec::new();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        let error = match operation().await {
            Ok(value) => {
                trace!(attempt, "Operation succeeded");
                return RetryResult::succeeded(value, attempt, started.elapsed(), history);
            }
            Err(e) => e,
        };

        history.push(RetryAttempt::new(attempt, error.to_string()));

        if attempt >= max_attempts {
            debug!(attempts = attempt, error = %error, "Retries exhausted");
            return RetryResult::exhausted(error, attempt, started.elapsed(), history);
        }

        let delay = calculate_backoff(attempt - 1, config);
        debug!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Attempt failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

const TRANSIENT_MARKERS: &[&str] = &[
    "econnreset",
    "econnrefused",
    "econnaborted",
    "etimedout",
    "enotfound",
    "eai_again",
    "epipe",
    "socket hang up",
    "connection reset",
    "connection refused",
    "connection aborted",
    "broken pipe",
    "network",
    "dns",
    "timeout",
    "timed out",
    "rate limit",
    "ratelimit",
    "too many requests",
    "throttl",
    "service unavailable",
    "bad gateway",
    "gateway timeout",
    "internal server error",
];

static STATUS_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:429|5\d\d)\b").expect("status pattern is valid"));

/// Heuristic: does this error look transient?
///
/// Inspects the rendered message for network, DNS, timeout, rate-limit and
/// 5xx-status patterns. Anything else (validation errors, 4xx other than
/// 429) is classified as non-retryable.
pub fn is_retryable_error<E: Display + ?Sized>(error: &E) -> bool {
    is_retryable_message(&error.to_string())
}

/// [`is_retryable_error`] for a bare message.
pub fn is_retryable_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|marker| lower.contains(marker)) || STATUS_CODE.is_match(&lower)
}
