//! Classification-aware retry with pluggable backoff.
//!
//! Failures are classified by message markers:
//!
//! | Class | Markers | Handling |
//! |-------|---------|----------|
//! | duplicate | `duplicate key`, `unique constraint` | idempotent skip, no retry |
//! | retryable | timeouts, connection resets, network errors, busy/locked database | wait, then retry |
//! | terminal | everything else | fail after one attempt |
//!
//! Two named backoff policies exist. [`Backoff::Linear`] waits
//! `base × n` after the n-th failed attempt and is used for per-record
//! writes. [`Backoff::Exponential`] waits `base × 2^(n-1)` and is used for
//! the post-run tag backfill.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

const DUPLICATE_MARKERS: &[&str] = &["duplicate key", "unique constraint"];

const RETRYABLE_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "connection reset",
    "econnreset",
    "econnrefused",
    "connection refused",
    "socket hang up",
    "broken pipe",
    "network",
    "fetch failed",
    "temporarily unavailable",
    "database is locked",
    "database is busy",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn linear(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff: Backoff::Linear,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff: Backoff::Exponential,
        }
    }

    /// Delay to wait after the `attempt`-th (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self.backoff {
            Backoff::Linear => self.base_delay.saturating_mul(attempt),
            Backoff::Exponential => {
                let factor = 2u32.saturating_pow((attempt - 1).min(16));
                self.base_delay.saturating_mul(factor)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Duplicate,
    Retryable,
    Terminal,
}

pub fn classify(message: &str) -> FailureClass {
    let lower = message.to_lowercase();
    if DUPLICATE_MARKERS.iter().any(|m| lower.contains(m)) {
        FailureClass::Duplicate
    } else if RETRYABLE_MARKERS.iter().any(|m| lower.contains(m)) {
        FailureClass::Retryable
    } else {
        FailureClass::Terminal
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome<T> {
    Completed(T),
    /// A duplicate-key failure: somebody already wrote this identifier.
    AlreadyExists,
}

#[derive(Error, Debug, Clone)]
#[error("{detail} (after {attempts} attempt(s))")]
pub struct RetryError {
    pub attempts: u32,
    pub detail: String,
}

/// Run `op` until it succeeds, fails terminally, or `policy.max_attempts`
/// attempts have been made.
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<RetryOutcome<T>, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let err = match op().await {
            Ok(value) => return Ok(RetryOutcome::Completed(value)),
            Err(err) => err,
        };

        let detail = err.to_string();
        match classify(&detail) {
            FailureClass::Duplicate => {
                debug!(label, attempt, "duplicate identifier, treating as already ingested");
                return Ok(RetryOutcome::AlreadyExists);
            }
            FailureClass::Terminal => {
                return Err(RetryError {
                    attempts: attempt,
                    detail,
                });
            }
            FailureClass::Retryable if attempt >= max_attempts => {
                return Err(RetryError {
                    attempts: attempt,
                    detail,
                });
            }
            FailureClass::Retryable => {
                let delay = policy.delay_after(attempt);
                warn!(
                    label,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %detail,
                    "retryable failure"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
