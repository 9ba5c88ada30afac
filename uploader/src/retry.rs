use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::error::UploadError;

/// Outcome of a single remote call, as seen by the retry loop.
#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    /// Retryable error (timeouts, connection resets, 5xx and proxy 524 responses)
    #[error(transparent)]
    Retryable(anyhow::Error),
    /// Non-retryable error (4xx rejections, insufficient storage, local I/O)
    #[error(transparent)]
    NonRetryable(anyhow::Error),
}

impl RetryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RetryError::Retryable(_))
    }

    pub fn into_inner(self) -> anyhow::Error {
        match self {
            RetryError::Retryable(err) | RetryError::NonRetryable(err) => err,
        }
    }
}

/// Why a retried call gave up.
#[derive(Debug)]
pub enum RetryFailure {
    /// Every attempt failed with a retryable error.
    Exhausted { attempts: u32, last: anyhow::Error },
    /// An attempt failed with a non-retryable error.
    Permanent { attempts: u32, error: anyhow::Error },
    /// Cancelled while waiting for the next attempt.
    Cancelled,
}

impl RetryFailure {
    /// Error for a part upload that gave up.
    pub fn into_part_error(self, part: u32) -> UploadError {
        match self {
            RetryFailure::Exhausted { attempts, last } => UploadError::ExhaustedRetries {
                part,
                attempts,
                source: last,
            },
            RetryFailure::Permanent { attempts, error } => UploadError::Remote {
                operation: "upload_part",
                part: Some(part),
                attempts,
                source: error,
            },
            RetryFailure::Cancelled => UploadError::Cancelled,
        }
    }

    /// Error for a session-level call (initiate, head) that gave up.
    pub fn into_remote_error(self, operation: &'static str) -> UploadError {
        match self {
            RetryFailure::Exhausted {
                attempts,
                last: source,
            }
            | RetryFailure::Permanent {
                attempts,
                error: source,
            } => UploadError::Remote {
                operation,
                part: None,
                attempts,
                source,
            },
            RetryFailure::Cancelled => UploadError::Cancelled,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts per call, including the first one.
    pub max_attempts: u32,
    /// Base delay for exponential backoff.
    pub base_delay_ms: u64,
    /// Upper bound for a single backoff delay.
    pub max_delay_ms: u64,
    /// Maximum jitter to add to backoff delay (as fraction of delay, e.g., 0.25 = ±25%).
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 5,
            base_delay_ms: 2000,
            max_delay_ms: 60_000,
            jitter_factor: 0.25,
        }
    }
}

/// Run `func` until it succeeds, fails permanently, runs out of attempts or
/// `cancel` fires. `func` receives the 1-based attempt number.
///
/// On success returns the value and the attempt that produced it.
pub async fn with_retry<F, Fut, T>(
    label: &str,
    mut func: F,
    config: &RetryConfig,
    cancel: &CancellationToken,
) -> Result<(T, u32), RetryFailure>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, RetryError>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match func(attempt).await {
            Ok(result) => return Ok((result, attempt)),
            Err(RetryError::NonRetryable(error)) => {
                log::error!("{}: attempt {} failed permanently: {:#}", label, attempt, error);
                return Err(RetryFailure::Permanent {
                    attempts: attempt,
                    error,
                });
            }
            Err(RetryError::Retryable(err)) => {
                log::warn!(
                    "{}: attempt {}/{} failed: {:#}",
                    label,
                    attempt,
                    max_attempts,
                    err
                );
                if attempt >= max_attempts {
                    log::error!("{}: exceeded max retries ({})", label, max_attempts);
                    return Err(RetryFailure::Exhausted {
                        attempts: attempt,
                        last: err,
                    });
                }
                let delay = backoff_with_jitter(attempt - 1, config);
                log::info!("{}: retrying in {:?}", label, delay);
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        return Err(RetryFailure::Cancelled);
                    }
                }
                attempt += 1;
            }
        }
    }
}

/// Calculate backoff delay with jitter for a given attempt.
///
/// Uses exponential backoff: base_delay * 2^attempt, capped at max_delay.
/// Adds random jitter of ±jitter_factor to prevent thundering herd.
pub fn backoff_with_jitter(attempt: u32, config: &RetryConfig) -> Duration {
    let base_delay = config
        .base_delay_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_delay_ms);
    let jitter_range = (base_delay as f64 * config.jitter_factor) as u64;
    let jitter = rand::rng().random_range(0..=jitter_range * 2) as i64 - jitter_range as i64;
    let delay_ms = (base_delay as i64 + jitter).max(0) as u64;
    Duration::from_millis(delay_ms)
}
