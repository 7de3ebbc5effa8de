// Keyfed — Retry Policy
//
// Bounded exponential backoff with jitter, applied around any async
// operation whose error type can say whether it is worth retrying.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Classifies an error as transient (retry) or terminal (give up now).
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// How a retried operation finally failed.
#[derive(Debug, PartialEq, Eq)]
pub enum RetryError<E> {
    /// A non-retryable error; returned on the attempt it occurred.
    Terminal(E),
    /// Every attempt failed with a retryable error; carries the last one.
    Exhausted { attempts: u32, last: E },
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero behaves like one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Add up to ±25% jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, where `attempt` is 1-based.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base = self.initial_backoff.as_millis() as f64
            * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.max_backoff.as_millis() as f64);

        let delay_ms = if self.jitter {
            let spread = capped * 0.25;
            let jitter = rand::thread_rng().gen_range(-spread..=spread);
            (capped + jitter).max(0.0)
        } else {
            capped
        };

        Duration::from_millis(delay_ms as u64)
    }

    /// Run `operation` until it succeeds, fails terminally, or the attempt
    /// ceiling is reached.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, RetryError<E>>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(operation = %label, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_retryable() => return Err(RetryError::Terminal(e)),
                Err(e) if attempt >= max_attempts => {
                    return Err(RetryError::Exhausted { attempts: attempt, last: e })
                }
                Err(e) => {
                    let wait = self.backoff(attempt);
                    tracing::warn!(
                        operation = %label,
                        attempt,
                        max_attempts,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying with backoff"
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
