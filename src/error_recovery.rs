//! Bounded exponential backoff for transient hardware failures.
//
// A read attempt is an async function returning `Result`; `retry_with_backoff`
// iterates it against a fixed, geometrically spaced schedule and returns
// `RetryError::Exhausted` once the schedule runs out. The total time spent
// waiting is therefore bounded by the policy, which is how callers bound a
// measurement: a read in progress is never interrupted.

use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::warn;

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// The maximum number of attempts, the first one included.
    pub max_attempts: u32,
    /// Wait after the first failure.
    pub min_backoff: Duration,
    /// Wait after the last scheduled failure.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            min_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Create a policy.
    pub fn new(max_attempts: u32, min_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts,
            min_backoff,
            max_backoff,
        }
    }

    /// One wait per attempt, geometrically spaced from `min_backoff` to
    /// `max_backoff` inclusive. Always holds at least one entry.
    pub fn backoff_schedule(&self) -> Vec<Duration> {
        let n = self.max_attempts.max(1);
        let min = self.min_backoff.as_secs_f64();
        let max = self.max_backoff.as_secs_f64();
        if n == 1 {
            return vec![self.min_backoff];
        }
        if min <= 0.0 || max <= 0.0 {
            // Geometric spacing is undefined through zero; fall back to linear.
            return (0..n)
                .map(|i| to_micros(min + (max - min) * f64::from(i) / f64::from(n - 1)))
                .collect();
        }
        let ratio = max / min;
        (0..n)
            .map(|i| {
                let exponent = f64::from(i) / f64::from(n - 1);
                to_micros(min * ratio.powf(exponent))
            })
            .collect()
    }

    /// Upper bound on the time spent sleeping between attempts.
    pub fn total_backoff(&self) -> Duration {
        let schedule = self.backoff_schedule();
        schedule[..schedule.len() - 1].iter().sum()
    }
}

// Rounded to whole microseconds.
fn to_micros(secs: f64) -> Duration {
    Duration::from_micros((secs.max(0.0) * 1e6).round() as u64)
}

/// Failure of a retried operation.
#[derive(Debug, Error)]
pub enum RetryError<E: fmt::Display> {
    /// Every scheduled attempt failed.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Error returned by the final attempt.
        last: E,
    },
}

/// Run `attempt` until it succeeds or the policy's schedule is exhausted.
///
/// `attempt` receives the 1-based attempt number. After the n-th failure the
/// n-th scheduled wait is slept, except after the final attempt.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    mut attempt: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let schedule = policy.backoff_schedule();
    let max_attempts = schedule.len() as u32;
    let mut waits = schedule.into_iter();
    let mut n = 0;
    loop {
        n += 1;
        let wait = waits.next().unwrap_or(policy.max_backoff);
        match attempt(n).await {
            Ok(value) => return Ok(value),
            Err(last) if n >= max_attempts => {
                return Err(RetryError::Exhausted { attempts: n, last });
            }
            Err(e) => {
                warn!(
                    attempt = n,
                    max_attempts,
                    backoff_ms = wait.as_millis() as u64,
                    error = %e,
                    "Attempt failed, backing off"
                );
                sleep(wait).await;
            }
        }
    }
}
