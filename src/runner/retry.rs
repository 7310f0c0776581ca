//! Bounded retry with a fixed delay between attempts.

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

/// How many times to call, and how long to wait between calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    /// `max_attempts` counts every call including the first; it is raised
    /// to 1 so the operation always runs at least once.
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

/// A successful value and the attempt that produced it (1-based).
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

/// Every attempt failed.
#[derive(Debug, Clone, PartialEq)]
pub struct RunFailure<E> {
    pub last_error: E,
    pub attempts: u32,
}

/// Call `op` until it succeeds or the policy is exhausted.
///
/// `op` receives the 1-based attempt number.
pub async fn run_with_retry<T, E, F, Fut>(
    policy: RetryPolicy,
    mut op: F,
) -> Result<Attempted<T>, RunFailure<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        info!(attempt, max_attempts = policy.max_attempts, "collection attempt");
        match op(attempt).await {
            Ok(value) => {
                return Ok(Attempted {
                    value,
                    attempts: attempt,
                })
            }
            Err(e) => {
                if attempt >= policy.max_attempts {
                    warn!(attempts = attempt, error = %e, "all collection attempts failed");
                    return Err(RunFailure {
                        last_error: e,
                        attempts: attempt,
                    });
                }
                warn!(
                    attempt,
                    error = %e,
                    retry_in_secs = policy.delay.as_secs(),
                    "attempt failed, retrying"
                );
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
        }
    }
}
