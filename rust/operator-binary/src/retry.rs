//! Bounded retry of optimistic-concurrency writes
//!
//! Only conflicts are retried. Any other failure is returned straight away, so that the caller
//! can skip the object until the next run.

use std::{future::Future, time::Duration};

use rand::Rng as _;
use tracing::{error, warn};

/// Errors that can tell an optimistic-concurrency rejection apart from other failures.
pub trait ConflictError: std::error::Error {
    fn is_conflict(&self) -> bool;
}

#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    /// Matches the `DefaultRetry` backoff used by Kubernetes controllers.
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        }
    }
}

/// Runs `operation` until it succeeds, fails with a non-conflict error, or runs out of attempts.
///
/// `operation` must read a fresh snapshot of the object on every call.
pub async fn retry_on_conflict<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: ConflictError,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;
        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) if !err.is_conflict() => return Err(err),
            Err(err) if attempt >= config.max_attempts => {
                error!(
                    operation = operation_name,
                    attempt,
                    error = &err as &dyn std::error::Error,
                    "write still conflicting after max retries, giving up"
                );
                return Err(err);
            }
            Err(err) => {
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
                warn!(
                    operation = operation_name,
                    attempt,
                    error = &err as &dyn std::error::Error,
                    delay_ms = jittered_delay.as_millis(),
                    "write conflicted, retrying against a fresh copy"
                );
                tokio::time::sleep(jittered_delay).await;
                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}
