//! ---
//! crorch_section: "07-resilience-fault-tolerance"
//! crorch_subsection: "module"
//! crorch_type: "source"
//! crorch_scope: "code"
//! crorch_description: "Bounded exponential backoff bounded by a deadline."
//! crorch_version: "v0.1.0"
//! crorch_owner: "platform"
//! ---
//! Bounded retry with exponential backoff and jitter.

use std::future::Future;
use std::time::Duration;

use crorch_common::config::{ReporterConfig, RetryConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::deadline::Deadline;

/// Policy parameters controlling retry attempts and scheduling.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of attempts, the first call included.
    pub max_attempts: usize,
    /// Delay applied before the second attempt.
    pub base_delay: Duration,
    /// Upper bound on the exponential component of the delay.
    pub max_delay: Duration,
    /// Maximum jitter added to each delay.
    pub jitter: Duration,
    /// Fixed RNG seed for deterministic jitter.
    pub seed: Option<u64>,
}

impl RetryPolicy {
    /// Construct a policy; at least one attempt is always made.
    pub fn new(max_attempts: usize, base_delay: Duration, max_delay: Duration, jitter: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
            jitter,
            seed: None,
        }
    }

    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO, Duration::ZERO)
    }

    /// Seed the jitter RNG.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Policy for provider calls from the `[provider.retry]` section.
    pub fn from_config(config: &RetryConfig, seed: Option<u64>) -> Self {
        let mut policy = Self::new(
            config.max_attempts,
            config.base_delay,
            config.max_delay,
            config.jitter,
        );
        policy.seed = seed;
        policy
    }

    /// Policy for callback delivery from the `[reporter]` section.
    pub fn for_reporter(config: &ReporterConfig) -> Self {
        Self::new(
            config.max_attempts,
            config.base_delay,
            config.base_delay.saturating_mul(8),
            Duration::ZERO,
        )
    }

    /// Delay before the attempt following `attempt` (1-indexed).
    pub fn backoff_delay(&self, attempt: usize, rng: &mut StdRng) -> Duration {
        let exponent = (attempt.saturating_sub(1) as u32).min(8);
        let base = self
            .base_delay
            .saturating_mul(2u32.pow(exponent))
            .min(self.max_delay);
        if self.jitter.is_zero() {
            base
        } else {
            let jitter_ms = rng.gen_range(0..=self.jitter.as_millis().max(1)) as u64;
            base + Duration::from_millis(jitter_ms)
        }
    }

    fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default(), None)
    }
}

/// Terminal failure of a retried operation.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The classifier marked the error as not worth retrying.
    #[error("{0}")]
    Permanent(E),
    /// Every permitted attempt failed.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        /// Attempts made.
        attempts: usize,
        /// Error from the final attempt.
        last: E,
    },
    /// The next backoff would have crossed the deadline.
    #[error("retry budget exhausted after {attempts} attempts: {last}")]
    OutOfBudget {
        /// Attempts made.
        attempts: usize,
        /// Error from the final attempt.
        last: E,
    },
}

impl<E> RetryError<E> {
    /// Error from the last attempt.
    pub fn into_last(self) -> E {
        match self {
            RetryError::Permanent(err) => err,
            RetryError::Exhausted { last, .. } | RetryError::OutOfBudget { last, .. } => last,
        }
    }

    /// Number of attempts made before giving up.
    pub fn attempts(&self) -> usize {
        match self {
            RetryError::Permanent(_) => 1,
            RetryError::Exhausted { attempts, .. } | RetryError::OutOfBudget { attempts, .. } => {
                *attempts
            }
        }
    }
}

/// Run `attempt_fn` until it succeeds, fails permanently, runs out of attempts,
/// or the next backoff would cross `deadline`.
///
/// `attempt_fn` receives the 1-indexed attempt number.
pub async fn retry_with_backoff<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    deadline: &Deadline,
    operation: &str,
    is_retryable: C,
    mut attempt_fn: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut rng = policy.rng();
    let mut attempt = 1usize;
    loop {
        match attempt_fn(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if !is_retryable(&err) => return Err(RetryError::Permanent(err)),
            Err(err) => {
                if attempt >= policy.max_attempts {
                    warn!(operation, attempt, error = %err, "retries exhausted");
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: err,
                    });
                }
                let delay = policy.backoff_delay(attempt, &mut rng);
                if !deadline.allows(delay) {
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        remaining_ms = deadline.remaining().as_millis() as u64,
                        error = %err,
                        "next retry would cross the deadline"
                    );
                    return Err(RetryError::OutOfBudget {
                        attempts: attempt,
                        last: err,
                    });
                }
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure; backing off"
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
