//! ---
//! crorch_section: "07-resilience-fault-tolerance"
//! crorch_subsection: "module"
//! crorch_type: "source"
//! crorch_scope: "code"
//! crorch_description: "Polling for provider state convergence within a deadline."
//! crorch_version: "v0.1.0"
//! crorch_owner: "platform"
//! ---
//! Poll an async condition with exponential backoff until it holds or the
//! deadline runs out.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

use crate::deadline::Deadline;

/// Poll interval configuration.
#[derive(Debug, Clone, Copy)]
pub struct WaitConfig {
    /// Delay after the first negative check.
    pub initial_delay: Duration,
    /// Cap for the exponential growth of the delay.
    pub max_delay: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(15),
        }
    }
}

/// Why a wait ended without the condition holding.
#[derive(Debug, Error)]
pub enum WaitError<E> {
    /// The condition check itself failed.
    #[error("{0}")]
    Check(E),
    /// The deadline left no room for another poll.
    #[error("timed out waiting for {resource} after {polls} polls")]
    DeadlineReached {
        /// Resource being waited on.
        resource: String,
        /// Checks made.
        polls: u32,
    },
}

/// Wait until `check` reports `true`.
pub async fn wait_until<F, Fut, E>(
    config: WaitConfig,
    deadline: &Deadline,
    resource: &str,
    mut check: F,
) -> Result<(), WaitError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
{
    let mut delay = config.initial_delay;
    let mut polls = 0u32;
    loop {
        polls += 1;
        if check().await.map_err(WaitError::Check)? {
            debug!(resource, polls, "condition reached");
            return Ok(());
        }
        if !deadline.allows(delay) {
            return Err(WaitError::DeadlineReached {
                resource: resource.to_owned(),
                polls,
            });
        }
        debug!(
            resource,
            polls,
            delay_ms = delay.as_millis() as u64,
            "condition not reached; polling again"
        );
        sleep(delay).await;
        delay = delay.saturating_mul(2).min(config.max_delay);
    }
}
