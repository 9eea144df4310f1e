//! ---
//! crorch_section: "07-resilience-fault-tolerance"
//! crorch_subsection: "module"
//! crorch_type: "source"
//! crorch_scope: "code"
//! crorch_description: "Wall-clock budget shared by one lifecycle invocation."
//! crorch_version: "v0.1.0"
//! crorch_owner: "platform"
//! ---
//! Wall-clock budget for a single invocation.

use std::time::Duration;

use tokio::time::Instant;

/// A budget that starts counting when constructed.
///
/// Built on `tokio::time::Instant` so paused test clocks drive it.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    /// Start a budget of `budget` from now.
    pub fn after(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    /// A budget that never expires in practice.
    pub fn unbounded() -> Self {
        Self::after(Duration::MAX)
    }

    /// Total budget granted at construction.
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Time spent since construction.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.elapsed())
    }

    /// Whether the budget is used up.
    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Whether sleeping for `wait` would still leave time on the budget.
    pub fn allows(&self, wait: Duration) -> bool {
        wait < self.remaining()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn remaining_shrinks_with_paused_clock() {
        let deadline = Deadline::after(Duration::from_secs(10));
        assert!(deadline.allows(Duration::from_secs(9)));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(deadline.remaining(), Duration::from_secs(6));
        assert!(!deadline.allows(Duration::from_secs(6)));

        tokio::time::advance(Duration::from_secs(7)).await;
        assert!(deadline.is_expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_never_expires() {
        let deadline = Deadline::unbounded();
        tokio::time::advance(Duration::from_secs(86_400)).await;
        assert!(!deadline.is_expired());
        assert!(deadline.allows(Duration::from_secs(3600)));
    }
}
