//! ---
//! crorch_section: "07-resilience-fault-tolerance"
//! crorch_subsection: "module"
//! crorch_type: "source"
//! crorch_scope: "code"
//! crorch_description: "Retry, backoff and deadline primitives."
//! crorch_version: "v0.1.0"
//! crorch_owner: "platform"
//! ---
#![warn(missing_docs)]
//! Resilience primitives shared by the provider client, the handlers and the
//! response reporter.

pub mod deadline;
pub mod retry;
pub mod wait;

pub use deadline::Deadline;
pub use retry::{retry_with_backoff, RetryError, RetryPolicy};
pub use wait::{wait_until, WaitConfig, WaitError};
