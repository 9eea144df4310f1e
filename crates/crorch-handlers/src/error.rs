//! ---
//! crorch_section: "01-core-functionality"
//! crorch_subsection: "module"
//! crorch_type: "source"
//! crorch_scope: "code"
//! crorch_description: "Typed handler failures."
//! crorch_version: "v0.1.0"
//! crorch_owner: "platform"
//! ---
use crorch_provider::{ProviderError, ProviderResult};
use crorch_resilience::WaitError;
use thiserror::Error;

/// Failure of a handler operation.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Properties or identifiers were rejected before any provider call.
    #[error("validation error: {0}")]
    Validation(String),

    /// A provider call failed; `step` names what the handler was doing.
    #[error("{step}: {source}")]
    Provider {
        step: String,
        #[source]
        source: ProviderError,
    },

    /// The provider holds a resource in a state the handler cannot act on.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A convergence wait ran out of budget.
    #[error("{0}")]
    Timeout(String),
}

impl HandlerError {
    pub fn validation(message: impl Into<String>) -> Self {
        HandlerError::Validation(message.into())
    }

    pub fn provider_error(&self) -> Option<&ProviderError> {
        match self {
            HandlerError::Provider { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<WaitError<HandlerError>> for HandlerError {
    fn from(err: WaitError<HandlerError>) -> Self {
        match err {
            WaitError::Check(inner) => inner,
            WaitError::DeadlineReached { .. } => HandlerError::Timeout(err.to_string()),
        }
    }
}

/// Attach a step description to provider results.
pub(crate) trait StepExt<T> {
    fn step(self, step: impl FnOnce() -> String) -> Result<T, HandlerError>;
}

impl<T> StepExt<T> for ProviderResult<T> {
    fn step(self, step: impl FnOnce() -> String) -> Result<T, HandlerError> {
        self.map_err(|source| HandlerError::Provider {
            step: step(),
            source,
        })
    }
}

/// Treat "already gone" as success.
pub(crate) fn tolerate_missing(result: ProviderResult<()>) -> ProviderResult<()> {
    match result {
        Err(err) if err.is_not_found() => Ok(()),
        other => other,
    }
}
