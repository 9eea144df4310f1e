//! ---
//! crorch_section: "04-configuration-orchestration"
//! crorch_subsection: "module"
//! crorch_type: "source"
//! crorch_scope: "code"
//! crorch_description: "Lifecycle orchestration: request parsing, dispatch and callback reporting."
//! crorch_version: "v0.1.0"
//! crorch_owner: "platform"
//! ---
//! Lifecycle orchestration.
//!
//! [`Dispatcher`] is the single entry point: it parses an inbound event, runs
//! the matching resource handler under the invocation budget and hands the
//! one terminal result to the [`ResponseReporter`].

pub mod dispatcher;
pub mod metrics;
pub mod reporter;
pub mod request;
pub mod result;

pub use dispatcher::Dispatcher;
pub use metrics::{new_registry, OrchestratorMetrics, SharedRegistry};
pub use reporter::{
    CallbackTransport, DeliveryError, DeliveryOutcome, HttpTransport, RecordingTransport,
    ResponseReporter, STDOUT_TARGET,
};
pub use request::{redact_event, LifecycleRequest, MalformedEvent, RequestError, RequestType};
pub use result::{failed_physical_id, CallbackPayload, LifecycleResult, LifecycleStatus};
