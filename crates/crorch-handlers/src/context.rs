//! ---
//! crorch_section: "01-core-functionality"
//! crorch_subsection: "module"
//! crorch_type: "source"
//! crorch_scope: "code"
//! crorch_description: "Per-invocation handler context."
//! crorch_version: "v0.1.0"
//! crorch_owner: "platform"
//! ---
use crorch_logging::LogContext;
use crorch_provider::ProviderClient;
use crorch_resilience::{Deadline, WaitConfig};

use crate::properties::ResourceKind;
use crate::state::ResourceStateStore;

/// Everything a handler needs for one lifecycle request.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    /// Client scoped to the request's deadline.
    pub client: ProviderClient,
    pub store: ResourceStateStore,
    pub request_id: String,
    pub logical_id: String,
    pub kind: ResourceKind,
    pub request_type: String,
    /// Opaque stack identifier passed through from the caller.
    pub stack_id: String,
    pub wait: WaitConfig,
}

impl HandlerContext {
    pub fn new(
        client: ProviderClient,
        kind: ResourceKind,
        request_type: impl Into<String>,
        request_id: impl Into<String>,
        logical_id: impl Into<String>,
        stack_id: impl Into<String>,
    ) -> Self {
        let logical_id = logical_id.into();
        Self {
            client,
            store: ResourceStateStore::new(logical_id.clone(), None),
            request_id: request_id.into(),
            logical_id,
            kind,
            request_type: request_type.into(),
            stack_id: stack_id.into(),
            wait: WaitConfig::default(),
        }
    }

    pub fn with_wait(mut self, wait: WaitConfig) -> Self {
        self.wait = wait;
        self
    }

    pub fn deadline(&self) -> &Deadline {
        self.client.deadline()
    }

    /// Stack name parsed from a `arn:…:stack/<name>/<uuid>` stack id.
    pub fn stack_name(&self) -> Option<&str> {
        stack_name(&self.stack_id)
    }

    /// `<stackName>-<logicalId>` in lower case, or the logical id alone.
    pub fn default_name(&self) -> String {
        match self.stack_name() {
            Some(stack) => format!("{stack}-{}", self.logical_id).to_ascii_lowercase(),
            None => self.logical_id.to_ascii_lowercase(),
        }
    }

    pub fn log_context(&self) -> LogContext<'_> {
        LogContext::new()
            .with_request(&self.request_id)
            .with_logical_id(&self.logical_id)
            .with_resource_type(self.kind.as_str())
            .with_request_type(&self.request_type)
    }
}

fn stack_name(stack_id: &str) -> Option<&str> {
    let resource = stack_id.rsplit(':').next()?;
    let mut parts = resource.split('/');
    match (parts.next(), parts.next()) {
        (Some("stack"), Some(name)) if !name.is_empty() => Some(name),
        _ => None,
    }
}
