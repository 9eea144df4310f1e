//! ---
//! crorch_section: "01-core-functionality"
//! crorch_subsection: "module"
//! crorch_type: "source"
//! crorch_scope: "code"
//! crorch_description: "Resource handler contract and the per-family handler set."
//! crorch_version: "v0.1.0"
//! crorch_owner: "platform"
//! ---
//! Resource handlers.
//!
//! Each resource family implements [`ResourceHandler`]. Operations describe
//! provider state first, adopt what already exists, and only then mutate, so a
//! re-invoked request converges instead of duplicating resources.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

pub mod context;
pub mod dns_record;
pub mod error;
pub mod firewall;
pub mod properties;
pub mod scaling_group;
pub mod state;

pub use context::HandlerContext;
pub use dns_record::DnsRecordHandler;
pub use error::HandlerError;
pub use firewall::FirewallHandler;
pub use properties::{
    DnsRecordProperties, FirewallProperties, ManagedRuleGroup, ResourceKind, ResourceProperties,
    ScalingGroupProperties, UnsupportedResourceType,
};
pub use scaling_group::ScalingGroupHandler;
pub use state::{Provenance, ResourceStateStore, SubResource, SubResourceKind};

/// Identity and output attributes of a provisioned resource.
#[derive(Debug, Clone, PartialEq)]
pub struct Provisioned {
    pub physical_id: String,
    pub data: Map<String, Value>,
}

impl Provisioned {
    pub fn new(physical_id: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            physical_id: physical_id.into(),
            data,
        }
    }

    /// Result of a delete: the id that was addressed, no attributes.
    pub fn deleted(physical_id: impl Into<String>) -> Self {
        Self::new(physical_id, Map::new())
    }
}

/// Lifecycle operations of one resource family.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    type Properties: Send + Sync;

    fn kind(&self) -> ResourceKind;

    async fn create(
        &self,
        ctx: &mut HandlerContext,
        props: &Self::Properties,
    ) -> Result<Provisioned, HandlerError>;

    async fn update(
        &self,
        ctx: &mut HandlerContext,
        physical_id: &str,
        props: &Self::Properties,
    ) -> Result<Provisioned, HandlerError>;

    /// Succeeds when the resource is already gone. `props` are the last known
    /// properties when the request carried a valid set.
    async fn delete(
        &self,
        ctx: &mut HandlerContext,
        physical_id: &str,
        props: Option<&Self::Properties>,
    ) -> Result<(), HandlerError>;

    /// Physical id a create with `props` settles on, known before any
    /// provider call.
    fn planned_physical_id(&self, _ctx: &HandlerContext, _props: &Self::Properties) -> Option<String> {
        None
    }
}

/// A validated request for one handler operation.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerCall {
    Create(ResourceProperties),
    Update {
        physical_id: String,
        properties: ResourceProperties,
    },
    Delete {
        kind: ResourceKind,
        physical_id: String,
        /// Properties of the resource being deleted, when they still parse.
        properties: Option<ResourceProperties>,
    },
}

impl HandlerCall {
    pub fn kind(&self) -> ResourceKind {
        match self {
            HandlerCall::Create(props) => props.kind(),
            HandlerCall::Update { properties, .. } => properties.kind(),
            HandlerCall::Delete { kind, .. } => *kind,
        }
    }

    /// Delete addressed by id alone.
    pub fn delete(kind: ResourceKind, physical_id: impl Into<String>) -> Self {
        HandlerCall::Delete {
            kind,
            physical_id: physical_id.into(),
            properties: None,
        }
    }
}

/// Shared handler for properties of type `P`.
pub type Handler<P> = Arc<dyn ResourceHandler<Properties = P>>;

/// The immutable set of handlers shared by concurrent requests.
#[derive(Clone)]
pub struct HandlerSet {
    scaling_group: Handler<ScalingGroupProperties>,
    firewall: Handler<FirewallProperties>,
    dns_record: Handler<DnsRecordProperties>,
}

impl Default for HandlerSet {
    fn default() -> Self {
        Self {
            scaling_group: Arc::new(ScalingGroupHandler::new()),
            firewall: Arc::new(FirewallHandler::new()),
            dns_record: Arc::new(DnsRecordHandler::new()),
        }
    }
}

impl fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerSet")
            .field("scaling_group", &self.scaling_group.kind())
            .field("firewall", &self.firewall.kind())
            .field("dns_record", &self.dns_record.kind())
            .finish()
    }
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scaling_group(mut self, handler: Handler<ScalingGroupProperties>) -> Self {
        self.scaling_group = handler;
        self
    }

    pub fn with_firewall(mut self, handler: Handler<FirewallProperties>) -> Self {
        self.firewall = handler;
        self
    }

    pub fn with_dns_record(mut self, handler: Handler<DnsRecordProperties>) -> Self {
        self.dns_record = handler;
        self
    }

    /// Route a call to the handler of its family.
    pub async fn run(
        &self,
        ctx: &mut HandlerContext,
        call: &HandlerCall,
    ) -> Result<Provisioned, HandlerError> {
        use ResourceProperties as P;

        match call {
            HandlerCall::Create(P::ScalingGroup(props)) => self.scaling_group.create(ctx, props).await,
            HandlerCall::Create(P::Firewall(props)) => self.firewall.create(ctx, props).await,
            HandlerCall::Create(P::DnsRecord(props)) => self.dns_record.create(ctx, props).await,
            HandlerCall::Update {
                physical_id,
                properties,
            } => match properties {
                P::ScalingGroup(props) => self.scaling_group.update(ctx, physical_id, props).await,
                P::Firewall(props) => self.firewall.update(ctx, physical_id, props).await,
                P::DnsRecord(props) => self.dns_record.update(ctx, physical_id, props).await,
            },
            HandlerCall::Delete {
                kind,
                physical_id,
                properties,
            } => {
                match (kind, properties) {
                    (ResourceKind::ScalingGroup, Some(P::ScalingGroup(props))) => {
                        self.scaling_group.delete(ctx, physical_id, Some(props)).await
                    }
                    (ResourceKind::ScalingGroup, _) => {
                        self.scaling_group.delete(ctx, physical_id, None).await
                    }
                    (ResourceKind::Firewall, Some(P::Firewall(props))) => {
                        self.firewall.delete(ctx, physical_id, Some(props)).await
                    }
                    (ResourceKind::Firewall, _) => self.firewall.delete(ctx, physical_id, None).await,
                    (ResourceKind::DnsRecord, Some(P::DnsRecord(props))) => {
                        self.dns_record.delete(ctx, physical_id, Some(props)).await
                    }
                    (ResourceKind::DnsRecord, _) => {
                        self.dns_record.delete(ctx, physical_id, None).await
                    }
                }?;
                Ok(Provisioned::deleted(physical_id.clone()))
            }
        }
    }

    /// Id a create call will report, for answering before the handler returns.
    pub fn planned_physical_id(&self, ctx: &HandlerContext, call: &HandlerCall) -> Option<String> {
        use ResourceProperties as P;

        match call {
            HandlerCall::Create(P::ScalingGroup(props)) => {
                self.scaling_group.planned_physical_id(ctx, props)
            }
            HandlerCall::Create(P::Firewall(props)) => self.firewall.planned_physical_id(ctx, props),
            HandlerCall::Create(P::DnsRecord(props)) => {
                self.dns_record.planned_physical_id(ctx, props)
            }
            _ => None,
        }
    }
}
