//! ---
//! crorch_section: "01-core-functionality"
//! crorch_subsection: "module"
//! crorch_type: "source"
//! crorch_scope: "code"
//! crorch_description: "Per-invocation record of created sub-resources and observed snapshots."
//! crorch_version: "v0.1.0"
//! crorch_owner: "platform"
//! ---
//! Resource state store.
//!
//! Lives for exactly one invocation. Handlers record every sub-resource they
//! touch so that rollback only removes what this invocation created, and the
//! dispatcher can log what was left behind on failure.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SubResourceKind {
    LaunchTemplate,
    ScalingGroup,
    ScalingPolicy,
    IpSet,
    WebAcl,
    Association,
    AliasRecord,
}

impl SubResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubResourceKind::LaunchTemplate => "launch_template",
            SubResourceKind::ScalingGroup => "scaling_group",
            SubResourceKind::ScalingPolicy => "scaling_policy",
            SubResourceKind::IpSet => "ip_set",
            SubResourceKind::WebAcl => "web_acl",
            SubResourceKind::Association => "association",
            SubResourceKind::AliasRecord => "alias_record",
        }
    }
}

impl fmt::Display for SubResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether this invocation made the sub-resource or found it already there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    Created,
    Adopted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubResource {
    pub kind: SubResourceKind,
    pub id: String,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, Default)]
pub struct ResourceStateStore {
    logical_id: String,
    physical_id: Option<String>,
    sub_resources: Vec<SubResource>,
    snapshots: BTreeMap<SubResourceKind, Value>,
}

impl ResourceStateStore {
    pub fn new(logical_id: impl Into<String>, physical_id: Option<String>) -> Self {
        Self {
            logical_id: logical_id.into(),
            physical_id,
            ..Self::default()
        }
    }

    pub fn logical_id(&self) -> &str {
        &self.logical_id
    }

    pub fn physical_id(&self) -> Option<&str> {
        self.physical_id.as_deref()
    }

    pub fn set_physical_id(&mut self, physical_id: impl Into<String>) {
        self.physical_id = Some(physical_id.into());
    }

    pub fn record_created(&mut self, kind: SubResourceKind, id: impl Into<String>) {
        self.record(kind, id.into(), Provenance::Created);
    }

    pub fn record_adopted(&mut self, kind: SubResourceKind, id: impl Into<String>) {
        self.record(kind, id.into(), Provenance::Adopted);
    }

    fn record(&mut self, kind: SubResourceKind, id: String, provenance: Provenance) {
        if self.sub_resources.iter().any(|s| s.kind == kind && s.id == id) {
            return;
        }
        self.sub_resources.push(SubResource {
            kind,
            id,
            provenance,
        });
    }

    /// Drop a sub-resource that has been deleted again.
    pub fn forget(&mut self, kind: SubResourceKind, id: &str) {
        self.sub_resources
            .retain(|s| !(s.kind == kind && s.id == id));
    }

    /// All recorded sub-resources in the order they were touched.
    pub fn sub_resources(&self) -> &[SubResource] {
        &self.sub_resources
    }

    /// Sub-resources this invocation created, newest first.
    pub fn created_newest_first(&self) -> Vec<SubResource> {
        self.sub_resources
            .iter()
            .rev()
            .filter(|s| s.provenance == Provenance::Created)
            .cloned()
            .collect()
    }

    pub fn was_created(&self, kind: SubResourceKind, id: &str) -> bool {
        self.sub_resources
            .iter()
            .any(|s| s.kind == kind && s.id == id && s.provenance == Provenance::Created)
    }

    /// Keep the last observed provider view of a sub-resource.
    pub fn snapshot<T: Serialize>(&mut self, kind: SubResourceKind, observed: &T) {
        if let Ok(value) = serde_json::to_value(observed) {
            self.snapshots.insert(kind, value);
        }
    }

    pub fn snapshot_of(&self, kind: SubResourceKind) -> Option<&Value> {
        self.snapshots.get(&kind)
    }

    /// `kind:id` labels of created sub-resources, for logging.
    pub fn created_labels(&self) -> Vec<String> {
        self.sub_resources
            .iter()
            .filter(|s| s.provenance == Provenance::Created)
            .map(|s| format!("{}:{}", s.kind, s.id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creation_order_is_kept_and_reversed_for_rollback() {
        let mut store = ResourceStateStore::new("WorkerGroup", None);
        store.record_created(SubResourceKind::LaunchTemplate, "lt-1");
        store.record_adopted(SubResourceKind::IpSet, "ip-1");
        store.record_created(SubResourceKind::ScalingGroup, "web");
        store.record_created(SubResourceKind::ScalingGroup, "web");

        let rollback: Vec<_> = store
            .created_newest_first()
            .into_iter()
            .map(|s| s.kind)
            .collect();
        assert_eq!(
            rollback,
            vec![SubResourceKind::ScalingGroup, SubResourceKind::LaunchTemplate]
        );
        assert!(!store.was_created(SubResourceKind::IpSet, "ip-1"));
        assert_eq!(
            store.created_labels(),
            vec!["launch_template:lt-1", "scaling_group:web"]
        );
    }

    #[test]
    fn forgotten_resources_leave_the_ledger() {
        let mut store = ResourceStateStore::new("Edge", Some("REGIONAL/edge".into()));
        store.record_created(SubResourceKind::IpSet, "ip-1");
        store.forget(SubResourceKind::IpSet, "ip-1");
        assert!(store.sub_resources().is_empty());
        assert_eq!(store.physical_id(), Some("REGIONAL/edge"));
    }

    #[test]
    fn snapshots_are_keyed_by_kind() {
        let mut store = ResourceStateStore::new("Edge", None);
        store.snapshot(SubResourceKind::IpSet, &vec!["10.0.0.0/8"]);
        store.snapshot(SubResourceKind::IpSet, &vec!["192.168.0.0/16"]);
        assert_eq!(
            store.snapshot_of(SubResourceKind::IpSet),
            Some(&serde_json::json!(["192.168.0.0/16"]))
        );
    }
}
