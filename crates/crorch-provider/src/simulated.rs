//! ---
//! crorch_section: "05-networking-external-interfaces"
//! crorch_subsection: "module"
//! crorch_type: "source"
//! crorch_scope: "code"
//! crorch_description: "In-process control plane with referential integrity and fault injection."
//! crorch_version: "v0.1.0"
//! crorch_owner: "platform"
//! ---
//! Simulated control plane.
//!
//! Keeps launch templates, scaling groups, policies, IP sets, web ACLs and alias
//! records in memory and enforces the constraints the real services enforce:
//! name uniqueness, lock tokens, and refusal to delete referenced resources.
//! Every call is recorded, faults can be scripted per operation, and the state
//! can be persisted to a JSON file so that separate CLI invocations observe
//! one another.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use crorch_common::config::ProviderConfig;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::control_plane::{ControlPlane, Operation};
use crate::error::{classify, ProviderError, ProviderResult};
use crate::model::{
    AliasRecord, Architecture, IpSet, IpSetSpec, LaunchTemplate, LaunchTemplateData,
    LaunchTemplateRef, RecordType, ResourceSummary, RuleStatement, ScalingGroup, ScalingGroupSpec,
    ScalingGroupUpdate, ScalingPolicy, TargetTrackingPolicySpec, TemplateSelector, WafAction,
    WafScope, WebAcl, WebAclRule, WebAclSpec,
};

const ACCOUNT_ID: &str = "123456789012";
const DELETING_STATUS: &str = "Delete in progress";

/// Behavioural knobs of the simulation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulationSettings {
    /// Number of describe calls a force-deleted scaling group stays visible for.
    pub deletion_polls: u32,
}

/// Scripted misbehaviour for one operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// Fail with a vendor error code, classified like a real response.
    Error { code: String, message: String },
    /// Never answer.
    Hang,
}

#[derive(Debug, Clone)]
struct FaultRule {
    operation: Operation,
    fault: Fault,
    /// `None` keeps the rule armed forever.
    remaining: Option<usize>,
}

/// One captured control-plane call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub operation: Operation,
    pub target: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredTemplate {
    id: String,
    name: String,
    versions: Vec<LaunchTemplateData>,
}

impl StoredTemplate {
    fn describe(&self) -> Option<LaunchTemplate> {
        let latest = self.versions.last()?;
        Some(LaunchTemplate {
            id: self.id.clone(),
            name: self.name.clone(),
            latest_version: self.versions.len() as u32,
            latest_data: latest.clone(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredGroup {
    group: ScalingGroup,
    /// Describe calls left before a deleting group vanishes.
    polls_until_gone: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SimState {
    next_id: u64,
    launch_templates: BTreeMap<String, StoredTemplate>,
    scaling_groups: BTreeMap<String, StoredGroup>,
    scaling_policies: BTreeMap<String, ScalingPolicy>,
    ip_sets: BTreeMap<String, IpSet>,
    web_acls: BTreeMap<String, WebAcl>,
    /// Protected resource ARN to web ACL ARN.
    associations: BTreeMap<String, String>,
    alias_records: BTreeMap<String, AliasRecord>,
}

impl SimState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn template_by_name(&self, name: &str) -> Option<&StoredTemplate> {
        self.launch_templates.values().find(|t| t.name == name)
    }

    fn check_template_ref(&self, reference: &LaunchTemplateRef) -> ProviderResult<()> {
        let valid = self
            .launch_templates
            .get(&reference.id)
            .map(|t| reference.version >= 1 && reference.version as usize <= t.versions.len())
            .unwrap_or(false);
        if valid {
            Ok(())
        } else {
            Err(classify(
                "ValidationError",
                &format!(
                    "The specified launch template, with template ID {} and version {}, does not exist.",
                    reference.id, reference.version
                ),
            ))
        }
    }

    fn live_group(&self, name: &str) -> ProviderResult<&StoredGroup> {
        match self.scaling_groups.get(name) {
            Some(stored) if stored.polls_until_gone.is_none() => Ok(stored),
            Some(_) => Err(classify(
                "ScalingActivityInProgress",
                &format!("AutoScalingGroup {name} is being deleted"),
            )),
            None => Err(group_not_found(name)),
        }
    }
}

fn group_not_found(name: &str) -> ProviderError {
    classify(
        "ValidationError",
        &format!("AutoScalingGroup name not found - {name}"),
    )
}

fn waf_not_found(kind: &str, id: &str) -> ProviderError {
    classify(
        "WAFNonexistentItemException",
        &format!("{kind} {id} does not exist"),
    )
}

fn check_capacity(min: u32, desired: u32, max: u32) -> ProviderResult<()> {
    if min > max {
        return Err(classify(
            "ValidationError",
            &format!("Max bound, {max}, must be greater than or equal to min bound, {min}"),
        ));
    }
    if desired < min || desired > max {
        return Err(classify(
            "ValidationError",
            &format!(
                "Desired capacity:{desired} must be between the specified min size:{min} and max size:{max}"
            ),
        ));
    }
    Ok(())
}

fn policy_key(group: &str, policy: &str) -> String {
    format!("{group}/{policy}")
}

fn record_key(zone: &str, name: &str, record_type: RecordType) -> String {
    format!("{zone}/{name}/{record_type}")
}

#[derive(Debug)]
pub struct SimulatedControlPlane {
    region: String,
    settings: SimulationSettings,
    state_file: Option<PathBuf>,
    state: Mutex<SimState>,
    calls: Mutex<Vec<RecordedCall>>,
    faults: Mutex<Vec<FaultRule>>,
}

impl SimulatedControlPlane {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            settings: SimulationSettings::default(),
            state_file: None,
            state: Mutex::new(SimState::default()),
            calls: Mutex::new(Vec::new()),
            faults: Mutex::new(Vec::new()),
        }
    }

    pub fn with_settings(mut self, settings: SimulationSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Back the simulation with a JSON state file, loading it when present.
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("unable to read simulator state {}", path.display()))?;
            let state: SimState = serde_json::from_str(&raw)
                .with_context(|| format!("corrupt simulator state {}", path.display()))?;
            *self.state.get_mut() = state;
            debug!(path = %path.display(), "simulator state loaded");
        }
        self.state_file = Some(path);
        Ok(self)
    }

    /// Build the backend described by the `[provider]` section.
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let plane = Self::new(config.region.clone());
        match &config.state_file {
            Some(path) => plane.with_state_file(path),
            None => Ok(plane),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    // ----- fault scripting -------------------------------------------------

    pub fn inject(&self, operation: Operation, fault: Fault, times: Option<usize>) {
        self.faults.lock().push(FaultRule {
            operation,
            fault,
            remaining: times,
        });
    }

    pub fn fail_next(&self, operation: Operation, code: &str, message: &str) {
        self.fail_times(operation, 1, code, message);
    }

    pub fn fail_times(&self, operation: Operation, times: usize, code: &str, message: &str) {
        self.inject(
            operation,
            Fault::Error {
                code: code.to_owned(),
                message: message.to_owned(),
            },
            Some(times),
        );
    }

    pub fn fail_always(&self, operation: Operation, code: &str, message: &str) {
        self.inject(
            operation,
            Fault::Error {
                code: code.to_owned(),
                message: message.to_owned(),
            },
            None,
        );
    }

    pub fn hang(&self, operation: Operation) {
        self.inject(operation, Fault::Hang, None);
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    // ----- call capture ----------------------------------------------------

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.calls.lock().iter().map(|c| c.operation).collect()
    }

    pub fn count_calls(&self, operation: Operation) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    // ----- state inspection ------------------------------------------------

    pub fn launch_templates(&self) -> Vec<LaunchTemplate> {
        self.state
            .lock()
            .launch_templates
            .values()
            .filter_map(StoredTemplate::describe)
            .collect()
    }

    pub fn scaling_groups(&self) -> Vec<ScalingGroup> {
        self.state
            .lock()
            .scaling_groups
            .values()
            .map(|s| s.group.clone())
            .collect()
    }

    pub fn scaling_policies(&self) -> Vec<ScalingPolicy> {
        self.state.lock().scaling_policies.values().cloned().collect()
    }

    pub fn ip_sets(&self) -> Vec<IpSet> {
        self.state.lock().ip_sets.values().cloned().collect()
    }

    pub fn web_acls(&self) -> Vec<WebAcl> {
        self.state.lock().web_acls.values().cloned().collect()
    }

    pub fn associations(&self) -> BTreeMap<String, String> {
        self.state.lock().associations.clone()
    }

    pub fn alias_records(&self) -> Vec<AliasRecord> {
        self.state.lock().alias_records.values().cloned().collect()
    }

    // ----- internals -------------------------------------------------------

    async fn enter(&self, operation: Operation, target: &str) -> ProviderResult<()> {
        self.calls.lock().push(RecordedCall {
            operation,
            target: target.to_owned(),
        });
        let fault = {
            let mut faults = self.faults.lock();
            let position = faults.iter().position(|rule| rule.operation == operation);
            match position {
                Some(index) => {
                    let fault = faults[index].fault.clone();
                    if let Some(remaining) = faults[index].remaining.as_mut() {
                        *remaining -= 1;
                        if *remaining == 0 {
                            faults.remove(index);
                        }
                    }
                    Some(fault)
                }
                None => None,
            }
        };
        match fault {
            None => Ok(()),
            Some(Fault::Error { code, message }) => {
                debug!(operation = operation.as_str(), code = %code, "injected fault");
                Err(classify(&code, &message))
            }
            Some(Fault::Hang) => {
                debug!(operation = operation.as_str(), "injected hang");
                std::future::pending().await
            }
        }
    }

    fn read<T>(&self, f: impl FnOnce(&SimState) -> T) -> T {
        f(&self.state.lock())
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut SimState) -> ProviderResult<T>) -> ProviderResult<T> {
        let outcome = {
            let mut state = self.state.lock();
            f(&mut state)
        };
        if outcome.is_ok() {
            self.persist();
        }
        outcome
    }

    fn persist(&self) {
        let Some(path) = &self.state_file else {
            return;
        };
        let serialized = match serde_json::to_vec_pretty(&*self.state.lock()) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "unable to serialise simulator state");
                return;
            }
        };
        if let Err(err) = write_atomically(path, &serialized) {
            warn!(path = %path.display(), error = %err, "unable to persist simulator state");
        }
    }

    fn waf_arn(&self, scope: WafScope, kind: &str, name: &str, id: &str) -> String {
        let region = match scope {
            WafScope::Regional => self.region.as_str(),
            WafScope::Cloudfront => "us-east-1",
        };
        let path = match scope {
            WafScope::Regional => "regional",
            WafScope::Cloudfront => "global",
        };
        format!("arn:aws:wafv2:{region}:{ACCOUNT_ID}:{path}/{kind}/{name}/{id}")
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let staging = path.with_extension("tmp");
    fs::write(&staging, bytes)?;
    fs::rename(&staging, path)
}

#[async_trait]
impl ControlPlane for SimulatedControlPlane {
    async fn latest_image(&self, architecture: Architecture) -> ProviderResult<String> {
        self.enter(Operation::LatestImage, architecture.as_str()).await?;
        Ok(match architecture {
            Architecture::Arm64 => "ami-0a7f3c9e2b1d40001".to_owned(),
            Architecture::X86_64 => "ami-0c5e8b1f7a2d40002".to_owned(),
        })
    }

    async fn create_launch_template(
        &self,
        name: &str,
        data: &LaunchTemplateData,
    ) -> ProviderResult<LaunchTemplate> {
        self.enter(Operation::CreateLaunchTemplate, name).await?;
        self.mutate(|state| {
            if state.template_by_name(name).is_some() {
                return Err(classify(
                    "InvalidLaunchTemplateName.AlreadyExistsException",
                    &format!("Launch template name already in use: {name}"),
                ));
            }
            if data.image_id.is_empty() {
                return Err(classify(
                    "InvalidParameterValue",
                    "launch template data requires an image id",
                ));
            }
            let id = format!("lt-{:017x}", state.next_id());
            let stored = StoredTemplate {
                id: id.clone(),
                name: name.to_owned(),
                versions: vec![data.clone()],
            };
            let description = stored.describe();
            state.launch_templates.insert(id.clone(), stored);
            description.ok_or_else(|| classify("InternalError", "template without versions"))
        })
    }

    async fn create_launch_template_version(
        &self,
        id: &str,
        data: &LaunchTemplateData,
    ) -> ProviderResult<u32> {
        self.enter(Operation::CreateLaunchTemplateVersion, id).await?;
        self.mutate(|state| {
            let stored = state.launch_templates.get_mut(id).ok_or_else(|| {
                classify(
                    "InvalidLaunchTemplateId.NotFound",
                    &format!("The specified launch template, with template ID {id}, does not exist"),
                )
            })?;
            stored.versions.push(data.clone());
            Ok(stored.versions.len() as u32)
        })
    }

    async fn describe_launch_template(
        &self,
        selector: &TemplateSelector,
    ) -> ProviderResult<Option<LaunchTemplate>> {
        self.enter(Operation::DescribeLaunchTemplate, &selector.to_string())
            .await?;
        Ok(self.read(|state| match selector {
            TemplateSelector::Id(id) => state.launch_templates.get(id).and_then(StoredTemplate::describe),
            TemplateSelector::Name(name) => {
                state.template_by_name(name).and_then(StoredTemplate::describe)
            }
        }))
    }

    async fn delete_launch_template(&self, id: &str) -> ProviderResult<()> {
        self.enter(Operation::DeleteLaunchTemplate, id).await?;
        self.mutate(|state| {
            if !state.launch_templates.contains_key(id) {
                return Err(classify(
                    "InvalidLaunchTemplateId.NotFound",
                    &format!("The specified launch template, with template ID {id}, does not exist"),
                ));
            }
            if let Some(user) = state
                .scaling_groups
                .values()
                .find(|s| s.group.mixed_instances.launch_template.id == id)
            {
                return Err(classify(
                    "ResourceInUse",
                    &format!(
                        "launch template {id} is in use by scaling group {}",
                        user.group.name
                    ),
                ));
            }
            state.launch_templates.remove(id);
            Ok(())
        })
    }

    async fn create_scaling_group(&self, spec: &ScalingGroupSpec) -> ProviderResult<()> {
        self.enter(Operation::CreateScalingGroup, &spec.name).await?;
        let arn_suffix = Uuid::new_v4();
        let region = self.region.clone();
        self.mutate(|state| {
            if state.scaling_groups.contains_key(&spec.name) {
                return Err(classify(
                    "AlreadyExists",
                    &format!("AutoScalingGroup by this name already exists - {}", spec.name),
                ));
            }
            check_capacity(spec.min_size, spec.desired_capacity, spec.max_size)?;
            state.check_template_ref(&spec.mixed_instances.launch_template)?;
            if spec.mixed_instances.instance_types.is_empty() {
                return Err(classify(
                    "ValidationError",
                    "MixedInstancesPolicy requires at least one instance type override",
                ));
            }
            let group = ScalingGroup {
                name: spec.name.clone(),
                arn: format!(
                    "arn:aws:autoscaling:{region}:{ACCOUNT_ID}:autoScalingGroup:{arn_suffix}:autoScalingGroupName/{}",
                    spec.name
                ),
                min_size: spec.min_size,
                max_size: spec.max_size,
                desired_capacity: spec.desired_capacity,
                subnet_ids: spec.subnet_ids.clone(),
                mixed_instances: spec.mixed_instances.clone(),
                health_check_grace_period: spec.health_check_grace_period,
                instance_count: spec.desired_capacity,
                status: None,
            };
            state.scaling_groups.insert(
                spec.name.clone(),
                StoredGroup {
                    group,
                    polls_until_gone: None,
                },
            );
            Ok(())
        })
    }

    async fn describe_scaling_group(&self, name: &str) -> ProviderResult<Option<ScalingGroup>> {
        self.enter(Operation::DescribeScalingGroup, name).await?;
        self.mutate(|state| {
            let Some(stored) = state.scaling_groups.get_mut(name) else {
                return Ok(None);
            };
            match stored.polls_until_gone {
                None => return Ok(Some(stored.group.clone())),
                Some(left) if left > 0 => {
                    stored.polls_until_gone = Some(left - 1);
                    return Ok(Some(stored.group.clone()));
                }
                Some(_) => {}
            }
            state.scaling_groups.remove(name);
            Ok(None)
        })
    }

    async fn update_scaling_group(&self, update: &ScalingGroupUpdate) -> ProviderResult<()> {
        self.enter(Operation::UpdateScalingGroup, &update.name).await?;
        self.mutate(|state| {
            let current = state.live_group(&update.name)?.group.clone();
            let min = update.min_size.unwrap_or(current.min_size);
            let max = update.max_size.unwrap_or(current.max_size);
            let desired = update.desired_capacity.unwrap_or(current.desired_capacity);
            check_capacity(min, desired, max)?;
            if let Some(mixed) = &update.mixed_instances {
                state.check_template_ref(&mixed.launch_template)?;
            }
            let stored = state
                .scaling_groups
                .get_mut(&update.name)
                .ok_or_else(|| group_not_found(&update.name))?;
            let group = &mut stored.group;
            group.min_size = min;
            group.max_size = max;
            group.desired_capacity = desired;
            group.instance_count = desired;
            if let Some(subnets) = &update.subnet_ids {
                group.subnet_ids = subnets.clone();
            }
            if let Some(mixed) = &update.mixed_instances {
                group.mixed_instances = mixed.clone();
            }
            if let Some(grace) = update.health_check_grace_period {
                group.health_check_grace_period = grace;
            }
            Ok(())
        })
    }

    async fn delete_scaling_group(&self, name: &str, force: bool) -> ProviderResult<()> {
        self.enter(Operation::DeleteScalingGroup, name).await?;
        let lag = self.settings.deletion_polls;
        self.mutate(|state| {
            let stored = state
                .scaling_groups
                .get_mut(name)
                .ok_or_else(|| group_not_found(name))?;
            if stored.polls_until_gone.is_some() {
                return Ok(());
            }
            if !force && stored.group.instance_count > 0 {
                return Err(classify(
                    "ResourceInUse",
                    "You cannot delete an AutoScalingGroup while there are instances still in the group.",
                ));
            }
            if lag == 0 {
                state.scaling_groups.remove(name);
            } else {
                stored.polls_until_gone = Some(lag);
                stored.group.status = Some(DELETING_STATUS.to_owned());
                stored.group.instance_count = 0;
            }
            state
                .scaling_policies
                .retain(|_, policy| policy.group_name != name);
            Ok(())
        })
    }

    async fn put_scaling_policy(
        &self,
        spec: &TargetTrackingPolicySpec,
    ) -> ProviderResult<ScalingPolicy> {
        self.enter(Operation::PutScalingPolicy, &spec.policy_name).await?;
        let region = self.region.clone();
        self.mutate(|state| {
            state.live_group(&spec.group_name)?;
            if !(spec.target_value > 0.0 && spec.target_value <= 100.0) {
                return Err(classify(
                    "ValidationError",
                    &format!("TargetValue {} is out of range", spec.target_value),
                ));
            }
            let key = policy_key(&spec.group_name, &spec.policy_name);
            let arn = match state.scaling_policies.get(&key) {
                Some(existing) => existing.arn.clone(),
                None => format!(
                    "arn:aws:autoscaling:{region}:{ACCOUNT_ID}:scalingPolicy:{}:autoScalingGroupName/{}:policyName/{}",
                    Uuid::new_v4(),
                    spec.group_name,
                    spec.policy_name
                ),
            };
            let policy = ScalingPolicy {
                group_name: spec.group_name.clone(),
                policy_name: spec.policy_name.clone(),
                arn,
                target_value: spec.target_value,
            };
            state.scaling_policies.insert(key, policy.clone());
            Ok(policy)
        })
    }

    async fn describe_scaling_policies(
        &self,
        group_name: &str,
    ) -> ProviderResult<Vec<ScalingPolicy>> {
        self.enter(Operation::DescribeScalingPolicies, group_name)
            .await?;
        Ok(self.read(|state| {
            state
                .scaling_policies
                .values()
                .filter(|policy| policy.group_name == group_name)
                .cloned()
                .collect()
        }))
    }

    async fn delete_scaling_policy(
        &self,
        group_name: &str,
        policy_name: &str,
    ) -> ProviderResult<()> {
        self.enter(Operation::DeleteScalingPolicy, policy_name).await?;
        self.mutate(|state| {
            state
                .scaling_policies
                .remove(&policy_key(group_name, policy_name))
                .map(|_| ())
                .ok_or_else(|| {
                    classify(
                        "ValidationError",
                        &format!("Policy {policy_name} not found for group {group_name}"),
                    )
                })
        })
    }

    async fn create_ip_set(&self, spec: &IpSetSpec) -> ProviderResult<ResourceSummary> {
        self.enter(Operation::CreateIpSet, &spec.name).await?;
        let id = Uuid::new_v4().to_string();
        let arn = self.waf_arn(spec.scope, "ipset", &spec.name, &id);
        self.mutate(|state| {
            if state
                .ip_sets
                .values()
                .any(|s| s.scope == spec.scope && s.name == spec.name)
            {
                return Err(classify(
                    "WAFDuplicateItemException",
                    &format!("IP set {} already exists", spec.name),
                ));
            }
            if let Some(bad) = spec.addresses.iter().find(|a| !a.contains('/')) {
                return Err(classify(
                    "WAFInvalidParameterException",
                    &format!("address {bad} is not in CIDR notation"),
                ));
            }
            let lock_token = Uuid::new_v4().to_string();
            state.ip_sets.insert(
                id.clone(),
                IpSet {
                    id: id.clone(),
                    name: spec.name.clone(),
                    arn: arn.clone(),
                    scope: spec.scope,
                    description: spec.description.clone(),
                    addresses: spec.addresses.clone(),
                    lock_token: lock_token.clone(),
                },
            );
            Ok(ResourceSummary {
                id: id.clone(),
                name: spec.name.clone(),
                arn: arn.clone(),
                lock_token,
            })
        })
    }

    async fn get_ip_set(&self, scope: WafScope, id: &str) -> ProviderResult<IpSet> {
        self.enter(Operation::GetIpSet, id).await?;
        self.read(|state| {
            state
                .ip_sets
                .get(id)
                .filter(|s| s.scope == scope)
                .cloned()
                .ok_or_else(|| waf_not_found("IP set", id))
        })
    }

    async fn list_ip_sets(&self, scope: WafScope) -> ProviderResult<Vec<ResourceSummary>> {
        self.enter(Operation::ListIpSets, scope.as_str()).await?;
        Ok(self.read(|state| {
            state
                .ip_sets
                .values()
                .filter(|s| s.scope == scope)
                .map(|s| ResourceSummary {
                    id: s.id.clone(),
                    name: s.name.clone(),
                    arn: s.arn.clone(),
                    lock_token: s.lock_token.clone(),
                })
                .collect()
        }))
    }

    async fn update_ip_set(
        &self,
        scope: WafScope,
        id: &str,
        addresses: &[String],
        lock_token: &str,
    ) -> ProviderResult<String> {
        self.enter(Operation::UpdateIpSet, id).await?;
        self.mutate(|state| {
            let set = state
                .ip_sets
                .get_mut(id)
                .filter(|s| s.scope == scope)
                .ok_or_else(|| waf_not_found("IP set", id))?;
            if set.lock_token != lock_token {
                return Err(classify(
                    "WAFOptimisticLockException",
                    "AWS WAF couldn't save your changes because someone changed the resource after you started to edit it.",
                ));
            }
            set.addresses = addresses.to_vec();
            set.lock_token = Uuid::new_v4().to_string();
            Ok(set.lock_token.clone())
        })
    }

    async fn delete_ip_set(&self, scope: WafScope, id: &str, lock_token: &str) -> ProviderResult<()> {
        self.enter(Operation::DeleteIpSet, id).await?;
        self.mutate(|state| {
            let set = state
                .ip_sets
                .get(id)
                .filter(|s| s.scope == scope)
                .ok_or_else(|| waf_not_found("IP set", id))?;
            if set.lock_token != lock_token {
                return Err(classify(
                    "WAFOptimisticLockException",
                    "lock token is out of date",
                ));
            }
            let referenced_by = state.web_acls.values().find(|acl| {
                acl.rules.iter().any(|rule| {
                    matches!(&rule.statement, RuleStatement::IpSetReference { arn } if *arn == set.arn)
                })
            });
            if let Some(acl) = referenced_by {
                return Err(classify(
                    "WAFAssociatedItemException",
                    &format!("IP set {} is referenced by web ACL {}", set.name, acl.name),
                ));
            }
            state.ip_sets.remove(id);
            Ok(())
        })
    }

    async fn create_web_acl(&self, spec: &WebAclSpec) -> ProviderResult<ResourceSummary> {
        self.enter(Operation::CreateWebAcl, &spec.name).await?;
        let id = Uuid::new_v4().to_string();
        let arn = self.waf_arn(spec.scope, "webacl", &spec.name, &id);
        self.mutate(|state| {
            if state
                .web_acls
                .values()
                .any(|acl| acl.scope == spec.scope && acl.name == spec.name)
            {
                return Err(classify(
                    "WAFDuplicateItemException",
                    &format!("web ACL {} already exists", spec.name),
                ));
            }
            validate_rules(state, &spec.rules)?;
            let lock_token = Uuid::new_v4().to_string();
            state.web_acls.insert(
                id.clone(),
                WebAcl {
                    id: id.clone(),
                    name: spec.name.clone(),
                    arn: arn.clone(),
                    scope: spec.scope,
                    description: spec.description.clone(),
                    default_action: spec.default_action,
                    rules: spec.rules.clone(),
                    lock_token: lock_token.clone(),
                },
            );
            Ok(ResourceSummary {
                id: id.clone(),
                name: spec.name.clone(),
                arn: arn.clone(),
                lock_token,
            })
        })
    }

    async fn get_web_acl(&self, scope: WafScope, id: &str) -> ProviderResult<WebAcl> {
        self.enter(Operation::GetWebAcl, id).await?;
        self.read(|state| {
            state
                .web_acls
                .get(id)
                .filter(|acl| acl.scope == scope)
                .cloned()
                .ok_or_else(|| waf_not_found("web ACL", id))
        })
    }

    async fn list_web_acls(&self, scope: WafScope) -> ProviderResult<Vec<ResourceSummary>> {
        self.enter(Operation::ListWebAcls, scope.as_str()).await?;
        Ok(self.read(|state| {
            state
                .web_acls
                .values()
                .filter(|acl| acl.scope == scope)
                .map(|acl| ResourceSummary {
                    id: acl.id.clone(),
                    name: acl.name.clone(),
                    arn: acl.arn.clone(),
                    lock_token: acl.lock_token.clone(),
                })
                .collect()
        }))
    }

    async fn update_web_acl(
        &self,
        scope: WafScope,
        id: &str,
        default_action: WafAction,
        rules: &[WebAclRule],
        lock_token: &str,
    ) -> ProviderResult<String> {
        self.enter(Operation::UpdateWebAcl, id).await?;
        self.mutate(|state| {
            validate_rules(state, rules)?;
            let acl = state
                .web_acls
                .get_mut(id)
                .filter(|acl| acl.scope == scope)
                .ok_or_else(|| waf_not_found("web ACL", id))?;
            if acl.lock_token != lock_token {
                return Err(classify(
                    "WAFOptimisticLockException",
                    "lock token is out of date",
                ));
            }
            acl.default_action = default_action;
            acl.rules = rules.to_vec();
            acl.lock_token = Uuid::new_v4().to_string();
            Ok(acl.lock_token.clone())
        })
    }

    async fn delete_web_acl(&self, scope: WafScope, id: &str, lock_token: &str) -> ProviderResult<()> {
        self.enter(Operation::DeleteWebAcl, id).await?;
        self.mutate(|state| {
            let acl = state
                .web_acls
                .get(id)
                .filter(|acl| acl.scope == scope)
                .ok_or_else(|| waf_not_found("web ACL", id))?;
            if acl.lock_token != lock_token {
                return Err(classify(
                    "WAFOptimisticLockException",
                    "lock token is out of date",
                ));
            }
            if state.associations.values().any(|arn| *arn == acl.arn) {
                return Err(classify(
                    "WAFAssociatedItemException",
                    &format!("web ACL {} is still associated with resources", acl.name),
                ));
            }
            state.web_acls.remove(id);
            Ok(())
        })
    }

    async fn associate_web_acl(&self, acl_arn: &str, resource_arn: &str) -> ProviderResult<()> {
        self.enter(Operation::AssociateWebAcl, resource_arn).await?;
        self.mutate(|state| {
            if !state.web_acls.values().any(|acl| acl.arn == acl_arn) {
                return Err(waf_not_found("web ACL", acl_arn));
            }
            if !resource_arn.starts_with("arn:") {
                return Err(classify(
                    "WAFInvalidParameterException",
                    &format!("{resource_arn} is not a resource ARN"),
                ));
            }
            state
                .associations
                .insert(resource_arn.to_owned(), acl_arn.to_owned());
            Ok(())
        })
    }

    async fn disassociate_web_acl(&self, resource_arn: &str) -> ProviderResult<()> {
        self.enter(Operation::DisassociateWebAcl, resource_arn)
            .await?;
        self.mutate(|state| {
            state.associations.remove(resource_arn);
            Ok(())
        })
    }

    async fn list_resources_for_web_acl(&self, acl_arn: &str) -> ProviderResult<Vec<String>> {
        self.enter(Operation::ListResourcesForWebAcl, acl_arn).await?;
        self.read(|state| {
            if !state.web_acls.values().any(|acl| acl.arn == acl_arn) {
                return Err(waf_not_found("web ACL", acl_arn));
            }
            Ok(state
                .associations
                .iter()
                .filter(|(_, acl)| *acl == acl_arn)
                .map(|(resource, _)| resource.clone())
                .collect())
        })
    }

    async fn upsert_alias_record(&self, record: &AliasRecord) -> ProviderResult<()> {
        self.enter(Operation::UpsertAliasRecord, &record.name).await?;
        self.mutate(|state| {
            if record.hosted_zone_id.is_empty() {
                return Err(classify("NoSuchHostedZone", "No hosted zone found with ID: "));
            }
            if record.target_dns_name.is_empty() {
                return Err(classify(
                    "InvalidInput",
                    "alias target DNS name must not be empty",
                ));
            }
            state.alias_records.insert(
                record_key(&record.hosted_zone_id, &record.name, record.record_type),
                record.clone(),
            );
            Ok(())
        })
    }

    async fn get_alias_record(
        &self,
        hosted_zone_id: &str,
        name: &str,
        record_type: RecordType,
    ) -> ProviderResult<Option<AliasRecord>> {
        self.enter(Operation::GetAliasRecord, name).await?;
        Ok(self.read(|state| {
            state
                .alias_records
                .get(&record_key(hosted_zone_id, name, record_type))
                .cloned()
        }))
    }

    async fn delete_alias_record(&self, record: &AliasRecord) -> ProviderResult<()> {
        self.enter(Operation::DeleteAliasRecord, &record.name).await?;
        self.mutate(|state| {
            state
                .alias_records
                .remove(&record_key(&record.hosted_zone_id, &record.name, record.record_type))
                .map(|_| ())
                .ok_or_else(|| {
                    classify(
                        "InvalidChangeBatch",
                        &format!(
                            "Tried to delete resource record set [name='{}', type='{}'] but it was not found",
                            record.name, record.record_type
                        ),
                    )
                })
        })
    }
}

fn validate_rules(state: &SimState, rules: &[WebAclRule]) -> ProviderResult<()> {
    let mut priorities: Vec<u32> = rules.iter().map(|r| r.priority).collect();
    priorities.sort_unstable();
    priorities.dedup();
    if priorities.len() != rules.len() {
        return Err(classify(
            "WAFInvalidParameterException",
            "rule priorities must be unique",
        ));
    }
    for rule in rules {
        if let RuleStatement::IpSetReference { arn } = &rule.statement {
            if !state.ip_sets.values().any(|set| set.arn == *arn) {
                return Err(classify(
                    "WAFNonexistentContainerException",
                    &format!("rule {} references unknown IP set {arn}", rule.name),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::model::{InstancesDistribution, MixedInstancesPolicy};

    fn template_data() -> LaunchTemplateData {
        LaunchTemplateData {
            image_id: "ami-1".into(),
            instance_type: "t4g.medium".into(),
            security_group_ids: vec![],
            instance_profile_name: None,
            key_name: None,
            user_data: None,
            tags: BTreeMap::new(),
        }
    }

    fn group_spec(name: &str, template: &LaunchTemplate) -> ScalingGroupSpec {
        ScalingGroupSpec {
            name: name.into(),
            min_size: 0,
            max_size: 2,
            desired_capacity: 1,
            subnet_ids: vec!["subnet-1".into()],
            mixed_instances: MixedInstancesPolicy {
                launch_template: template.latest_ref(),
                instance_types: vec!["t4g.medium".into()],
                distribution: InstancesDistribution {
                    on_demand_base_capacity: 0,
                    on_demand_percentage_above_base: 100,
                    spot_allocation_strategy: "price-capacity-optimized".into(),
                },
            },
            health_check_grace_period: 300,
            tags: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn launch_template_names_are_unique() {
        let plane = SimulatedControlPlane::new("us-east-1");
        plane
            .create_launch_template("web-lt", &template_data())
            .await
            .expect("first create");
        let err = plane
            .create_launch_template("web-lt", &template_data())
            .await
            .expect_err("duplicate rejected");
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn templates_in_use_cannot_be_deleted_until_the_group_is_gone() {
        let plane = SimulatedControlPlane::new("us-east-1").with_settings(SimulationSettings {
            deletion_polls: 1,
        });
        let template = plane
            .create_launch_template("web-lt", &template_data())
            .await
            .expect("template");
        plane
            .create_scaling_group(&group_spec("web", &template))
            .await
            .expect("group");

        let err = plane
            .delete_launch_template(&template.id)
            .await
            .expect_err("in use");
        assert!(err.is_in_use());

        let err = plane
            .delete_scaling_group("web", false)
            .await
            .expect_err("instances still running");
        assert!(err.is_in_use());
        plane.delete_scaling_group("web", true).await.expect("forced");

        let lingering = plane.describe_scaling_group("web").await.expect("describe");
        assert!(lingering.expect("still visible").is_deleting());
        assert!(plane.describe_scaling_group("web").await.expect("describe").is_none());
        plane
            .delete_launch_template(&template.id)
            .await
            .expect("template free");
    }

    #[tokio::test]
    async fn referenced_ip_sets_cannot_be_deleted() {
        let plane = SimulatedControlPlane::new("us-east-1");
        let set = plane
            .create_ip_set(&IpSetSpec {
                name: "edge-ipset".into(),
                scope: WafScope::Regional,
                description: None,
                addresses: vec!["10.0.0.0/8".into()],
            })
            .await
            .expect("ip set");
        let acl = plane
            .create_web_acl(&WebAclSpec {
                name: "edge".into(),
                scope: WafScope::Regional,
                description: None,
                default_action: WafAction::Allow,
                rules: vec![WebAclRule {
                    name: "ip-set-rule".into(),
                    priority: 0,
                    statement: RuleStatement::IpSetReference {
                        arn: set.arn.clone(),
                    },
                    action: Some(WafAction::Block),
                }],
            })
            .await
            .expect("acl");

        let err = plane
            .delete_ip_set(WafScope::Regional, &set.id, &set.lock_token)
            .await
            .expect_err("referenced");
        assert_eq!(err.code(), "WAFAssociatedItemException");

        plane
            .delete_web_acl(WafScope::Regional, &acl.id, &acl.lock_token)
            .await
            .expect("acl deleted");
        plane
            .delete_ip_set(WafScope::Regional, &set.id, &set.lock_token)
            .await
            .expect("now free");
    }

    #[tokio::test]
    async fn stale_lock_tokens_are_rejected() {
        let plane = SimulatedControlPlane::new("us-east-1");
        let set = plane
            .create_ip_set(&IpSetSpec {
                name: "edge-ipset".into(),
                scope: WafScope::Regional,
                description: None,
                addresses: vec![],
            })
            .await
            .expect("ip set");
        plane
            .update_ip_set(WafScope::Regional, &set.id, &[], &set.lock_token)
            .await
            .expect("first update");
        let err = plane
            .update_ip_set(WafScope::Regional, &set.id, &[], &set.lock_token)
            .await
            .expect_err("stale");
        assert!(matches!(err, ProviderError::StaleLockToken { .. }));
    }

    #[tokio::test]
    async fn calls_are_captured_and_faults_expire() {
        let plane = SimulatedControlPlane::new("us-east-1");
        plane.fail_next(Operation::LatestImage, "Throttling", "Rate exceeded");
        assert!(plane.latest_image(Architecture::Arm64).await.is_err());
        assert!(plane.latest_image(Architecture::Arm64).await.is_ok());
        assert_eq!(
            plane.operations(),
            vec![Operation::LatestImage, Operation::LatestImage]
        );
    }

    #[tokio::test]
    async fn hung_operations_never_answer() {
        let plane = SimulatedControlPlane::new("us-east-1");
        plane.hang(Operation::ListWebAcls);
        let outcome = tokio::time::timeout(
            Duration::from_millis(50),
            plane.list_web_acls(WafScope::Regional),
        )
        .await;
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn state_survives_a_reload_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.json");

        let first = SimulatedControlPlane::new("us-east-1")
            .with_state_file(&path)
            .expect("fresh state");
        first
            .create_launch_template("web-lt", &template_data())
            .await
            .expect("template");

        let second = SimulatedControlPlane::new("us-east-1")
            .with_state_file(&path)
            .expect("reload");
        let found = second
            .describe_launch_template(&TemplateSelector::Name("web-lt".into()))
            .await
            .expect("describe");
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn deleting_a_missing_record_reports_not_found() {
        let plane = SimulatedControlPlane::new("us-east-1");
        let err = plane
            .delete_alias_record(&AliasRecord {
                hosted_zone_id: "Z1".into(),
                name: "api.example.com.".into(),
                record_type: RecordType::A,
                target_dns_name: "lb.example.net".into(),
                target_hosted_zone_id: "Z2".into(),
                evaluate_target_health: false,
            })
            .await
            .expect_err("missing");
        assert!(err.is_not_found());
    }
}
