//! ---
//! crorch_section: "05-networking-external-interfaces"
//! crorch_subsection: "module"
//! crorch_type: "source"
//! crorch_scope: "code"
//! crorch_description: "Typed request and description models for control-plane calls."
//! crorch_version: "v0.1.0"
//! crorch_owner: "platform"
//! ---
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// CPU architecture of a launch template image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Architecture {
    #[default]
    #[serde(rename = "arm64")]
    Arm64,
    #[serde(rename = "x86_64")]
    X86_64,
}

impl Architecture {
    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::Arm64 => "arm64",
            Architecture::X86_64 => "x86_64",
        }
    }

    /// Instance mix used when a template does not name one.
    pub fn default_instance_types(&self) -> &'static [&'static str] {
        match self {
            Architecture::Arm64 => &["t4g.medium", "t4g.large", "c7g.large", "c7g.xlarge"],
            Architecture::X86_64 => &["t3.medium", "t3.large", "c6i.large", "c6i.xlarge"],
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "arm64" | "aarch64" => Ok(Architecture::Arm64),
            "x86_64" | "amd64" => Ok(Architecture::X86_64),
            other => Err(format!("unknown architecture: {other}")),
        }
    }
}

/// Contents of one launch template version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchTemplateData {
    pub image_id: String,
    pub instance_type: String,
    #[serde(default)]
    pub security_group_ids: Vec<String>,
    #[serde(default)]
    pub instance_profile_name: Option<String>,
    #[serde(default)]
    pub key_name: Option<String>,
    #[serde(default)]
    pub user_data: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchTemplate {
    pub id: String,
    pub name: String,
    pub latest_version: u32,
    pub latest_data: LaunchTemplateData,
}

impl LaunchTemplate {
    pub fn latest_ref(&self) -> LaunchTemplateRef {
        LaunchTemplateRef {
            id: self.id.clone(),
            version: self.latest_version,
        }
    }
}

/// Lookup key for launch templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateSelector {
    Id(String),
    Name(String),
}

impl fmt::Display for TemplateSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateSelector::Id(id) => f.write_str(id),
            TemplateSelector::Name(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchTemplateRef {
    pub id: String,
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstancesDistribution {
    pub on_demand_base_capacity: u32,
    pub on_demand_percentage_above_base: u8,
    pub spot_allocation_strategy: String,
}

/// On-demand/spot mix across several instance types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MixedInstancesPolicy {
    pub launch_template: LaunchTemplateRef,
    pub instance_types: Vec<String>,
    pub distribution: InstancesDistribution,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingGroupSpec {
    pub name: String,
    pub min_size: u32,
    pub max_size: u32,
    pub desired_capacity: u32,
    pub subnet_ids: Vec<String>,
    pub mixed_instances: MixedInstancesPolicy,
    pub health_check_grace_period: u32,
    pub tags: BTreeMap<String, String>,
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingGroupUpdate {
    pub name: String,
    pub min_size: Option<u32>,
    pub max_size: Option<u32>,
    pub desired_capacity: Option<u32>,
    pub subnet_ids: Option<Vec<String>>,
    pub mixed_instances: Option<MixedInstancesPolicy>,
    pub health_check_grace_period: Option<u32>,
}

impl ScalingGroupUpdate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.min_size.is_none()
            && self.max_size.is_none()
            && self.desired_capacity.is_none()
            && self.subnet_ids.is_none()
            && self.mixed_instances.is_none()
            && self.health_check_grace_period.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingGroup {
    pub name: String,
    pub arn: String,
    pub min_size: u32,
    pub max_size: u32,
    pub desired_capacity: u32,
    pub subnet_ids: Vec<String>,
    pub mixed_instances: MixedInstancesPolicy,
    pub health_check_grace_period: u32,
    pub instance_count: u32,
    /// Set while a forced delete is in progress.
    pub status: Option<String>,
}

impl ScalingGroup {
    pub fn is_deleting(&self) -> bool {
        self.status.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetTrackingPolicySpec {
    pub group_name: String,
    pub policy_name: String,
    /// Average CPU utilisation target in percent.
    pub target_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingPolicy {
    pub group_name: String,
    pub policy_name: String,
    pub arn: String,
    pub target_value: f64,
}

/// Firewall deployment scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WafScope {
    #[default]
    Regional,
    Cloudfront,
}

impl WafScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            WafScope::Regional => "REGIONAL",
            WafScope::Cloudfront => "CLOUDFRONT",
        }
    }
}

impl fmt::Display for WafScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WafScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "REGIONAL" => Ok(WafScope::Regional),
            "CLOUDFRONT" => Ok(WafScope::Cloudfront),
            other => Err(format!("unknown firewall scope: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WafAction {
    Allow,
    Block,
}

impl WafAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            WafAction::Allow => "ALLOW",
            WafAction::Block => "BLOCK",
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            WafAction::Allow => WafAction::Block,
            WafAction::Block => WafAction::Allow,
        }
    }
}

impl fmt::Display for WafAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WafAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ALLOW" => Ok(WafAction::Allow),
            "BLOCK" => Ok(WafAction::Block),
            other => Err(format!("unknown firewall action: {other}")),
        }
    }
}

/// Identity and lock token of an IP set or web ACL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSummary {
    pub id: String,
    pub name: String,
    pub arn: String,
    pub lock_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpSetSpec {
    pub name: String,
    pub scope: WafScope,
    pub description: Option<String>,
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpSet {
    pub id: String,
    pub name: String,
    pub arn: String,
    pub scope: WafScope,
    pub description: Option<String>,
    pub addresses: Vec<String>,
    pub lock_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum RuleStatement {
    IpSetReference { arn: String },
    ManagedRuleGroup { vendor: String, name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebAclRule {
    pub name: String,
    pub priority: u32,
    pub statement: RuleStatement,
    /// Terminating action for IP rules; managed groups keep their own actions.
    pub action: Option<WafAction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebAclSpec {
    pub name: String,
    pub scope: WafScope,
    pub description: Option<String>,
    pub default_action: WafAction,
    pub rules: Vec<WebAclRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebAcl {
    pub id: String,
    pub name: String,
    pub arn: String,
    pub scope: WafScope,
    pub description: Option<String>,
    pub default_action: WafAction,
    pub rules: Vec<WebAclRule>,
    pub lock_token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RecordType {
    #[default]
    A,
    #[serde(rename = "AAAA")]
    Aaaa,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::A => "A",
            RecordType::Aaaa => "AAAA",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "A" => Ok(RecordType::A),
            "AAAA" => Ok(RecordType::Aaaa),
            other => Err(format!("unsupported alias record type: {other}")),
        }
    }
}

/// DNS alias pointing a name at another provider-hosted endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AliasRecord {
    pub hosted_zone_id: String,
    /// Fully qualified, lower case, trailing dot.
    pub name: String,
    pub record_type: RecordType,
    pub target_dns_name: String,
    pub target_hosted_zone_id: String,
    pub evaluate_target_health: bool,
}

impl AliasRecord {
    /// `<zone>/<name>/<type>` identity of the record.
    pub fn identity(&self) -> String {
        format!("{}/{}/{}", self.hosted_zone_id, self.name, self.record_type)
    }
}

/// Normalise a DNS name to lower case with a trailing dot.
pub fn fqdn(name: &str) -> String {
    let lowered = name.trim().to_ascii_lowercase();
    if lowered.ends_with('.') {
        lowered
    } else {
        format!("{lowered}.")
    }
}
