//! ---
//! crorch_section: "01-core-functionality"
//! crorch_subsection: "module"
//! crorch_type: "source"
//! crorch_scope: "code"
//! crorch_description: "Typed, validated property bags per resource family."
//! crorch_version: "v0.1.0"
//! crorch_owner: "platform"
//! ---
//! Desired-property parsing.
//!
//! Template engines send property bags with PascalCase keys and string-typed
//! scalars. Keys are normalised to camelCase and values are accepted in both
//! native and string form before being parsed into a per-family struct.
//! Keys a family does not know are rejected rather than ignored.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crorch_provider::model::{Architecture, RecordType, WafAction, WafScope};
use serde::Deserialize;
use serde_json::{Map, Value};
use serde_with::formats::CommaSeparator;
use serde_with::{serde_as, DisplayFromStr, PickFirst, StringWithSeparator};

use crate::error::HandlerError;

/// Keys the template engine adds that never reach a handler.
const RESERVED_KEYS: &[&str] = &["serviceToken", "resourceType"];

/// Resource family selected by the request's resource type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    ScalingGroup,
    Firewall,
    DnsRecord,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::ScalingGroup => "ScalingGroup",
            ResourceKind::Firewall => "Firewall",
            ResourceKind::DnsRecord => "DnsRecord",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown resource type tag.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported resource type: {0}")]
pub struct UnsupportedResourceType(pub String);

impl FromStr for ResourceKind {
    type Err = UnsupportedResourceType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_start_matches("Custom::") {
            "ScalingGroup" => Ok(ResourceKind::ScalingGroup),
            "Firewall" => Ok(ResourceKind::Firewall),
            "DnsRecord" => Ok(ResourceKind::DnsRecord),
            _ => Err(UnsupportedResourceType(s.to_owned())),
        }
    }
}

/// Validated desired properties, tagged by resource family.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceProperties {
    ScalingGroup(ScalingGroupProperties),
    Firewall(FirewallProperties),
    DnsRecord(DnsRecordProperties),
}

impl ResourceProperties {
    /// Parse and validate a raw property bag for `kind`.
    pub fn parse(kind: ResourceKind, raw: &Map<String, Value>) -> Result<Self, HandlerError> {
        let normalised = Value::Object(normalise_keys(raw));
        let parsed = match kind {
            ResourceKind::ScalingGroup => {
                let props: ScalingGroupProperties = from_value(normalised)?;
                props.validate()?;
                ResourceProperties::ScalingGroup(props)
            }
            ResourceKind::Firewall => {
                let props: FirewallProperties = from_value(normalised)?;
                props.validate()?;
                ResourceProperties::Firewall(props)
            }
            ResourceKind::DnsRecord => {
                let props: DnsRecordProperties = from_value(normalised)?;
                props.validate()?;
                ResourceProperties::DnsRecord(props)
            }
        };
        Ok(parsed)
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceProperties::ScalingGroup(_) => ResourceKind::ScalingGroup,
            ResourceProperties::Firewall(_) => ResourceKind::Firewall,
            ResourceProperties::DnsRecord(_) => ResourceKind::DnsRecord,
        }
    }
}

fn from_value<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, HandlerError> {
    serde_json::from_value(value).map_err(|err| HandlerError::validation(err.to_string()))
}

/// Lower-case the first character of every top-level key and drop reserved keys.
pub fn normalise_keys(raw: &Map<String, Value>) -> Map<String, Value> {
    raw.iter()
        .map(|(key, value)| (camel_case(key), value.clone()))
        .filter(|(key, _)| !RESERVED_KEYS.contains(&key.as_str()))
        .collect()
}

fn camel_case(key: &str) -> String {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) => first.to_ascii_lowercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

fn trimmed(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
        .collect()
}

fn default_on_demand_percentage() -> u32 {
    100
}

fn default_spot_strategy() -> String {
    "price-capacity-optimized".to_owned()
}

fn default_grace_period() -> u32 {
    300
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ScalingGroupProperties {
    #[serde(alias = "autoScalingGroupName")]
    pub group_name: Option<String>,
    pub launch_template_name: Option<String>,
    #[serde(default, alias = "imageArchitecture")]
    #[serde_as(as = "DisplayFromStr")]
    pub architecture: Architecture,
    pub image_id: Option<String>,
    #[serde(default)]
    #[serde_as(as = "PickFirst<(_, StringWithSeparator<CommaSeparator, String>)>")]
    pub instance_types: Vec<String>,
    #[serde(default)]
    #[serde_as(as = "PickFirst<(_, StringWithSeparator<CommaSeparator, String>)>")]
    pub subnet_ids: Vec<String>,
    #[serde(default)]
    #[serde_as(as = "PickFirst<(_, StringWithSeparator<CommaSeparator, String>)>")]
    pub security_group_ids: Vec<String>,
    pub instance_profile_name: Option<String>,
    pub key_pair_name: Option<String>,
    pub user_data: Option<String>,
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub min_size: u32,
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub max_size: u32,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub desired_capacity: Option<u32>,
    #[serde(default)]
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub on_demand_base_capacity: u32,
    #[serde(default = "default_on_demand_percentage")]
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub on_demand_percentage: u32,
    #[serde(default = "default_spot_strategy")]
    pub spot_allocation_strategy: String,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub target_cpu_utilization: Option<f64>,
    #[serde(default = "default_grace_period")]
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub health_check_grace_period: u32,
}

impl ScalingGroupProperties {
    /// Desired capacity, defaulting to the lower bound.
    pub fn desired(&self) -> u32 {
        self.desired_capacity.unwrap_or(self.min_size)
    }

    /// Instance types with blanks removed, falling back to the architecture's mix.
    pub fn resolved_instance_types(&self) -> Vec<String> {
        let explicit = trimmed(&self.instance_types);
        if explicit.is_empty() {
            self.architecture
                .default_instance_types()
                .iter()
                .map(|t| (*t).to_owned())
                .collect()
        } else {
            explicit
        }
    }

    pub fn subnets(&self) -> Vec<String> {
        trimmed(&self.subnet_ids)
    }

    pub fn security_groups(&self) -> Vec<String> {
        trimmed(&self.security_group_ids)
    }

    pub fn validate(&self) -> Result<(), HandlerError> {
        if self.min_size > self.max_size {
            return Err(HandlerError::validation(format!(
                "minSize {} exceeds maxSize {}",
                self.min_size, self.max_size
            )));
        }
        let desired = self.desired();
        if desired < self.min_size || desired > self.max_size {
            return Err(HandlerError::validation(format!(
                "desiredCapacity {desired} must lie within [{}, {}]",
                self.min_size, self.max_size
            )));
        }
        if self.on_demand_percentage > 100 {
            return Err(HandlerError::validation(format!(
                "onDemandPercentage {} must be between 0 and 100",
                self.on_demand_percentage
            )));
        }
        if let Some(target) = self.target_cpu_utilization {
            if !(target > 0.0 && target <= 100.0) {
                return Err(HandlerError::validation(format!(
                    "targetCpuUtilization {target} must be in (0, 100]"
                )));
            }
        }
        if matches!(&self.group_name, Some(name) if name.trim().is_empty()) {
            return Err(HandlerError::validation("groupName must not be empty"));
        }
        Ok(())
    }
}

/// Provider-managed rule groups a firewall may enable, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ManagedRuleGroup {
    CommonRuleSet,
    KnownBadInputsRuleSet,
    AmazonIpReputationList,
    AnonymousIpList,
    SqliRuleSet,
    LinuxRuleSet,
}

impl ManagedRuleGroup {
    pub const ORDERED: [ManagedRuleGroup; 6] = [
        ManagedRuleGroup::CommonRuleSet,
        ManagedRuleGroup::KnownBadInputsRuleSet,
        ManagedRuleGroup::AmazonIpReputationList,
        ManagedRuleGroup::AnonymousIpList,
        ManagedRuleGroup::SqliRuleSet,
        ManagedRuleGroup::LinuxRuleSet,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ManagedRuleGroup::CommonRuleSet => "CommonRuleSet",
            ManagedRuleGroup::KnownBadInputsRuleSet => "KnownBadInputsRuleSet",
            ManagedRuleGroup::AmazonIpReputationList => "AmazonIpReputationList",
            ManagedRuleGroup::AnonymousIpList => "AnonymousIpList",
            ManagedRuleGroup::SqliRuleSet => "SQLiRuleSet",
            ManagedRuleGroup::LinuxRuleSet => "LinuxRuleSet",
        }
    }

    /// Name of the group as published by the vendor.
    pub fn vendor_name(&self) -> String {
        format!("AWSManagedRules{}", self.as_str())
    }
}

impl fmt::Display for ManagedRuleGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ManagedRuleGroup {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bare = s.trim();
        let bare = bare.strip_prefix("AWSManagedRules").unwrap_or(bare);
        ManagedRuleGroup::ORDERED
            .into_iter()
            .find(|group| group.as_str().eq_ignore_ascii_case(bare))
            .ok_or_else(|| format!("unknown managed rule group: {s}"))
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FirewallProperties {
    pub name: Option<String>,
    #[serde(default)]
    #[serde_as(as = "DisplayFromStr")]
    pub scope: WafScope,
    #[serde_as(as = "DisplayFromStr")]
    pub default_action: WafAction,
    #[serde(default, alias = "allowedIpCidrs")]
    #[serde_as(as = "PickFirst<(_, StringWithSeparator<CommaSeparator, String>)>")]
    pub cidrs: Vec<String>,
    #[serde_as(as = "Option<DisplayFromStr>")]
    pub ip_set_action: Option<WafAction>,
    #[serde(default)]
    #[serde_as(
        as = "PickFirst<(Vec<DisplayFromStr>, StringWithSeparator<CommaSeparator, ManagedRuleGroup>)>"
    )]
    pub rule_groups: Vec<ManagedRuleGroup>,
    #[serde(alias = "associatedResourceARN")]
    pub associated_resource_arn: Option<String>,
    pub description: Option<String>,
}

impl FirewallProperties {
    /// Action of the IP rule: the opposite of the default unless set explicitly.
    pub fn ip_rule_action(&self) -> WafAction {
        self.ip_set_action
            .unwrap_or_else(|| self.default_action.opposite())
    }

    /// Selected managed groups in evaluation order, without duplicates.
    pub fn ordered_rule_groups(&self) -> Vec<ManagedRuleGroup> {
        ManagedRuleGroup::ORDERED
            .into_iter()
            .filter(|group| self.rule_groups.contains(group))
            .collect()
    }

    pub fn normalised_cidrs(&self) -> Vec<String> {
        trimmed(&self.cidrs)
    }

    pub fn validate(&self) -> Result<(), HandlerError> {
        for cidr in self.normalised_cidrs() {
            validate_ipv4_cidr(&cidr)?;
        }
        if matches!(&self.name, Some(name) if name.trim().is_empty()) {
            return Err(HandlerError::validation("name must not be empty"));
        }
        if let Some(arn) = &self.associated_resource_arn {
            if !arn.starts_with("arn:") {
                return Err(HandlerError::validation(format!(
                    "associatedResourceArn {arn} is not an ARN"
                )));
            }
        }
        Ok(())
    }
}

/// Accepts `a.b.c.d/n` with `n` in 0..=32.
pub fn validate_ipv4_cidr(cidr: &str) -> Result<(), HandlerError> {
    let invalid = || HandlerError::validation(format!("invalid IPv4 CIDR: {cidr}"));
    let (address, prefix) = cidr.split_once('/').ok_or_else(invalid)?;
    address.parse::<Ipv4Addr>().map_err(|_| invalid())?;
    let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
    if prefix > 32 {
        return Err(invalid());
    }
    Ok(())
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DnsRecordProperties {
    pub hosted_zone_id: String,
    pub record_name: String,
    #[serde(default)]
    #[serde_as(as = "DisplayFromStr")]
    pub record_type: RecordType,
    pub target_dns_name: String,
    pub target_hosted_zone_id: String,
    #[serde(default)]
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub evaluate_target_health: bool,
}

impl DnsRecordProperties {
    pub fn validate(&self) -> Result<(), HandlerError> {
        for (field, value) in [
            ("hostedZoneId", &self.hosted_zone_id),
            ("recordName", &self.record_name),
            ("targetDnsName", &self.target_dns_name),
            ("targetHostedZoneId", &self.target_hosted_zone_id),
        ] {
            if value.trim().is_empty() {
                return Err(HandlerError::validation(format!("{field} must not be empty")));
            }
        }
        if self.hosted_zone_id.contains('/') || self.record_name.contains('/') {
            return Err(HandlerError::validation(
                "hostedZoneId and recordName must not contain '/'",
            ));
        }
        Ok(())
    }
}
