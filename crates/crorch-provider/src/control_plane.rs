//! ---
//! crorch_section: "05-networking-external-interfaces"
//! crorch_subsection: "module"
//! crorch_type: "source"
//! crorch_scope: "code"
//! crorch_description: "Async trait seam over the cloud control-plane API."
//! crorch_version: "v0.1.0"
//! crorch_owner: "platform"
//! ---
use std::fmt;

use async_trait::async_trait;

use crate::error::ProviderResult;
use crate::model::{
    AliasRecord, Architecture, IpSet, IpSetSpec, LaunchTemplate, LaunchTemplateData, RecordType,
    ResourceSummary, ScalingGroup, ScalingGroupSpec, ScalingGroupUpdate, ScalingPolicy,
    TargetTrackingPolicySpec, TemplateSelector, WafAction, WafScope, WebAcl, WebAclRule,
    WebAclSpec,
};

/// Control-plane API names, used for logging, retry labels and call capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    LatestImage,
    CreateLaunchTemplate,
    CreateLaunchTemplateVersion,
    DescribeLaunchTemplate,
    DeleteLaunchTemplate,
    CreateScalingGroup,
    DescribeScalingGroup,
    UpdateScalingGroup,
    DeleteScalingGroup,
    PutScalingPolicy,
    DescribeScalingPolicies,
    DeleteScalingPolicy,
    CreateIpSet,
    GetIpSet,
    ListIpSets,
    UpdateIpSet,
    DeleteIpSet,
    CreateWebAcl,
    GetWebAcl,
    ListWebAcls,
    UpdateWebAcl,
    DeleteWebAcl,
    AssociateWebAcl,
    DisassociateWebAcl,
    ListResourcesForWebAcl,
    UpsertAliasRecord,
    GetAliasRecord,
    DeleteAliasRecord,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::LatestImage => "GetParameter",
            Operation::CreateLaunchTemplate => "CreateLaunchTemplate",
            Operation::CreateLaunchTemplateVersion => "CreateLaunchTemplateVersion",
            Operation::DescribeLaunchTemplate => "DescribeLaunchTemplates",
            Operation::DeleteLaunchTemplate => "DeleteLaunchTemplate",
            Operation::CreateScalingGroup => "CreateAutoScalingGroup",
            Operation::DescribeScalingGroup => "DescribeAutoScalingGroups",
            Operation::UpdateScalingGroup => "UpdateAutoScalingGroup",
            Operation::DeleteScalingGroup => "DeleteAutoScalingGroup",
            Operation::PutScalingPolicy => "PutScalingPolicy",
            Operation::DescribeScalingPolicies => "DescribePolicies",
            Operation::DeleteScalingPolicy => "DeletePolicy",
            Operation::CreateIpSet => "CreateIPSet",
            Operation::GetIpSet => "GetIPSet",
            Operation::ListIpSets => "ListIPSets",
            Operation::UpdateIpSet => "UpdateIPSet",
            Operation::DeleteIpSet => "DeleteIPSet",
            Operation::CreateWebAcl => "CreateWebACL",
            Operation::GetWebAcl => "GetWebACL",
            Operation::ListWebAcls => "ListWebACLs",
            Operation::UpdateWebAcl => "UpdateWebACL",
            Operation::DeleteWebAcl => "DeleteWebACL",
            Operation::AssociateWebAcl => "AssociateWebACL",
            Operation::DisassociateWebAcl => "DisassociateWebACL",
            Operation::ListResourcesForWebAcl => "ListResourcesForWebACL",
            Operation::UpsertAliasRecord => "ChangeResourceRecordSets:UPSERT",
            Operation::GetAliasRecord => "ListResourceRecordSets",
            Operation::DeleteAliasRecord => "ChangeResourceRecordSets:DELETE",
        }
    }

    /// Whether the call changes provider state.
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            Operation::LatestImage
                | Operation::DescribeLaunchTemplate
                | Operation::DescribeScalingGroup
                | Operation::DescribeScalingPolicies
                | Operation::GetIpSet
                | Operation::ListIpSets
                | Operation::GetWebAcl
                | Operation::ListWebAcls
                | Operation::ListResourcesForWebAcl
                | Operation::GetAliasRecord
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed surface of the provider control plane.
///
/// Implementations report vendor failures through
/// [`classify`](crate::error::classify) so callers see one taxonomy.
/// Describe-style calls return `Ok(None)` for absent resources; get-style
/// calls return a `NotFound` error.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Latest published machine image for the architecture.
    async fn latest_image(&self, architecture: Architecture) -> ProviderResult<String>;

    async fn create_launch_template(
        &self,
        name: &str,
        data: &LaunchTemplateData,
    ) -> ProviderResult<LaunchTemplate>;
    /// Returns the new version number.
    async fn create_launch_template_version(
        &self,
        id: &str,
        data: &LaunchTemplateData,
    ) -> ProviderResult<u32>;
    async fn describe_launch_template(
        &self,
        selector: &TemplateSelector,
    ) -> ProviderResult<Option<LaunchTemplate>>;
    async fn delete_launch_template(&self, id: &str) -> ProviderResult<()>;

    async fn create_scaling_group(&self, spec: &ScalingGroupSpec) -> ProviderResult<()>;
    async fn describe_scaling_group(&self, name: &str) -> ProviderResult<Option<ScalingGroup>>;
    async fn update_scaling_group(&self, update: &ScalingGroupUpdate) -> ProviderResult<()>;
    /// `force` terminates running instances with the group.
    async fn delete_scaling_group(&self, name: &str, force: bool) -> ProviderResult<()>;

    async fn put_scaling_policy(
        &self,
        spec: &TargetTrackingPolicySpec,
    ) -> ProviderResult<ScalingPolicy>;
    async fn describe_scaling_policies(&self, group_name: &str)
        -> ProviderResult<Vec<ScalingPolicy>>;
    async fn delete_scaling_policy(&self, group_name: &str, policy_name: &str)
        -> ProviderResult<()>;

    async fn create_ip_set(&self, spec: &IpSetSpec) -> ProviderResult<ResourceSummary>;
    async fn get_ip_set(&self, scope: WafScope, id: &str) -> ProviderResult<IpSet>;
    async fn list_ip_sets(&self, scope: WafScope) -> ProviderResult<Vec<ResourceSummary>>;
    /// Replaces the address list wholesale; returns the next lock token.
    async fn update_ip_set(
        &self,
        scope: WafScope,
        id: &str,
        addresses: &[String],
        lock_token: &str,
    ) -> ProviderResult<String>;
    async fn delete_ip_set(&self, scope: WafScope, id: &str, lock_token: &str)
        -> ProviderResult<()>;

    async fn create_web_acl(&self, spec: &WebAclSpec) -> ProviderResult<ResourceSummary>;
    async fn get_web_acl(&self, scope: WafScope, id: &str) -> ProviderResult<WebAcl>;
    async fn list_web_acls(&self, scope: WafScope) -> ProviderResult<Vec<ResourceSummary>>;
    /// Replaces default action and rules; returns the next lock token.
    async fn update_web_acl(
        &self,
        scope: WafScope,
        id: &str,
        default_action: WafAction,
        rules: &[WebAclRule],
        lock_token: &str,
    ) -> ProviderResult<String>;
    async fn delete_web_acl(&self, scope: WafScope, id: &str, lock_token: &str)
        -> ProviderResult<()>;
    async fn associate_web_acl(&self, acl_arn: &str, resource_arn: &str) -> ProviderResult<()>;
    async fn disassociate_web_acl(&self, resource_arn: &str) -> ProviderResult<()>;
    async fn list_resources_for_web_acl(&self, acl_arn: &str) -> ProviderResult<Vec<String>>;

    async fn upsert_alias_record(&self, record: &AliasRecord) -> ProviderResult<()>;
    async fn get_alias_record(
        &self,
        hosted_zone_id: &str,
        name: &str,
        record_type: RecordType,
    ) -> ProviderResult<Option<AliasRecord>>;
    async fn delete_alias_record(&self, record: &AliasRecord) -> ProviderResult<()>;
}
