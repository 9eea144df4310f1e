//! ---
//! crorch_section: "05-networking-external-interfaces"
//! crorch_subsection: "module"
//! crorch_type: "source"
//! crorch_scope: "code"
//! crorch_description: "Retrying, deadline-aware wrapper over the control plane."
//! crorch_version: "v0.1.0"
//! crorch_owner: "platform"
//! ---
//! Thin client over a [`ControlPlane`]: every call is retried on transient
//! errors with bounded backoff, and no retry is scheduled past the deadline
//! the client was scoped to. The client carries no business logic; the only
//! compound calls are the read-modify-write cycles that lock tokens require.

use std::future::Future;
use std::sync::Arc;

use crorch_resilience::{retry_with_backoff, Deadline, RetryError, RetryPolicy};
use tracing::trace;

use crate::control_plane::{ControlPlane, Operation};
use crate::error::{ProviderError, ProviderResult};
use crate::model::{
    AliasRecord, Architecture, IpSet, IpSetSpec, LaunchTemplate, LaunchTemplateData, RecordType,
    ResourceSummary, ScalingGroup, ScalingGroupSpec, ScalingGroupUpdate, ScalingPolicy,
    TargetTrackingPolicySpec, TemplateSelector, WafAction, WafScope, WebAcl, WebAclRule,
    WebAclSpec,
};

#[derive(Clone)]
pub struct ProviderClient {
    plane: Arc<dyn ControlPlane>,
    policy: RetryPolicy,
    deadline: Deadline,
}

impl std::fmt::Debug for ProviderClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderClient")
            .field("policy", &self.policy)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl ProviderClient {
    pub fn new(plane: Arc<dyn ControlPlane>, policy: RetryPolicy) -> Self {
        Self {
            plane,
            policy,
            deadline: Deadline::unbounded(),
        }
    }

    /// Copy of this client whose retries stop at `deadline`.
    pub fn scoped(&self, deadline: Deadline) -> Self {
        Self {
            plane: Arc::clone(&self.plane),
            policy: self.policy,
            deadline,
        }
    }

    pub fn deadline(&self) -> &Deadline {
        &self.deadline
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn call<T, F, Fut>(
        &self,
        operation: Operation,
        target: &str,
        mut attempt: F,
    ) -> ProviderResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        trace!(operation = operation.as_str(), target, "provider call");
        retry_with_backoff(
            &self.policy,
            &self.deadline,
            operation.as_str(),
            ProviderError::is_retryable,
            |_| attempt(),
        )
        .await
        .map_err(|err| match err {
            RetryError::Permanent(err) => err,
            RetryError::Exhausted { attempts, last } => ProviderError::RetriesExhausted {
                operation: operation.as_str().to_owned(),
                attempts,
                last: Box::new(last),
            },
            RetryError::OutOfBudget { attempts, last } => ProviderError::RetryBudgetExhausted {
                operation: operation.as_str().to_owned(),
                attempts,
                last: Box::new(last),
            },
        })
    }

    pub async fn latest_image(&self, architecture: Architecture) -> ProviderResult<String> {
        self.call(Operation::LatestImage, architecture.as_str(), || {
            self.plane.latest_image(architecture)
        })
        .await
    }

    pub async fn create_launch_template(
        &self,
        name: &str,
        data: &LaunchTemplateData,
    ) -> ProviderResult<LaunchTemplate> {
        self.call(Operation::CreateLaunchTemplate, name, || {
            self.plane.create_launch_template(name, data)
        })
        .await
    }

    pub async fn create_launch_template_version(
        &self,
        id: &str,
        data: &LaunchTemplateData,
    ) -> ProviderResult<u32> {
        self.call(Operation::CreateLaunchTemplateVersion, id, || {
            self.plane.create_launch_template_version(id, data)
        })
        .await
    }

    pub async fn describe_launch_template(
        &self,
        selector: &TemplateSelector,
    ) -> ProviderResult<Option<LaunchTemplate>> {
        let target = selector.to_string();
        self.call(Operation::DescribeLaunchTemplate, &target, || {
            self.plane.describe_launch_template(selector)
        })
        .await
    }

    pub async fn delete_launch_template(&self, id: &str) -> ProviderResult<()> {
        self.call(Operation::DeleteLaunchTemplate, id, || {
            self.plane.delete_launch_template(id)
        })
        .await
    }

    pub async fn create_scaling_group(&self, spec: &ScalingGroupSpec) -> ProviderResult<()> {
        self.call(Operation::CreateScalingGroup, &spec.name, || {
            self.plane.create_scaling_group(spec)
        })
        .await
    }

    pub async fn describe_scaling_group(&self, name: &str) -> ProviderResult<Option<ScalingGroup>> {
        self.call(Operation::DescribeScalingGroup, name, || {
            self.plane.describe_scaling_group(name)
        })
        .await
    }

    pub async fn update_scaling_group(&self, update: &ScalingGroupUpdate) -> ProviderResult<()> {
        self.call(Operation::UpdateScalingGroup, &update.name, || {
            self.plane.update_scaling_group(update)
        })
        .await
    }

    pub async fn delete_scaling_group(&self, name: &str, force: bool) -> ProviderResult<()> {
        self.call(Operation::DeleteScalingGroup, name, || {
            self.plane.delete_scaling_group(name, force)
        })
        .await
    }

    pub async fn put_scaling_policy(
        &self,
        spec: &TargetTrackingPolicySpec,
    ) -> ProviderResult<ScalingPolicy> {
        self.call(Operation::PutScalingPolicy, &spec.policy_name, || {
            self.plane.put_scaling_policy(spec)
        })
        .await
    }

    pub async fn describe_scaling_policies(
        &self,
        group_name: &str,
    ) -> ProviderResult<Vec<ScalingPolicy>> {
        self.call(Operation::DescribeScalingPolicies, group_name, || {
            self.plane.describe_scaling_policies(group_name)
        })
        .await
    }

    pub async fn delete_scaling_policy(
        &self,
        group_name: &str,
        policy_name: &str,
    ) -> ProviderResult<()> {
        self.call(Operation::DeleteScalingPolicy, policy_name, || {
            self.plane.delete_scaling_policy(group_name, policy_name)
        })
        .await
    }

    pub async fn create_ip_set(&self, spec: &IpSetSpec) -> ProviderResult<ResourceSummary> {
        self.call(Operation::CreateIpSet, &spec.name, || {
            self.plane.create_ip_set(spec)
        })
        .await
    }

    pub async fn get_ip_set(&self, scope: WafScope, id: &str) -> ProviderResult<IpSet> {
        self.call(Operation::GetIpSet, id, || self.plane.get_ip_set(scope, id))
            .await
    }

    /// IP set in `scope` carrying `name`, if any.
    pub async fn find_ip_set(
        &self,
        scope: WafScope,
        name: &str,
    ) -> ProviderResult<Option<ResourceSummary>> {
        let listed = self
            .call(Operation::ListIpSets, name, || self.plane.list_ip_sets(scope))
            .await?;
        Ok(listed.into_iter().find(|summary| summary.name == name))
    }

    /// Replace the addresses of an IP set, fetching a fresh lock token on every attempt.
    pub async fn replace_ip_set_addresses(
        &self,
        scope: WafScope,
        id: &str,
        addresses: &[String],
    ) -> ProviderResult<()> {
        let plane = &self.plane;
        self.call(Operation::UpdateIpSet, id, || async move {
            let current = plane.get_ip_set(scope, id).await?;
            plane
                .update_ip_set(scope, id, addresses, &current.lock_token)
                .await
                .map(|_| ())
        })
        .await
    }

    pub async fn delete_ip_set(&self, scope: WafScope, id: &str) -> ProviderResult<()> {
        let plane = &self.plane;
        self.call(Operation::DeleteIpSet, id, || async move {
            let current = plane.get_ip_set(scope, id).await?;
            plane.delete_ip_set(scope, id, &current.lock_token).await
        })
        .await
    }

    pub async fn create_web_acl(&self, spec: &WebAclSpec) -> ProviderResult<ResourceSummary> {
        self.call(Operation::CreateWebAcl, &spec.name, || {
            self.plane.create_web_acl(spec)
        })
        .await
    }

    pub async fn get_web_acl(&self, scope: WafScope, id: &str) -> ProviderResult<WebAcl> {
        self.call(Operation::GetWebAcl, id, || self.plane.get_web_acl(scope, id))
            .await
    }

    /// Web ACL in `scope` carrying `name`, if any.
    pub async fn find_web_acl(
        &self,
        scope: WafScope,
        name: &str,
    ) -> ProviderResult<Option<ResourceSummary>> {
        let listed = self
            .call(Operation::ListWebAcls, name, || self.plane.list_web_acls(scope))
            .await?;
        Ok(listed.into_iter().find(|summary| summary.name == name))
    }

    /// Replace default action and rules, fetching a fresh lock token on every attempt.
    pub async fn replace_web_acl_rules(
        &self,
        scope: WafScope,
        id: &str,
        default_action: WafAction,
        rules: &[WebAclRule],
    ) -> ProviderResult<()> {
        let plane = &self.plane;
        self.call(Operation::UpdateWebAcl, id, || async move {
            let current = plane.get_web_acl(scope, id).await?;
            plane
                .update_web_acl(scope, id, default_action, rules, &current.lock_token)
                .await
                .map(|_| ())
        })
        .await
    }

    pub async fn delete_web_acl(&self, scope: WafScope, id: &str) -> ProviderResult<()> {
        let plane = &self.plane;
        self.call(Operation::DeleteWebAcl, id, || async move {
            let current = plane.get_web_acl(scope, id).await?;
            plane.delete_web_acl(scope, id, &current.lock_token).await
        })
        .await
    }

    pub async fn associate_web_acl(&self, acl_arn: &str, resource_arn: &str) -> ProviderResult<()> {
        self.call(Operation::AssociateWebAcl, resource_arn, || {
            self.plane.associate_web_acl(acl_arn, resource_arn)
        })
        .await
    }

    pub async fn disassociate_web_acl(&self, resource_arn: &str) -> ProviderResult<()> {
        self.call(Operation::DisassociateWebAcl, resource_arn, || {
            self.plane.disassociate_web_acl(resource_arn)
        })
        .await
    }

    pub async fn list_resources_for_web_acl(&self, acl_arn: &str) -> ProviderResult<Vec<String>> {
        self.call(Operation::ListResourcesForWebAcl, acl_arn, || {
            self.plane.list_resources_for_web_acl(acl_arn)
        })
        .await
    }

    pub async fn upsert_alias_record(&self, record: &AliasRecord) -> ProviderResult<()> {
        self.call(Operation::UpsertAliasRecord, &record.name, || {
            self.plane.upsert_alias_record(record)
        })
        .await
    }

    pub async fn get_alias_record(
        &self,
        hosted_zone_id: &str,
        name: &str,
        record_type: RecordType,
    ) -> ProviderResult<Option<AliasRecord>> {
        self.call(Operation::GetAliasRecord, name, || {
            self.plane.get_alias_record(hosted_zone_id, name, record_type)
        })
        .await
    }

    pub async fn delete_alias_record(&self, record: &AliasRecord) -> ProviderResult<()> {
        self.call(Operation::DeleteAliasRecord, &record.name, || {
            self.plane.delete_alias_record(record)
        })
        .await
    }
}
