//! ---
//! crorch_section: "01-core-functionality"
//! crorch_subsection: "module"
//! crorch_type: "source"
//! crorch_scope: "code"
//! crorch_description: "Auto-scaling group, launch template and scaling policy lifecycle."
//! crorch_version: "v0.1.0"
//! crorch_owner: "platform"
//! ---
//! Scaling group handler.
//!
//! The physical id is the group name. A group owns one launch template
//! (`<group>-lt` unless named explicitly) and at most one target-tracking
//! policy (`<group>-cpu-target`). Templates carry the owning group's name in
//! a tag so a later delete can find them once the group is gone.

use std::collections::BTreeMap;

use async_trait::async_trait;
use crorch_logging::{crorch_info, crorch_warn};
use crorch_provider::model::{
    InstancesDistribution, LaunchTemplate, LaunchTemplateData, LaunchTemplateRef,
    MixedInstancesPolicy, ScalingGroup, ScalingGroupSpec, ScalingGroupUpdate,
    TargetTrackingPolicySpec, TemplateSelector,
};
use crorch_resilience::wait_until;
use serde_json::{json, Map};

use crate::context::HandlerContext;
use crate::error::{tolerate_missing, HandlerError, StepExt};
use crate::properties::{ResourceKind, ScalingGroupProperties};
use crate::state::SubResourceKind;
use crate::{Provisioned, ResourceHandler};

const LOGICAL_ID_TAG: &str = "crorch:logical-id";
const GROUP_TAG: &str = "crorch:group";

/// Launch template name used when none is configured.
pub fn default_template_name(group_name: &str) -> String {
    format!("{group_name}-lt")
}

pub fn policy_name(group_name: &str) -> String {
    format!("{group_name}-cpu-target")
}

#[derive(Debug, Clone)]
struct DesiredGroup {
    group_name: String,
    template_name: String,
    template_data: LaunchTemplateData,
    instance_types: Vec<String>,
    min_size: u32,
    max_size: u32,
    desired_capacity: u32,
    subnet_ids: Vec<String>,
    distribution: InstancesDistribution,
    health_check_grace_period: u32,
    target_cpu: Option<f64>,
    tags: BTreeMap<String, String>,
}

impl DesiredGroup {
    fn mixed_instances(&self, template: LaunchTemplateRef) -> MixedInstancesPolicy {
        MixedInstancesPolicy {
            launch_template: template,
            instance_types: self.instance_types.clone(),
            distribution: self.distribution.clone(),
        }
    }

    fn spec(&self, template: LaunchTemplateRef) -> ScalingGroupSpec {
        ScalingGroupSpec {
            name: self.group_name.clone(),
            min_size: self.min_size,
            max_size: self.max_size,
            desired_capacity: self.desired_capacity,
            subnet_ids: self.subnet_ids.clone(),
            mixed_instances: self.mixed_instances(template),
            health_check_grace_period: self.health_check_grace_period,
            tags: self.tags.clone(),
        }
    }

    /// Fields that differ from the live group.
    fn diff(&self, live: &ScalingGroup, template: LaunchTemplateRef) -> ScalingGroupUpdate {
        let mut update = ScalingGroupUpdate::new(&live.name);
        if live.min_size != self.min_size {
            update.min_size = Some(self.min_size);
        }
        if live.max_size != self.max_size {
            update.max_size = Some(self.max_size);
        }
        if live.desired_capacity != self.desired_capacity {
            update.desired_capacity = Some(self.desired_capacity);
        }
        if !self.subnet_ids.is_empty() && live.subnet_ids != self.subnet_ids {
            update.subnet_ids = Some(self.subnet_ids.clone());
        }
        let mixed = self.mixed_instances(template);
        if live.mixed_instances != mixed {
            update.mixed_instances = Some(mixed);
        }
        if live.health_check_grace_period != self.health_check_grace_period {
            update.health_check_grace_period = Some(self.health_check_grace_period);
        }
        update
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScalingGroupHandler;

impl ScalingGroupHandler {
    pub fn new() -> Self {
        Self
    }

    fn group_name(ctx: &HandlerContext, props: &ScalingGroupProperties) -> String {
        props
            .group_name
            .as_ref()
            .map(|name| name.trim().to_owned())
            .unwrap_or_else(|| ctx.default_name())
    }

    async fn resolve(
        &self,
        ctx: &HandlerContext,
        props: &ScalingGroupProperties,
    ) -> Result<DesiredGroup, HandlerError> {
        let group_name = Self::group_name(ctx, props);
        let template_name = props
            .launch_template_name
            .as_ref()
            .map(|name| name.trim().to_owned())
            .unwrap_or_else(|| default_template_name(&group_name));
        let image_id = match &props.image_id {
            Some(image) => image.clone(),
            None => ctx
                .client
                .latest_image(props.architecture)
                .await
                .step(|| format!("look up latest {} image", props.architecture))?,
        };
        let instance_types = props.resolved_instance_types();
        let mut tags = BTreeMap::new();
        tags.insert(LOGICAL_ID_TAG.to_owned(), ctx.logical_id.clone());
        tags.insert(GROUP_TAG.to_owned(), group_name.clone());

        Ok(DesiredGroup {
            template_data: LaunchTemplateData {
                image_id,
                instance_type: instance_types.first().cloned().unwrap_or_default(),
                security_group_ids: props.security_groups(),
                instance_profile_name: props.instance_profile_name.clone(),
                key_name: props.key_pair_name.clone(),
                user_data: props.user_data.clone(),
                tags: tags.clone(),
            },
            group_name,
            template_name,
            instance_types,
            min_size: props.min_size,
            max_size: props.max_size,
            desired_capacity: props.desired(),
            subnet_ids: props.subnets(),
            distribution: InstancesDistribution {
                on_demand_base_capacity: props.on_demand_base_capacity,
                on_demand_percentage_above_base: props.on_demand_percentage.min(100) as u8,
                spot_allocation_strategy: props.spot_allocation_strategy.clone(),
            },
            health_check_grace_period: props.health_check_grace_period,
            target_cpu: props.target_cpu_utilization,
            tags,
        })
    }

    /// Live group, refusing to act on one that is still being deleted.
    async fn live_group(
        &self,
        ctx: &HandlerContext,
        name: &str,
    ) -> Result<Option<ScalingGroup>, HandlerError> {
        let group = ctx
            .client
            .describe_scaling_group(name)
            .await
            .step(|| format!("describe scaling group {name}"))?;
        match group {
            Some(group) if group.is_deleting() => Err(HandlerError::Conflict(format!(
                "scaling group {name} is still being deleted"
            ))),
            other => Ok(other),
        }
    }

    async fn create_or_reconcile(
        &self,
        ctx: &mut HandlerContext,
        desired: &DesiredGroup,
    ) -> Result<Provisioned, HandlerError> {
        match self.live_group(ctx, &desired.group_name).await? {
            Some(existing) => {
                crorch_info!(
                    context = ctx.log_context(),
                    "scaling group {} already exists, reconciling",
                    desired.group_name
                );
                self.reconcile(ctx, desired, existing).await
            }
            None => self.provision(ctx, desired).await,
        }
    }

    async fn provision(
        &self,
        ctx: &mut HandlerContext,
        desired: &DesiredGroup,
    ) -> Result<Provisioned, HandlerError> {
        let template = self.ensure_template(ctx, desired).await?;
        match self.provision_group(ctx, desired, &template).await {
            Ok(provisioned) => Ok(provisioned),
            Err(err) => {
                crorch_warn!(
                    context = ctx.log_context(),
                    "provisioning scaling group {} failed, rolling back: {err}",
                    desired.group_name
                );
                self.rollback(ctx).await;
                Err(err)
            }
        }
    }

    async fn provision_group(
        &self,
        ctx: &mut HandlerContext,
        desired: &DesiredGroup,
        template: &LaunchTemplate,
    ) -> Result<Provisioned, HandlerError> {
        let name = &desired.group_name;
        match ctx.client.create_scaling_group(&desired.spec(template.latest_ref())).await {
            Ok(()) => ctx.store.record_created(SubResourceKind::ScalingGroup, name),
            // An earlier attempt of this call may have landed.
            Err(err) if err.is_already_exists() => {
                ctx.store.record_adopted(SubResourceKind::ScalingGroup, name)
            }
            Err(err) => {
                return Err(err).step(|| format!("create scaling group {name}"));
            }
        }

        let policy_arn = match desired.target_cpu {
            Some(target) => Some(self.put_policy(ctx, desired, target).await?),
            None => None,
        };

        let group = self.live_group(ctx, name).await?.ok_or_else(|| {
            HandlerError::Conflict(format!("scaling group {name} vanished after creation"))
        })?;
        Ok(self.provisioned(ctx, &group, &template.name, policy_arn))
    }

    async fn ensure_template(
        &self,
        ctx: &mut HandlerContext,
        desired: &DesiredGroup,
    ) -> Result<LaunchTemplate, HandlerError> {
        if let Some(existing) = self.find_template(ctx, &desired.template_name).await? {
            ctx.store
                .record_adopted(SubResourceKind::LaunchTemplate, &existing.id);
            return self.refresh_template(ctx, existing, &desired.template_data).await;
        }

        let created = ctx
            .client
            .create_launch_template(&desired.template_name, &desired.template_data)
            .await;
        match created {
            Ok(template) => {
                ctx.store
                    .record_created(SubResourceKind::LaunchTemplate, &template.id);
                ctx.store.snapshot(SubResourceKind::LaunchTemplate, &template);
                crorch_info!(
                    context = ctx.log_context(),
                    "created launch template {} ({})",
                    template.name,
                    template.id
                );
                Ok(template)
            }
            Err(err) if err.is_already_exists() => {
                let existing = self
                    .find_template(ctx, &desired.template_name)
                    .await?
                    .ok_or_else(|| {
                        HandlerError::Conflict(format!(
                            "launch template {} reported as existing but not found",
                            desired.template_name
                        ))
                    })?;
                ctx.store
                    .record_adopted(SubResourceKind::LaunchTemplate, &existing.id);
                self.refresh_template(ctx, existing, &desired.template_data).await
            }
            Err(err) => {
                Err(err).step(|| format!("create launch template {}", desired.template_name))
            }
        }
    }

    async fn find_template(
        &self,
        ctx: &HandlerContext,
        name: &str,
    ) -> Result<Option<LaunchTemplate>, HandlerError> {
        ctx.client
            .describe_launch_template(&TemplateSelector::Name(name.to_owned()))
            .await
            .step(|| format!("describe launch template {name}"))
    }

    /// New template version when the immutable launch data changed.
    async fn refresh_template(
        &self,
        ctx: &mut HandlerContext,
        template: LaunchTemplate,
        data: &LaunchTemplateData,
    ) -> Result<LaunchTemplate, HandlerError> {
        if template.latest_data == *data {
            return Ok(template);
        }
        let version = ctx
            .client
            .create_launch_template_version(&template.id, data)
            .await
            .step(|| format!("create version of launch template {}", template.name))?;
        crorch_info!(
            context = ctx.log_context(),
            "launch template {} advanced to version {version}",
            template.name
        );
        let refreshed = LaunchTemplate {
            latest_version: version,
            latest_data: data.clone(),
            ..template
        };
        ctx.store
            .snapshot(SubResourceKind::LaunchTemplate, &refreshed);
        Ok(refreshed)
    }

    async fn put_policy(
        &self,
        ctx: &mut HandlerContext,
        desired: &DesiredGroup,
        target: f64,
    ) -> Result<String, HandlerError> {
        let spec = TargetTrackingPolicySpec {
            group_name: desired.group_name.clone(),
            policy_name: policy_name(&desired.group_name),
            target_value: target,
        };
        let policy = ctx
            .client
            .put_scaling_policy(&spec)
            .await
            .step(|| format!("put scaling policy {}", spec.policy_name))?;
        ctx.store
            .record_created(SubResourceKind::ScalingPolicy, &policy.policy_name);
        Ok(policy.arn)
    }

    async fn reconcile(
        &self,
        ctx: &mut HandlerContext,
        desired: &DesiredGroup,
        existing: ScalingGroup,
    ) -> Result<Provisioned, HandlerError> {
        ctx.store
            .record_adopted(SubResourceKind::ScalingGroup, &existing.name);
        ctx.store.snapshot(SubResourceKind::ScalingGroup, &existing);

        let current_id = existing.mixed_instances.launch_template.id.clone();
        let current = ctx
            .client
            .describe_launch_template(&TemplateSelector::Id(current_id.clone()))
            .await
            .step(|| format!("describe launch template {current_id}"))?;
        let mut superseded = None;
        let template = match current {
            Some(template) if template.name == desired.template_name => {
                ctx.store
                    .record_adopted(SubResourceKind::LaunchTemplate, &template.id);
                self.refresh_template(ctx, template, &desired.template_data)
                    .await?
            }
            Some(template) => {
                crorch_info!(
                    context = ctx.log_context(),
                    "launch template renamed from {} to {}",
                    template.name,
                    desired.template_name
                );
                superseded = Some(template);
                self.ensure_template(ctx, desired).await?
            }
            None => self.ensure_template(ctx, desired).await?,
        };

        let update = desired.diff(&existing, template.latest_ref());
        if !update.is_empty() {
            let updated = ctx
                .client
                .update_scaling_group(&update)
                .await
                .step(|| format!("update scaling group {}", existing.name));
            if let Err(err) = updated {
                // Only a template created for a rename is undone here.
                if superseded.is_some() {
                    self.rollback(ctx).await;
                }
                return Err(err);
            }
            crorch_info!(
                context = ctx.log_context(),
                "updated scaling group {} in place",
                existing.name
            );
        }

        if let Some(old) = superseded {
            self.remove_superseded_template(ctx, &old, &existing.name).await;
        }

        let policy_arn = self.reconcile_policy(ctx, desired).await?;
        let group = self.live_group(ctx, &existing.name).await?.ok_or_else(|| {
            HandlerError::Conflict(format!("scaling group {} vanished during update", existing.name))
        })?;
        Ok(self.provisioned(ctx, &group, &template.name, policy_arn))
    }

    async fn reconcile_policy(
        &self,
        ctx: &mut HandlerContext,
        desired: &DesiredGroup,
    ) -> Result<Option<String>, HandlerError> {
        let name = policy_name(&desired.group_name);
        let existing = ctx
            .client
            .describe_scaling_policies(&desired.group_name)
            .await
            .step(|| format!("describe scaling policies of {}", desired.group_name))?
            .into_iter()
            .find(|policy| policy.policy_name == name);

        match (desired.target_cpu, existing) {
            (Some(target), Some(policy)) if (policy.target_value - target).abs() < f64::EPSILON => {
                Ok(Some(policy.arn))
            }
            (Some(target), _) => self.put_policy(ctx, desired, target).await.map(Some),
            (None, Some(policy)) => {
                tolerate_missing(
                    ctx.client
                        .delete_scaling_policy(&desired.group_name, &policy.policy_name)
                        .await,
                )
                .step(|| format!("delete scaling policy {}", policy.policy_name))?;
                Ok(None)
            }
            (None, None) => Ok(None),
        }
    }

    /// Delete a template the group no longer uses, if this group owns it.
    async fn remove_superseded_template(
        &self,
        ctx: &HandlerContext,
        template: &LaunchTemplate,
        group_name: &str,
    ) {
        if !owned_by(template, group_name) {
            crorch_info!(
                context = ctx.log_context(),
                "keeping launch template {}: not owned by {group_name}",
                template.name
            );
            return;
        }
        let removed = tolerate_missing(ctx.client.delete_launch_template(&template.id).await)
            .step(|| format!("delete launch template {}", template.name));
        if let Err(err) = removed {
            crorch_warn!(
                context = ctx.log_context(),
                "superseded launch template {} was not removed: {err}",
                template.name
            );
        }
    }

    /// Template of a group that no longer exists, e.g. after a delete that
    /// removed the group and then ran out of time.
    async fn orphaned_template(
        &self,
        ctx: &HandlerContext,
        group_name: &str,
        props: Option<&ScalingGroupProperties>,
    ) -> Result<Option<String>, HandlerError> {
        let default_name = default_template_name(group_name);
        if let Some(template) = self.find_template(ctx, &default_name).await? {
            return Ok(Some(template.id));
        }
        let custom = props
            .and_then(|props| props.launch_template_name.as_deref())
            .map(str::trim)
            .filter(|name| !name.is_empty() && *name != default_name);
        let Some(custom) = custom else {
            return Ok(None);
        };
        match self.find_template(ctx, custom).await? {
            Some(template) if owned_by(&template, group_name) => Ok(Some(template.id)),
            Some(_) => {
                crorch_info!(
                    context = ctx.log_context(),
                    "launch template {custom} belongs to another group, leaving it"
                );
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Policies, scale to zero, forced delete, then wait for the group to vanish.
    async fn remove_group(&self, ctx: &HandlerContext, name: &str) -> Result<(), HandlerError> {
        let current = ctx
            .client
            .describe_scaling_group(name)
            .await
            .step(|| format!("describe scaling group {name}"))?;
        let Some(group) = current else {
            return Ok(());
        };

        if !group.is_deleting() {
            let policies = ctx
                .client
                .describe_scaling_policies(name)
                .await
                .step(|| format!("describe scaling policies of {name}"))?;
            for policy in policies {
                tolerate_missing(
                    ctx.client
                        .delete_scaling_policy(name, &policy.policy_name)
                        .await,
                )
                .step(|| format!("delete scaling policy {}", policy.policy_name))?;
            }

            if group.min_size > 0 || group.desired_capacity > 0 {
                let mut drain = ScalingGroupUpdate::new(name);
                drain.min_size = Some(0);
                drain.desired_capacity = Some(0);
                tolerate_missing(ctx.client.update_scaling_group(&drain).await)
                    .step(|| format!("scale scaling group {name} to zero"))?;
            }

            tolerate_missing(ctx.client.delete_scaling_group(name, true).await)
                .step(|| format!("delete scaling group {name}"))?;
        }

        let client = &ctx.client;
        wait_until(
            ctx.wait,
            ctx.deadline(),
            &format!("scaling group {name} to be deleted"),
            || async move {
                client
                    .describe_scaling_group(name)
                    .await
                    .map(|group| group.is_none())
                    .step(|| format!("describe scaling group {name}"))
            },
        )
        .await?;
        Ok(())
    }

    /// Remove what this invocation created, newest first. Failures are logged.
    async fn rollback(&self, ctx: &mut HandlerContext) {
        for resource in ctx.store.created_newest_first() {
            let outcome = match resource.kind {
                SubResourceKind::ScalingGroup => self.remove_group(ctx, &resource.id).await,
                SubResourceKind::LaunchTemplate => {
                    tolerate_missing(ctx.client.delete_launch_template(&resource.id).await)
                        .step(|| format!("delete launch template {}", resource.id))
                }
                // Policies go with their group.
                _ => Ok(()),
            };
            match outcome {
                Ok(()) => ctx.store.forget(resource.kind, &resource.id),
                Err(err) => crorch_warn!(
                    context = ctx.log_context(),
                    "rollback left {} {} behind: {err}",
                    resource.kind,
                    resource.id
                ),
            }
        }
    }

    fn provisioned(
        &self,
        ctx: &mut HandlerContext,
        group: &ScalingGroup,
        template_name: &str,
        policy_arn: Option<String>,
    ) -> Provisioned {
        let template = &group.mixed_instances.launch_template;
        let mut data = Map::new();
        data.insert("groupName".into(), json!(group.name));
        data.insert("groupArn".into(), json!(group.arn));
        data.insert("launchTemplateId".into(), json!(template.id));
        data.insert("launchTemplateName".into(), json!(template_name));
        data.insert(
            "launchTemplateVersion".into(),
            json!(template.version.to_string()),
        );
        if let Some(arn) = policy_arn {
            data.insert("scalingPolicyArn".into(), json!(arn));
        }
        ctx.store.set_physical_id(&group.name);
        Provisioned::new(group.name.clone(), data)
    }
}

fn owned_by(template: &LaunchTemplate, group_name: &str) -> bool {
    template
        .latest_data
        .tags
        .get(GROUP_TAG)
        .is_some_and(|owner| owner == group_name)
}

#[async_trait]
impl ResourceHandler for ScalingGroupHandler {
    type Properties = ScalingGroupProperties;

    fn kind(&self) -> ResourceKind {
        ResourceKind::ScalingGroup
    }

    async fn create(
        &self,
        ctx: &mut HandlerContext,
        props: &ScalingGroupProperties,
    ) -> Result<Provisioned, HandlerError> {
        let desired = self.resolve(ctx, props).await?;
        self.create_or_reconcile(ctx, &desired).await
    }

    fn planned_physical_id(
        &self,
        ctx: &HandlerContext,
        props: &ScalingGroupProperties,
    ) -> Option<String> {
        Some(Self::group_name(ctx, props))
    }

    async fn update(
        &self,
        ctx: &mut HandlerContext,
        physical_id: &str,
        props: &ScalingGroupProperties,
    ) -> Result<Provisioned, HandlerError> {
        let desired = self.resolve(ctx, props).await?;

        if desired.group_name != physical_id {
            crorch_info!(
                context = ctx.log_context(),
                "group name changed from {physical_id} to {}, replacing",
                desired.group_name
            );
            let replacement = self.create_or_reconcile(ctx, &desired).await?;
            if let Err(err) = self.delete(ctx, physical_id, None).await {
                crorch_warn!(
                    context = ctx.log_context(),
                    "superseded scaling group {physical_id} was not removed: {err}"
                );
            }
            return Ok(replacement);
        }

        match self.live_group(ctx, physical_id).await? {
            Some(existing) => self.reconcile(ctx, &desired, existing).await,
            None => {
                crorch_info!(
                    context = ctx.log_context(),
                    "scaling group {physical_id} not found, creating it"
                );
                self.provision(ctx, &desired).await
            }
        }
    }

    async fn delete(
        &self,
        ctx: &mut HandlerContext,
        physical_id: &str,
        props: Option<&ScalingGroupProperties>,
    ) -> Result<(), HandlerError> {
        let current = ctx
            .client
            .describe_scaling_group(physical_id)
            .await
            .step(|| format!("describe scaling group {physical_id}"))?;
        let template_id = match &current {
            Some(group) => Some(group.mixed_instances.launch_template.id.clone()),
            None => self.orphaned_template(ctx, physical_id, props).await?,
        };
        if current.is_none() && template_id.is_none() {
            crorch_info!(
                context = ctx.log_context(),
                "scaling group {physical_id} does not exist, nothing to delete"
            );
            return Ok(());
        }

        self.remove_group(ctx, physical_id).await?;
        if let Some(id) = template_id {
            tolerate_missing(ctx.client.delete_launch_template(&id).await)
                .step(|| format!("delete launch template {id}"))?;
        }
        crorch_info!(
            context = ctx.log_context(),
            "scaling group {physical_id} deleted"
        );
        Ok(())
    }
}
