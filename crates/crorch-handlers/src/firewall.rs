//! ---
//! crorch_section: "01-core-functionality"
//! crorch_subsection: "module"
//! crorch_type: "source"
//! crorch_scope: "code"
//! crorch_description: "Web ACL, IP set and association lifecycle."
//! crorch_version: "v0.1.0"
//! crorch_owner: "platform"
//! ---
//! Firewall handler.
//!
//! A firewall is one web ACL plus one IP set named `<acl>-ipset`. The IP rule
//! is evaluated first (priority 0); selected managed rule groups follow in a
//! fixed order with dense priorities from 1. The physical id is
//! `<SCOPE>/<acl name>`.

use async_trait::async_trait;
use crorch_logging::{crorch_info, crorch_warn};
use crorch_provider::model::{
    IpSetSpec, ResourceSummary, RuleStatement, WafAction, WafScope, WebAclRule, WebAclSpec,
};
use serde_json::{json, Map};

use crate::context::HandlerContext;
use crate::error::{tolerate_missing, HandlerError, StepExt};
use crate::properties::{FirewallProperties, ManagedRuleGroup, ResourceKind};
use crate::state::SubResourceKind;
use crate::{Provisioned, ResourceHandler};

pub const IP_RULE_NAME: &str = "ip-set-rule";
const MANAGED_RULE_VENDOR: &str = "AWS";

pub fn physical_id(scope: WafScope, name: &str) -> String {
    format!("{scope}/{name}")
}

/// Split `<SCOPE>/<name>`; anything else is not a firewall id.
pub fn parse_physical_id(id: &str) -> Option<(WafScope, String)> {
    let (scope, name) = id.split_once('/')?;
    let scope = scope.parse().ok()?;
    if name.is_empty() || name.contains('/') {
        return None;
    }
    Some((scope, name.to_owned()))
}

pub fn ip_set_name(acl_name: &str) -> String {
    format!("{acl_name}-ipset")
}

fn same_addresses(left: &[String], right: &[String]) -> bool {
    let mut left = left.to_vec();
    let mut right = right.to_vec();
    left.sort();
    right.sort();
    left == right
}

#[derive(Debug, Clone)]
struct DesiredFirewall {
    name: String,
    scope: WafScope,
    ip_set_name: String,
    description: Option<String>,
    default_action: WafAction,
    ip_action: WafAction,
    addresses: Vec<String>,
    rule_groups: Vec<ManagedRuleGroup>,
    associated_resource_arn: Option<String>,
}

impl DesiredFirewall {
    fn rules(&self, ip_set_arn: &str) -> Vec<WebAclRule> {
        let mut rules = vec![WebAclRule {
            name: IP_RULE_NAME.to_owned(),
            priority: 0,
            statement: RuleStatement::IpSetReference {
                arn: ip_set_arn.to_owned(),
            },
            action: Some(self.ip_action),
        }];
        rules.extend(self.rule_groups.iter().zip(1u32..).map(|(group, priority)| {
            WebAclRule {
                name: group.vendor_name(),
                priority,
                statement: RuleStatement::ManagedRuleGroup {
                    vendor: MANAGED_RULE_VENDOR.to_owned(),
                    name: group.vendor_name(),
                },
                action: None,
            }
        }));
        rules
    }
}

/// IP set in use, and its addresses before this invocation changed them.
#[derive(Debug, Clone)]
struct IpSetState {
    id: String,
    arn: String,
    previous: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FirewallHandler;

impl FirewallHandler {
    pub fn new() -> Self {
        Self
    }

    fn resolve(&self, ctx: &HandlerContext, props: &FirewallProperties) -> DesiredFirewall {
        let name = props
            .name
            .as_ref()
            .map(|name| name.trim().to_owned())
            .unwrap_or_else(|| ctx.default_name());
        DesiredFirewall {
            ip_set_name: ip_set_name(&name),
            name,
            scope: props.scope,
            description: props.description.clone(),
            default_action: props.default_action,
            ip_action: props.ip_rule_action(),
            addresses: props.normalised_cidrs(),
            rule_groups: props.ordered_rule_groups(),
            associated_resource_arn: props.associated_resource_arn.clone(),
        }
    }

    async fn find_acl(
        &self,
        ctx: &HandlerContext,
        scope: WafScope,
        name: &str,
    ) -> Result<Option<ResourceSummary>, HandlerError> {
        ctx.client
            .find_web_acl(scope, name)
            .await
            .step(|| format!("look up web ACL {name}"))
    }

    async fn create_or_reconcile(
        &self,
        ctx: &mut HandlerContext,
        desired: &DesiredFirewall,
    ) -> Result<Provisioned, HandlerError> {
        match self.find_acl(ctx, desired.scope, &desired.name).await? {
            Some(existing) => {
                crorch_info!(
                    context = ctx.log_context(),
                    "web ACL {} already exists, reconciling",
                    desired.name
                );
                self.reconcile(ctx, desired, &existing.id).await
            }
            None => self.provision(ctx, desired).await,
        }
    }

    async fn provision(
        &self,
        ctx: &mut HandlerContext,
        desired: &DesiredFirewall,
    ) -> Result<Provisioned, HandlerError> {
        let ip_set = self.ensure_ip_set(ctx, desired).await?;

        let spec = WebAclSpec {
            name: desired.name.clone(),
            scope: desired.scope,
            description: desired.description.clone(),
            default_action: desired.default_action,
            rules: desired.rules(&ip_set.arn),
        };
        let acl = match ctx.client.create_web_acl(&spec).await {
            Ok(acl) => acl,
            Err(err) if err.is_already_exists() => {
                if let Some(existing) = self.find_acl(ctx, desired.scope, &desired.name).await? {
                    return self.reconcile(ctx, desired, &existing.id).await;
                }
                self.rollback(ctx, desired.scope).await;
                return Err(err).step(|| format!("create web ACL {}", desired.name));
            }
            Err(err) => {
                crorch_warn!(
                    context = ctx.log_context(),
                    "web ACL {} creation failed, rolling back: {err}",
                    desired.name
                );
                self.rollback(ctx, desired.scope).await;
                return Err(err).step(|| format!("create web ACL {}", desired.name));
            }
        };
        ctx.store.record_created(SubResourceKind::WebAcl, &acl.id);
        crorch_info!(
            context = ctx.log_context(),
            "created web ACL {} ({})",
            acl.name,
            acl.id
        );

        if let Some(resource) = &desired.associated_resource_arn {
            if let Err(err) = ctx.client.associate_web_acl(&acl.arn, resource).await {
                self.rollback(ctx, desired.scope).await;
                return Err(err).step(|| format!("associate web ACL {} with {resource}", acl.name));
            }
            ctx.store.record_created(SubResourceKind::Association, resource);
        }

        Ok(self.provisioned(ctx, desired, &acl, &ip_set))
    }

    async fn ensure_ip_set(
        &self,
        ctx: &mut HandlerContext,
        desired: &DesiredFirewall,
    ) -> Result<IpSetState, HandlerError> {
        let scope = desired.scope;
        let name = &desired.ip_set_name;
        let found = ctx
            .client
            .find_ip_set(scope, name)
            .await
            .step(|| format!("look up IP set {name}"))?;

        if let Some(summary) = found {
            ctx.store.record_adopted(SubResourceKind::IpSet, &summary.id);
            let current = ctx
                .client
                .get_ip_set(scope, &summary.id)
                .await
                .step(|| format!("get IP set {name}"))?;
            ctx.store.snapshot(SubResourceKind::IpSet, &current);
            if same_addresses(&current.addresses, &desired.addresses) {
                return Ok(IpSetState {
                    id: current.id,
                    arn: current.arn,
                    previous: None,
                });
            }
            ctx.client
                .replace_ip_set_addresses(scope, &current.id, &desired.addresses)
                .await
                .step(|| format!("update IP set {name}"))?;
            crorch_info!(
                context = ctx.log_context(),
                "replaced addresses of IP set {name}"
            );
            return Ok(IpSetState {
                id: current.id,
                arn: current.arn,
                previous: Some(current.addresses),
            });
        }

        let created = ctx
            .client
            .create_ip_set(&IpSetSpec {
                name: name.clone(),
                scope,
                description: desired.description.clone(),
                addresses: desired.addresses.clone(),
            })
            .await
            .step(|| format!("create IP set {name}"))?;
        ctx.store.record_created(SubResourceKind::IpSet, &created.id);
        Ok(IpSetState {
            id: created.id,
            arn: created.arn,
            previous: None,
        })
    }

    async fn reconcile(
        &self,
        ctx: &mut HandlerContext,
        desired: &DesiredFirewall,
        acl_id: &str,
    ) -> Result<Provisioned, HandlerError> {
        let scope = desired.scope;
        let acl = ctx
            .client
            .get_web_acl(scope, acl_id)
            .await
            .step(|| format!("get web ACL {}", desired.name))?;
        ctx.store.record_adopted(SubResourceKind::WebAcl, &acl.id);
        ctx.store.snapshot(SubResourceKind::WebAcl, &acl);

        let ip_set = self.ensure_ip_set(ctx, desired).await?;
        let rules = desired.rules(&ip_set.arn);
        if acl.rules != rules || acl.default_action != desired.default_action {
            let updated = ctx
                .client
                .replace_web_acl_rules(scope, &acl.id, desired.default_action, &rules)
                .await;
            if let Err(err) = updated {
                crorch_warn!(
                    context = ctx.log_context(),
                    "web ACL {} update failed, restoring IP set: {err}",
                    acl.name
                );
                self.restore_ip_set(ctx, scope, &ip_set).await;
                return Err(err).step(|| format!("update web ACL {}", acl.name));
            }
            crorch_info!(
                context = ctx.log_context(),
                "updated rules of web ACL {}",
                acl.name
            );
        }

        self.reconcile_association(ctx, &acl.arn, desired.associated_resource_arn.as_deref())
            .await?;

        let summary = ResourceSummary {
            id: acl.id,
            name: acl.name,
            arn: acl.arn,
            lock_token: acl.lock_token,
        };
        Ok(self.provisioned(ctx, desired, &summary, &ip_set))
    }

    async fn reconcile_association(
        &self,
        ctx: &mut HandlerContext,
        acl_arn: &str,
        wanted: Option<&str>,
    ) -> Result<(), HandlerError> {
        let attached = ctx
            .client
            .list_resources_for_web_acl(acl_arn)
            .await
            .step(|| format!("list resources of web ACL {acl_arn}"))?;
        for resource in attached.iter().filter(|r| Some(r.as_str()) != wanted) {
            tolerate_missing(ctx.client.disassociate_web_acl(resource).await)
                .step(|| format!("disassociate {resource}"))?;
        }
        if let Some(target) = wanted {
            if !attached.iter().any(|r| r == target) {
                ctx.client
                    .associate_web_acl(acl_arn, target)
                    .await
                    .step(|| format!("associate web ACL with {target}"))?;
                ctx.store.record_created(SubResourceKind::Association, target);
            }
        }
        Ok(())
    }

    /// Undo an IP set change after the ACL refused the new rules.
    async fn restore_ip_set(&self, ctx: &mut HandlerContext, scope: WafScope, ip_set: &IpSetState) {
        let outcome = match &ip_set.previous {
            Some(previous) => ctx
                .client
                .replace_ip_set_addresses(scope, &ip_set.id, previous)
                .await
                .step(|| format!("restore IP set {}", ip_set.id)),
            None if ctx.store.was_created(SubResourceKind::IpSet, &ip_set.id) => {
                let deleted = tolerate_missing(ctx.client.delete_ip_set(scope, &ip_set.id).await)
                    .step(|| format!("delete IP set {}", ip_set.id));
                if deleted.is_ok() {
                    ctx.store.forget(SubResourceKind::IpSet, &ip_set.id);
                }
                deleted
            }
            None => Ok(()),
        };
        if let Err(err) = outcome {
            crorch_warn!(context = ctx.log_context(), "{err}");
        }
    }

    /// Remove what this invocation created, newest first. Failures are logged.
    async fn rollback(&self, ctx: &mut HandlerContext, scope: WafScope) {
        for resource in ctx.store.created_newest_first() {
            let id = resource.id.as_str();
            let outcome = match resource.kind {
                SubResourceKind::Association => {
                    tolerate_missing(ctx.client.disassociate_web_acl(id).await)
                        .step(|| format!("disassociate {id}"))
                }
                SubResourceKind::WebAcl => {
                    tolerate_missing(ctx.client.delete_web_acl(scope, id).await)
                        .step(|| format!("delete web ACL {id}"))
                }
                SubResourceKind::IpSet => {
                    tolerate_missing(ctx.client.delete_ip_set(scope, id).await)
                        .step(|| format!("delete IP set {id}"))
                }
                _ => Ok(()),
            };
            match outcome {
                Ok(()) => ctx.store.forget(resource.kind, id),
                Err(err) => crorch_warn!(
                    context = ctx.log_context(),
                    "rollback left {} {id} behind: {err}",
                    resource.kind
                ),
            }
        }
    }

    fn provisioned(
        &self,
        ctx: &mut HandlerContext,
        desired: &DesiredFirewall,
        acl: &ResourceSummary,
        ip_set: &IpSetState,
    ) -> Provisioned {
        let mut data = Map::new();
        data.insert("webAclId".into(), json!(acl.id));
        data.insert("webAclArn".into(), json!(acl.arn));
        data.insert("webAclName".into(), json!(acl.name));
        data.insert("ipSetId".into(), json!(ip_set.id));
        data.insert("ipSetArn".into(), json!(ip_set.arn));
        data.insert("scope".into(), json!(desired.scope.as_str()));
        let id = physical_id(desired.scope, &acl.name);
        ctx.store.set_physical_id(&id);
        Provisioned::new(id, data)
    }
}

#[async_trait]
impl ResourceHandler for FirewallHandler {
    type Properties = FirewallProperties;

    fn kind(&self) -> ResourceKind {
        ResourceKind::Firewall
    }

    async fn create(
        &self,
        ctx: &mut HandlerContext,
        props: &FirewallProperties,
    ) -> Result<Provisioned, HandlerError> {
        let desired = self.resolve(ctx, props);
        self.create_or_reconcile(ctx, &desired).await
    }

    fn planned_physical_id(&self, ctx: &HandlerContext, props: &FirewallProperties) -> Option<String> {
        let desired = self.resolve(ctx, props);
        Some(physical_id(desired.scope, &desired.name))
    }

    async fn update(
        &self,
        ctx: &mut HandlerContext,
        physical_id: &str,
        props: &FirewallProperties,
    ) -> Result<Provisioned, HandlerError> {
        let desired = self.resolve(ctx, props);

        match parse_physical_id(physical_id) {
            Some((scope, name)) if scope == desired.scope && name == desired.name => {
                match self.find_acl(ctx, scope, &name).await? {
                    Some(existing) => self.reconcile(ctx, &desired, &existing.id).await,
                    None => {
                        crorch_info!(
                            context = ctx.log_context(),
                            "web ACL {physical_id} not found, creating it"
                        );
                        self.provision(ctx, &desired).await
                    }
                }
            }
            _ => {
                crorch_info!(
                    context = ctx.log_context(),
                    "firewall identity changed from {physical_id}, replacing"
                );
                let replacement = self.create_or_reconcile(ctx, &desired).await?;
                if let Err(err) = self.delete(ctx, physical_id, None).await {
                    crorch_warn!(
                        context = ctx.log_context(),
                        "superseded firewall {physical_id} was not removed: {err}"
                    );
                }
                Ok(replacement)
            }
        }
    }

    async fn delete(
        &self,
        ctx: &mut HandlerContext,
        physical_id: &str,
        _props: Option<&FirewallProperties>,
    ) -> Result<(), HandlerError> {
        let Some((scope, name)) = parse_physical_id(physical_id) else {
            crorch_info!(
                context = ctx.log_context(),
                "{physical_id} is not a firewall id, nothing to delete"
            );
            return Ok(());
        };

        if let Some(acl) = self.find_acl(ctx, scope, &name).await? {
            let attached = match ctx.client.list_resources_for_web_acl(&acl.arn).await {
                Ok(attached) => attached,
                Err(err) if err.is_not_found() => Vec::new(),
                Err(err) => {
                    return Err(err).step(|| format!("list resources of web ACL {name}"));
                }
            };
            for resource in attached {
                tolerate_missing(ctx.client.disassociate_web_acl(&resource).await)
                    .step(|| format!("disassociate {resource}"))?;
            }
            tolerate_missing(ctx.client.delete_web_acl(scope, &acl.id).await)
                .step(|| format!("delete web ACL {name}"))?;
            crorch_info!(context = ctx.log_context(), "deleted web ACL {name}");
        }

        let set_name = ip_set_name(&name);
        let set = ctx
            .client
            .find_ip_set(scope, &set_name)
            .await
            .step(|| format!("look up IP set {set_name}"))?;
        if let Some(set) = set {
            tolerate_missing(ctx.client.delete_ip_set(scope, &set.id).await)
                .step(|| format!("delete IP set {set_name}"))?;
            crorch_info!(context = ctx.log_context(), "deleted IP set {set_name}");
        }
        Ok(())
    }
}
