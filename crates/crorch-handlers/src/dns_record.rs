//! ---
//! crorch_section: "01-core-functionality"
//! crorch_subsection: "module"
//! crorch_type: "source"
//! crorch_scope: "code"
//! crorch_description: "DNS alias record lifecycle."
//! crorch_version: "v0.1.0"
//! crorch_owner: "platform"
//! ---
use async_trait::async_trait;
use crorch_logging::{crorch_info, crorch_warn};
use crorch_provider::model::{fqdn, AliasRecord, RecordType};
use serde_json::{json, Map};

use crate::context::HandlerContext;
use crate::error::{tolerate_missing, HandlerError, StepExt};
use crate::properties::{DnsRecordProperties, ResourceKind};
use crate::state::SubResourceKind;
use crate::{Provisioned, ResourceHandler};

/// `<zone>/<name>/<type>` → parts, or `None` for foreign ids.
pub fn parse_physical_id(id: &str) -> Option<(String, String, RecordType)> {
    let mut parts = id.split('/');
    let zone = parts.next().filter(|z| !z.is_empty())?;
    let name = parts.next().filter(|n| !n.is_empty())?;
    let record_type = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((zone.to_owned(), name.to_owned(), record_type))
}

fn desired_record(props: &DnsRecordProperties) -> AliasRecord {
    AliasRecord {
        hosted_zone_id: props.hosted_zone_id.trim().to_owned(),
        name: fqdn(&props.record_name),
        record_type: props.record_type,
        target_dns_name: props.target_dns_name.trim().to_owned(),
        target_hosted_zone_id: props.target_hosted_zone_id.trim().to_owned(),
        evaluate_target_health: props.evaluate_target_health,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DnsRecordHandler;

impl DnsRecordHandler {
    pub fn new() -> Self {
        Self
    }

    async fn upsert(
        &self,
        ctx: &mut HandlerContext,
        record: &AliasRecord,
    ) -> Result<Provisioned, HandlerError> {
        ctx.client
            .upsert_alias_record(record)
            .await
            .step(|| format!("upsert alias record {}", record.name))?;
        ctx.store
            .record_created(SubResourceKind::AliasRecord, record.identity());
        crorch_info!(
            context = ctx.log_context(),
            "alias record {} {} points at {}",
            record.name,
            record.record_type,
            record.target_dns_name
        );

        let mut data = Map::new();
        data.insert("fqdn".into(), json!(record.name));
        data.insert("hostedZoneId".into(), json!(record.hosted_zone_id));
        data.insert("recordType".into(), json!(record.record_type.as_str()));
        ctx.store.set_physical_id(record.identity());
        Ok(Provisioned::new(record.identity(), data))
    }
}

#[async_trait]
impl ResourceHandler for DnsRecordHandler {
    type Properties = DnsRecordProperties;

    fn kind(&self) -> ResourceKind {
        ResourceKind::DnsRecord
    }

    async fn create(
        &self,
        ctx: &mut HandlerContext,
        props: &DnsRecordProperties,
    ) -> Result<Provisioned, HandlerError> {
        self.upsert(ctx, &desired_record(props)).await
    }

    fn planned_physical_id(&self, _ctx: &HandlerContext, props: &DnsRecordProperties) -> Option<String> {
        Some(desired_record(props).identity())
    }

    async fn update(
        &self,
        ctx: &mut HandlerContext,
        physical_id: &str,
        props: &DnsRecordProperties,
    ) -> Result<Provisioned, HandlerError> {
        let record = desired_record(props);
        let provisioned = self.upsert(ctx, &record).await?;
        if record.identity() != physical_id {
            if let Err(err) = self.delete(ctx, physical_id, None).await {
                crorch_warn!(
                    context = ctx.log_context(),
                    "superseded alias record {physical_id} was not removed: {err}"
                );
            }
        }
        Ok(provisioned)
    }

    async fn delete(
        &self,
        ctx: &mut HandlerContext,
        physical_id: &str,
        _props: Option<&DnsRecordProperties>,
    ) -> Result<(), HandlerError> {
        let Some((zone, name, record_type)) = parse_physical_id(physical_id) else {
            crorch_info!(
                context = ctx.log_context(),
                "{physical_id} is not an alias record id, nothing to delete"
            );
            return Ok(());
        };
        let existing = match ctx.client.get_alias_record(&zone, &name, record_type).await {
            Ok(existing) => existing,
            // The zone itself is gone.
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err).step(|| format!("read alias record {name}")),
        };
        let Some(record) = existing else {
            crorch_info!(
                context = ctx.log_context(),
                "alias record {physical_id} does not exist, nothing to delete"
            );
            return Ok(());
        };
        tolerate_missing(ctx.client.delete_alias_record(&record).await)
            .step(|| format!("delete alias record {name}"))?;
        crorch_info!(context = ctx.log_context(), "deleted alias record {physical_id}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn physical_ids_carry_zone_name_and_type() {
        assert_eq!(
            parse_physical_id("Z123/api.example.com./AAAA"),
            Some(("Z123".into(), "api.example.com.".into(), RecordType::Aaaa))
        );
        assert_eq!(parse_physical_id("failed-Api-req-1"), None);
        assert_eq!(parse_physical_id("Z123/api.example.com./MX"), None);
    }

    #[test]
    fn record_names_are_normalised() {
        let props = DnsRecordProperties {
            hosted_zone_id: "Z123".into(),
            record_name: "API.Example.com".into(),
            record_type: RecordType::A,
            target_dns_name: "lb-1.elb.amazonaws.com".into(),
            target_hosted_zone_id: "Z35SXDOTRQ7X7K".into(),
            evaluate_target_health: true,
        };
        let record = desired_record(&props);
        assert_eq!(record.identity(), "Z123/api.example.com./A");
    }
}
