//! ---
//! crorch_section: "01-core-functionality"
//! crorch_subsection: "tests"
//! crorch_type: "test"
//! crorch_scope: "code"
//! crorch_description: "Handler behaviour against the simulated control plane."
//! crorch_version: "v0.1.0"
//! crorch_owner: "platform"
//! ---
use std::sync::Arc;
use std::time::Duration;

use crorch_handlers::{
    HandlerCall, HandlerContext, HandlerSet, ResourceKind, ResourceProperties,
};
use crorch_provider::model::WafScope;
use crorch_provider::{ControlPlane, Operation, ProviderClient, SimulatedControlPlane, SimulationSettings};
use crorch_resilience::{RetryPolicy, WaitConfig};
use serde_json::{json, Value};

const STACK_ID: &str =
    "arn:aws:cloudformation:us-east-1:123456789012:stack/app/0c8a7e00-0000-4000-8000-000000000001";

fn plane() -> Arc<SimulatedControlPlane> {
    Arc::new(SimulatedControlPlane::new("us-east-1"))
}

fn context(plane: &Arc<SimulatedControlPlane>, kind: ResourceKind, logical_id: &str) -> HandlerContext {
    let dyn_plane: Arc<dyn ControlPlane> = plane.clone();
    let client = ProviderClient::new(dyn_plane, RetryPolicy::no_retry());
    HandlerContext::new(client, kind, "Create", "req-1", logical_id, STACK_ID).with_wait(
        WaitConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        },
    )
}

fn props(kind: ResourceKind, value: Value) -> ResourceProperties {
    let Value::Object(map) = value else {
        panic!("properties must be an object");
    };
    ResourceProperties::parse(kind, &map).expect("valid properties")
}

fn worker_group(max_size: u32) -> ResourceProperties {
    props(
        ResourceKind::ScalingGroup,
        json!({
            "MinSize": "0",
            "MaxSize": max_size.to_string(),
            "DesiredCapacity": "0",
            "OnDemandPercentage": "100",
            "SubnetIds": ["subnet-a", "subnet-b"]
        }),
    )
}

fn edge_firewall(cidrs: &[&str]) -> ResourceProperties {
    props(
        ResourceKind::Firewall,
        json!({
            "Cidrs": cidrs,
            "DefaultAction": "ALLOW",
            "RuleGroups": ["CommonRuleSet"]
        }),
    )
}

#[tokio::test]
async fn scaling_group_create_is_idempotent() {
    let plane = plane();
    let handlers = HandlerSet::new();
    let call = HandlerCall::Create(worker_group(2));

    let mut ctx = context(&plane, ResourceKind::ScalingGroup, "WorkerGroup");
    let first = handlers.run(&mut ctx, &call).await.expect("first create");
    assert_eq!(first.physical_id, "app-workergroup");
    assert!(first.data["launchTemplateId"].as_str().is_some());
    assert_eq!(first.data["launchTemplateName"], json!("app-workergroup-lt"));

    let mut ctx = context(&plane, ResourceKind::ScalingGroup, "WorkerGroup");
    let second = handlers.run(&mut ctx, &call).await.expect("second create");
    assert_eq!(second.physical_id, first.physical_id);
    assert_eq!(plane.scaling_groups().len(), 1);
    assert_eq!(plane.launch_templates().len(), 1);
    assert_eq!(plane.count_calls(Operation::CreateScalingGroup), 1);
}

#[tokio::test]
async fn failed_group_creation_leaves_no_launch_template() {
    let plane = plane();
    plane.fail_always(
        Operation::CreateScalingGroup,
        "LimitExceeded",
        "You have reached the limit on the number of Auto Scaling groups",
    );
    let mut ctx = context(&plane, ResourceKind::ScalingGroup, "WorkerGroup");

    let err = HandlerSet::new()
        .run(&mut ctx, &HandlerCall::Create(worker_group(2)))
        .await
        .expect_err("group creation fails");
    assert!(err.to_string().contains("LimitExceeded"));
    assert!(plane.launch_templates().is_empty());
    assert!(plane.scaling_groups().is_empty());
    assert!(ctx.store.created_labels().is_empty());
}

#[tokio::test]
async fn failed_policy_rolls_back_group_then_template() {
    let plane = plane();
    plane.fail_always(Operation::PutScalingPolicy, "ValidationError", "bad metric");
    let mut ctx = context(&plane, ResourceKind::ScalingGroup, "WorkerGroup");
    let call = HandlerCall::Create(props(
        ResourceKind::ScalingGroup,
        json!({"MinSize": 1, "MaxSize": 3, "TargetCpuUtilization": "60"}),
    ));

    HandlerSet::new()
        .run(&mut ctx, &call)
        .await
        .expect_err("policy creation fails");
    assert!(plane.scaling_groups().is_empty());
    assert!(plane.launch_templates().is_empty());

    let operations = plane.operations();
    let group_deleted = operations
        .iter()
        .position(|op| *op == Operation::DeleteScalingGroup)
        .expect("group deleted");
    let template_deleted = operations
        .iter()
        .position(|op| *op == Operation::DeleteLaunchTemplate)
        .expect("template deleted");
    assert!(group_deleted < template_deleted);
}

#[tokio::test]
async fn capacity_change_updates_in_place() {
    let plane = plane();
    let handlers = HandlerSet::new();
    let mut ctx = context(&plane, ResourceKind::ScalingGroup, "WorkerGroup");
    let created = handlers
        .run(&mut ctx, &HandlerCall::Create(worker_group(2)))
        .await
        .expect("create");

    let mut ctx = context(&plane, ResourceKind::ScalingGroup, "WorkerGroup");
    let updated = handlers
        .run(
            &mut ctx,
            &HandlerCall::Update {
                physical_id: created.physical_id.clone(),
                properties: worker_group(5),
            },
        )
        .await
        .expect("update");

    assert_eq!(updated.physical_id, created.physical_id);
    assert_eq!(plane.scaling_groups()[0].max_size, 5);
    assert_eq!(plane.count_calls(Operation::CreateLaunchTemplateVersion), 0);
    assert_eq!(updated.data["launchTemplateVersion"], json!("1"));
}

#[tokio::test]
async fn image_change_creates_a_new_template_version() {
    let plane = plane();
    let handlers = HandlerSet::new();
    let mut ctx = context(&plane, ResourceKind::ScalingGroup, "WorkerGroup");
    let created = handlers
        .run(&mut ctx, &HandlerCall::Create(worker_group(2)))
        .await
        .expect("create");

    let mut ctx = context(&plane, ResourceKind::ScalingGroup, "WorkerGroup");
    let updated = handlers
        .run(
            &mut ctx,
            &HandlerCall::Update {
                physical_id: created.physical_id.clone(),
                properties: props(
                    ResourceKind::ScalingGroup,
                    json!({"MinSize": 0, "MaxSize": 2, "ImageId": "ami-custom"}),
                ),
            },
        )
        .await
        .expect("update");

    assert_eq!(updated.data["launchTemplateVersion"], json!("2"));
    let group = &plane.scaling_groups()[0];
    assert_eq!(group.mixed_instances.launch_template.version, 2);
    assert_eq!(plane.launch_templates()[0].latest_data.image_id, "ami-custom");
}

#[tokio::test]
async fn update_of_a_missing_group_creates_it() {
    let plane = plane();
    let mut ctx = context(&plane, ResourceKind::ScalingGroup, "WorkerGroup");
    let result = HandlerSet::new()
        .run(
            &mut ctx,
            &HandlerCall::Update {
                physical_id: "app-workergroup".into(),
                properties: worker_group(2),
            },
        )
        .await
        .expect("update creates");
    assert_eq!(result.physical_id, "app-workergroup");
    assert_eq!(plane.scaling_groups().len(), 1);
}

#[tokio::test]
async fn renamed_group_is_replaced() {
    let plane = plane();
    let handlers = HandlerSet::new();
    let mut ctx = context(&plane, ResourceKind::ScalingGroup, "WorkerGroup");
    let created = handlers
        .run(&mut ctx, &HandlerCall::Create(worker_group(2)))
        .await
        .expect("create");

    let mut ctx = context(&plane, ResourceKind::ScalingGroup, "WorkerGroup");
    let replaced = handlers
        .run(
            &mut ctx,
            &HandlerCall::Update {
                physical_id: created.physical_id.clone(),
                properties: props(
                    ResourceKind::ScalingGroup,
                    json!({"GroupName": "workers-v2", "MinSize": 0, "MaxSize": 2}),
                ),
            },
        )
        .await
        .expect("replacement");

    assert_eq!(replaced.physical_id, "workers-v2");
    let names: Vec<_> = plane.scaling_groups().into_iter().map(|g| g.name).collect();
    assert_eq!(names, vec!["workers-v2".to_owned()]);
    let templates: Vec<_> = plane.launch_templates().into_iter().map(|t| t.name).collect();
    assert_eq!(templates, vec!["workers-v2-lt".to_owned()]);
}

#[tokio::test(start_paused = true)]
async fn delete_waits_for_the_group_before_removing_the_template() {
    let plane = Arc::new(
        SimulatedControlPlane::new("us-east-1").with_settings(SimulationSettings { deletion_polls: 3 }),
    );
    let handlers = HandlerSet::new();
    let mut ctx = context(&plane, ResourceKind::ScalingGroup, "WorkerGroup");
    let created = handlers
        .run(
            &mut ctx,
            &HandlerCall::Create(props(
                ResourceKind::ScalingGroup,
                json!({"MinSize": 1, "MaxSize": 3, "TargetCpuUtilization": 50}),
            )),
        )
        .await
        .expect("create");
    assert_eq!(plane.scaling_policies().len(), 1);

    let delete = HandlerCall::delete(ResourceKind::ScalingGroup, created.physical_id.clone());
    let mut ctx = context(&plane, ResourceKind::ScalingGroup, "WorkerGroup");
    handlers.run(&mut ctx, &delete).await.expect("delete");
    assert!(plane.scaling_groups().is_empty());
    assert!(plane.launch_templates().is_empty());
    assert!(plane.scaling_policies().is_empty());

    let mut ctx = context(&plane, ResourceKind::ScalingGroup, "WorkerGroup");
    handlers.run(&mut ctx, &delete).await.expect("second delete");
}

#[tokio::test]
async fn firewall_delete_removes_acl_before_ip_set() {
    let plane = plane();
    let handlers = HandlerSet::new();
    let mut ctx = context(&plane, ResourceKind::Firewall, "Edge");
    let created = handlers
        .run(&mut ctx, &HandlerCall::Create(edge_firewall(&["10.0.0.0/8"])))
        .await
        .expect("create");
    assert_eq!(created.physical_id, "REGIONAL/app-edge");
    assert_eq!(created.data["scope"], json!("REGIONAL"));

    plane.clear_calls();
    let delete = HandlerCall::delete(ResourceKind::Firewall, created.physical_id.clone());
    let mut ctx = context(&plane, ResourceKind::Firewall, "Edge");
    handlers.run(&mut ctx, &delete).await.expect("delete");

    let operations = plane.operations();
    let acl = operations
        .iter()
        .position(|op| *op == Operation::DeleteWebAcl)
        .expect("acl deleted");
    let ip_set = operations
        .iter()
        .position(|op| *op == Operation::DeleteIpSet)
        .expect("ip set deleted");
    assert!(acl < ip_set);
    assert!(plane.web_acls().is_empty());
    assert!(plane.ip_sets().is_empty());

    let mut ctx = context(&plane, ResourceKind::Firewall, "Edge");
    handlers.run(&mut ctx, &delete).await.expect("second delete");
}

#[tokio::test]
async fn failed_acl_creation_removes_the_new_ip_set() {
    let plane = plane();
    plane.fail_always(
        Operation::CreateWebAcl,
        "WAFLimitsExceededException",
        "web ACL limit reached",
    );
    let mut ctx = context(&plane, ResourceKind::Firewall, "Edge");
    let err = HandlerSet::new()
        .run(&mut ctx, &HandlerCall::Create(edge_firewall(&["10.0.0.0/8"])))
        .await
        .expect_err("acl creation fails");
    assert!(err.to_string().contains("WAFLimitsExceededException"));
    assert!(plane.ip_sets().is_empty());
}

#[tokio::test]
async fn failed_acl_update_restores_ip_set_addresses() {
    let plane = plane();
    let handlers = HandlerSet::new();
    let mut ctx = context(&plane, ResourceKind::Firewall, "Edge");
    let created = handlers
        .run(&mut ctx, &HandlerCall::Create(edge_firewall(&["10.0.0.0/8"])))
        .await
        .expect("create");

    plane.fail_always(Operation::UpdateWebAcl, "WAFInvalidParameterException", "bad rule");
    let update = HandlerCall::Update {
        physical_id: created.physical_id.clone(),
        properties: props(
            ResourceKind::Firewall,
            json!({
                "Cidrs": "192.168.0.0/16",
                "DefaultAction": "BLOCK",
                "RuleGroups": []
            }),
        ),
    };
    let mut ctx = context(&plane, ResourceKind::Firewall, "Edge");
    handlers.run(&mut ctx, &update).await.expect_err("acl update fails");

    let sets = plane.ip_sets();
    assert_eq!(sets.len(), 1);
    assert_eq!(sets[0].addresses, vec!["10.0.0.0/8".to_owned()]);
}

#[tokio::test]
async fn firewall_update_reconciles_association() {
    let plane = plane();
    let handlers = HandlerSet::new();
    let lb = "arn:aws:elasticloadbalancing:us-east-1:123456789012:loadbalancer/app/web/1";
    let mut ctx = context(&plane, ResourceKind::Firewall, "Edge");
    let created = handlers
        .run(
            &mut ctx,
            &HandlerCall::Create(props(
                ResourceKind::Firewall,
                json!({"DefaultAction": "ALLOW", "AssociatedResourceArn": lb}),
            )),
        )
        .await
        .expect("create");
    assert_eq!(plane.associations().len(), 1);

    let mut ctx = context(&plane, ResourceKind::Firewall, "Edge");
    handlers
        .run(
            &mut ctx,
            &HandlerCall::Update {
                physical_id: created.physical_id.clone(),
                properties: props(ResourceKind::Firewall, json!({"DefaultAction": "ALLOW"})),
            },
        )
        .await
        .expect("update");
    assert!(plane.associations().is_empty());

    let acl = &plane.web_acls()[0];
    assert_eq!(acl.scope, WafScope::Regional);
    assert_eq!(acl.rules.len(), 1);
}

#[tokio::test]
async fn dns_record_lifecycle() {
    let plane = plane();
    let handlers = HandlerSet::new();
    let record = |name: &str| {
        props(
            ResourceKind::DnsRecord,
            json!({
                "HostedZoneId": "Z123",
                "RecordName": name,
                "TargetDnsName": "web-1.elb.amazonaws.com",
                "TargetHostedZoneId": "Z35SXDOTRQ7X7K",
                "EvaluateTargetHealth": "true"
            }),
        )
    };

    let mut ctx = context(&plane, ResourceKind::DnsRecord, "Api");
    let created = handlers
        .run(&mut ctx, &HandlerCall::Create(record("API.example.com")))
        .await
        .expect("create");
    assert_eq!(created.physical_id, "Z123/api.example.com./A");
    assert_eq!(created.data["fqdn"], json!("api.example.com."));

    let mut ctx = context(&plane, ResourceKind::DnsRecord, "Api");
    let moved = handlers
        .run(
            &mut ctx,
            &HandlerCall::Update {
                physical_id: created.physical_id.clone(),
                properties: record("edge.example.com"),
            },
        )
        .await
        .expect("replacement");
    assert_eq!(moved.physical_id, "Z123/edge.example.com./A");
    assert_eq!(plane.alias_records().len(), 1);

    let mut ctx = context(&plane, ResourceKind::DnsRecord, "Api");
    handlers
        .run(
            &mut ctx,
            &HandlerCall::delete(ResourceKind::DnsRecord, moved.physical_id.clone()),
        )
        .await
        .expect("delete");
    assert!(plane.alias_records().is_empty());
}

#[tokio::test]
async fn deleting_unknown_ids_succeeds_for_every_family() {
    let plane = plane();
    let handlers = HandlerSet::new();
    for (kind, id) in [
        (ResourceKind::ScalingGroup, "failed-WorkerGroup-req-1"),
        (ResourceKind::Firewall, "failed-Edge-req-1"),
        (ResourceKind::Firewall, "REGIONAL/never-created"),
        (ResourceKind::DnsRecord, "failed-Api-req-1"),
        (ResourceKind::DnsRecord, "Z123/missing.example.com./A"),
    ] {
        let mut ctx = context(&plane, kind, "Any");
        handlers
            .run(
                &mut ctx,
                &HandlerCall::delete(kind, id),
            )
            .await
            .unwrap_or_else(|err| panic!("delete of {id} failed: {err}"));
    }
    assert!(!plane
        .operations()
        .iter()
        .any(|op| op.is_mutation()));
}

#[tokio::test(start_paused = true)]
async fn transient_throttling_is_absorbed_by_the_client() {
    let plane = plane();
    plane.fail_times(Operation::CreateLaunchTemplate, 2, "Throttling", "Rate exceeded");
    let dyn_plane: Arc<dyn ControlPlane> = plane.clone();
    let client = ProviderClient::new(
        dyn_plane,
        RetryPolicy::new(
            5,
            Duration::from_millis(10),
            Duration::from_millis(100),
            Duration::ZERO,
        ),
    );
    let mut ctx = HandlerContext::new(
        client,
        ResourceKind::ScalingGroup,
        "Create",
        "req-1",
        "WorkerGroup",
        STACK_ID,
    );
    HandlerSet::new()
        .run(&mut ctx, &HandlerCall::Create(worker_group(2)))
        .await
        .expect("create after throttling");
    assert_eq!(plane.count_calls(Operation::CreateLaunchTemplate), 3);
}

#[tokio::test]
async fn firewall_create_is_idempotent() {
    let plane = plane();
    let handlers = HandlerSet::new();
    let call = HandlerCall::Create(edge_firewall(&["10.0.0.0/8"]));

    let mut ctx = context(&plane, ResourceKind::Firewall, "Edge");
    let first = handlers.run(&mut ctx, &call).await.expect("first create");
    let mut ctx = context(&plane, ResourceKind::Firewall, "Edge");
    let second = handlers.run(&mut ctx, &call).await.expect("second create");

    assert_eq!(second.physical_id, first.physical_id);
    assert_eq!(plane.web_acls().len(), 1);
    assert_eq!(plane.ip_sets().len(), 1);
    assert_eq!(plane.count_calls(Operation::CreateWebAcl), 1);
    assert_eq!(plane.count_calls(Operation::CreateIpSet), 1);
}

#[tokio::test]
async fn dns_record_create_is_idempotent() {
    let plane = plane();
    let handlers = HandlerSet::new();
    let call = HandlerCall::Create(props(
        ResourceKind::DnsRecord,
        json!({
            "HostedZoneId": "Z123",
            "RecordName": "api.example.com",
            "TargetDnsName": "web-1.elb.amazonaws.com",
            "TargetHostedZoneId": "Z35SXDOTRQ7X7K"
        }),
    ));

    let mut ctx = context(&plane, ResourceKind::DnsRecord, "Api");
    let first = handlers.run(&mut ctx, &call).await.expect("first create");
    let mut ctx = context(&plane, ResourceKind::DnsRecord, "Api");
    let second = handlers.run(&mut ctx, &call).await.expect("second create");

    assert_eq!(second.physical_id, first.physical_id);
    assert_eq!(second.data, first.data);
    assert_eq!(plane.alias_records().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn retried_delete_removes_a_custom_named_template() {
    let plane = plane();
    let handlers = HandlerSet::new();
    let custom = props(
        ResourceKind::ScalingGroup,
        json!({"MinSize": 0, "MaxSize": 2, "LaunchTemplateName": "custom-lt"}),
    );
    let mut ctx = context(&plane, ResourceKind::ScalingGroup, "WorkerGroup");
    let created = handlers
        .run(&mut ctx, &HandlerCall::Create(custom.clone()))
        .await
        .expect("create");
    assert_eq!(created.data["launchTemplateName"], json!("custom-lt"));

    // An earlier delete removed the group and then ran out of time.
    plane
        .delete_scaling_group(&created.physical_id, true)
        .await
        .expect("group removed");
    assert!(plane.scaling_groups().is_empty());

    let retry = HandlerCall::Delete {
        kind: ResourceKind::ScalingGroup,
        physical_id: created.physical_id.clone(),
        properties: Some(custom),
    };
    let mut ctx = context(&plane, ResourceKind::ScalingGroup, "WorkerGroup");
    handlers.run(&mut ctx, &retry).await.expect("retried delete");
    assert!(plane.launch_templates().is_empty());
}

#[tokio::test(start_paused = true)]
async fn delete_keeps_a_custom_template_owned_by_another_group() {
    let plane = plane();
    let handlers = HandlerSet::new();
    let shared = |group: &str| {
        props(
            ResourceKind::ScalingGroup,
            json!({"GroupName": group, "MinSize": 0, "MaxSize": 2, "LaunchTemplateName": "shared-lt"}),
        )
    };
    let mut ctx = context(&plane, ResourceKind::ScalingGroup, "WorkerGroup");
    handlers
        .run(&mut ctx, &HandlerCall::Create(shared("web")))
        .await
        .expect("create");

    let stale = HandlerCall::Delete {
        kind: ResourceKind::ScalingGroup,
        physical_id: "batch".into(),
        properties: Some(shared("batch")),
    };
    let mut ctx = context(&plane, ResourceKind::ScalingGroup, "WorkerGroup");
    handlers.run(&mut ctx, &stale).await.expect("delete of a missing group");
    assert_eq!(plane.launch_templates().len(), 1);
    assert_eq!(plane.scaling_groups().len(), 1);
}

#[tokio::test]
async fn renamed_launch_template_replaces_the_old_one() {
    let plane = plane();
    let handlers = HandlerSet::new();
    let mut ctx = context(&plane, ResourceKind::ScalingGroup, "WorkerGroup");
    let created = handlers
        .run(&mut ctx, &HandlerCall::Create(worker_group(2)))
        .await
        .expect("create");
    assert_eq!(created.data["launchTemplateName"], json!("app-workergroup-lt"));

    let mut ctx = context(&plane, ResourceKind::ScalingGroup, "WorkerGroup");
    let updated = handlers
        .run(
            &mut ctx,
            &HandlerCall::Update {
                physical_id: created.physical_id.clone(),
                properties: props(
                    ResourceKind::ScalingGroup,
                    json!({"MinSize": 0, "MaxSize": 2, "LaunchTemplateName": "custom-lt"}),
                ),
            },
        )
        .await
        .expect("update");

    assert_eq!(updated.physical_id, created.physical_id);
    assert_eq!(updated.data["launchTemplateName"], json!("custom-lt"));
    let templates = plane.launch_templates();
    assert_eq!(templates.len(), 1);
    assert_eq!(templates[0].name, "custom-lt");
    assert_eq!(
        plane.scaling_groups()[0].mixed_instances.launch_template.id,
        templates[0].id
    );
}
