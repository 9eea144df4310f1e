//! ---
//! crorch_section: "15-testing-qa-runbook"
//! crorch_subsection: "integration-tests"
//! crorch_type: "source"
//! crorch_scope: "code"
//! crorch_description: "End-to-end lifecycle scenarios against the simulated control plane."
//! crorch_version: "v0.1.0"
//! crorch_owner: "platform"
//! ---
use std::sync::Arc;
use std::time::Duration;

use crorch_common::DispatcherConfig;
use crorch_handlers::HandlerSet;
use crorch_orchestrator::{
    metrics, new_registry, Dispatcher, LifecycleResult, LifecycleStatus, OrchestratorMetrics,
    RecordingTransport, ResponseReporter,
};
use crorch_provider::{Operation, ProviderClient, SimulatedControlPlane};
use crorch_resilience::{RetryPolicy, WaitConfig};
use serde_json::{json, Value};

const STACK_ID: &str =
    "arn:aws:cloudformation:us-east-1:123456789012:stack/app/8c3f1e20-5b4a-11ef-9a51-0a1b2c3d4e5f";
const CALLBACK: &str = "https://callback.example.com/presigned/req";

struct Env {
    plane: Arc<SimulatedControlPlane>,
    transport: Arc<RecordingTransport>,
    dispatcher: Dispatcher,
}

fn env_with(policy: RetryPolicy, config: DispatcherConfig) -> Env {
    let plane = Arc::new(SimulatedControlPlane::new("us-east-1"));
    let transport = Arc::new(RecordingTransport::new());
    let client = ProviderClient::new(plane.clone(), policy);
    let reporter = ResponseReporter::new(transport.clone(), RetryPolicy::no_retry());
    let dispatcher = Dispatcher::new(HandlerSet::new(), client, reporter, config).with_wait(
        WaitConfig {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        },
    );
    Env {
        plane,
        transport,
        dispatcher,
    }
}

fn env() -> Env {
    env_with(RetryPolicy::no_retry(), DispatcherConfig::default())
}

fn event(
    request_type: &str,
    resource_type: &str,
    logical_id: &str,
    physical_id: Option<&str>,
    properties: Value,
) -> Value {
    let mut event = json!({
        "RequestType": request_type,
        "ResponseURL": CALLBACK,
        "StackId": STACK_ID,
        "RequestId": format!("{request_type}-{logical_id}"),
        "ResourceType": format!("Custom::{resource_type}"),
        "LogicalResourceId": logical_id,
        "ResourceProperties": properties,
    });
    if let Some(id) = physical_id {
        event["PhysicalResourceId"] = json!(id);
    }
    event
}

fn worker_group(max_size: &str) -> Value {
    json!({
        "ServiceToken": "arn:aws:lambda:us-east-1:123456789012:function:crorch",
        "MinSize": "0",
        "MaxSize": max_size,
        "DesiredCapacity": "0",
        "OnDemandPercentage": "100",
        "SubnetIds": "subnet-a,subnet-b",
        "InstanceTypes": ["t4g.small", "t4g.medium"]
    })
}

fn edge_firewall() -> Value {
    json!({
        "Cidrs": ["10.0.0.0/8"],
        "DefaultAction": "ALLOW"
    })
}

async fn create_worker_group(env: &Env) -> LifecycleResult {
    env.dispatcher
        .handle_event(&event("Create", "ScalingGroup", "WorkerGroup", None, worker_group("2")))
        .await
}

#[tokio::test]
async fn scenario_a_create_scaling_group() {
    let env = env();
    let result = create_worker_group(&env).await;

    assert_eq!(result.status, LifecycleStatus::Success, "{}", result.reason);
    assert_eq!(result.physical_id, "app-workergroup");
    assert!(result.data["launchTemplateId"]
        .as_str()
        .is_some_and(|id| id.starts_with("lt-")));

    let payloads = env.transport.payloads();
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0].physical_resource_id, "app-workergroup");
    assert_eq!(payloads[0].stack_id, STACK_ID);
    assert_eq!(env.transport.deliveries()[0].0, CALLBACK);

    let groups = env.plane.scaling_groups();
    assert_eq!(groups.len(), 1);
    assert_eq!((groups[0].min_size, groups[0].max_size), (0, 2));
}

#[tokio::test]
async fn scenario_b_update_keeps_the_physical_id() {
    let env = env();
    let created = create_worker_group(&env).await;

    let updated = env
        .dispatcher
        .handle_event(&event(
            "Update",
            "ScalingGroup",
            "WorkerGroup",
            Some(&created.physical_id),
            worker_group("5"),
        ))
        .await;

    assert_eq!(updated.status, LifecycleStatus::Success, "{}", updated.reason);
    assert_eq!(updated.physical_id, created.physical_id);
    assert_eq!(env.plane.scaling_groups()[0].max_size, 5);
    assert_eq!(env.plane.launch_templates().len(), 1);
}

#[tokio::test]
async fn scenario_c_firewall_create_then_delete_twice() {
    let env = env();
    let created = env
        .dispatcher
        .handle_event(&event("Create", "Firewall", "Edge", None, edge_firewall()))
        .await;
    assert!(created.is_success(), "{}", created.reason);
    assert_eq!(created.physical_id, "REGIONAL/app-edge");
    assert_eq!(env.plane.web_acls().len(), 1);
    assert_eq!(env.plane.ip_sets().len(), 1);

    for _ in 0..2 {
        let deleted = env
            .dispatcher
            .handle_event(&event(
                "Delete",
                "Firewall",
                "Edge",
                Some(&created.physical_id),
                edge_firewall(),
            ))
            .await;
        assert!(deleted.is_success(), "{}", deleted.reason);
        assert_eq!(deleted.physical_id, created.physical_id);
    }
    assert!(env.plane.web_acls().is_empty());
    assert!(env.plane.ip_sets().is_empty());
    assert_eq!(env.transport.payloads().len(), 3);
}

#[tokio::test]
async fn scenario_d_unknown_resource_type() {
    let env = env();
    let result = env
        .dispatcher
        .handle_event(&event("Create", "Bogus", "Thing", None, json!({})))
        .await;

    assert_eq!(result.status, LifecycleStatus::Failed);
    assert!(result.reason.contains("unsupported"));
    assert!(env.plane.calls().is_empty());
    let payloads = env.transport.payloads();
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0].status, LifecycleStatus::Failed);
}

#[tokio::test]
async fn repeated_create_adopts_instead_of_duplicating() {
    let env = env();
    let first = create_worker_group(&env).await;
    let second = create_worker_group(&env).await;

    assert!(second.is_success(), "{}", second.reason);
    assert_eq!(first.physical_id, second.physical_id);
    assert_eq!(first.data["launchTemplateId"], second.data["launchTemplateId"]);
    assert_eq!(env.plane.scaling_groups().len(), 1);
    assert_eq!(env.plane.launch_templates().len(), 1);
}

#[tokio::test]
async fn failed_group_creation_leaves_nothing_behind() {
    let env = env();
    env.plane.fail_next(
        Operation::CreateScalingGroup,
        "LimitExceeded",
        "You have reached the maximum number of Auto Scaling groups",
    );

    let result = create_worker_group(&env).await;
    assert_eq!(result.status, LifecycleStatus::Failed);
    assert_eq!(result.physical_id, "failed-WorkerGroup-Create-WorkerGroup");
    assert!(result.reason.starts_with("ScalingGroup Create failed:"));
    assert!(result.reason.contains("LimitExceeded"));
    assert!(env.plane.launch_templates().is_empty());
    assert!(env.plane.scaling_groups().is_empty());

    // The stack rolls back by deleting the placeholder id.
    let cleanup = env
        .dispatcher
        .handle_event(&event(
            "Delete",
            "ScalingGroup",
            "WorkerGroup",
            Some(&result.physical_id),
            worker_group("2"),
        ))
        .await;
    assert!(cleanup.is_success(), "{}", cleanup.reason);
}

#[tokio::test]
async fn firewall_delete_removes_the_acl_before_its_ip_set() {
    let env = env();
    let created = env
        .dispatcher
        .handle_event(&event("Create", "Firewall", "Edge", None, edge_firewall()))
        .await;
    env.plane.clear_calls();

    let deleted = env
        .dispatcher
        .handle_event(&event(
            "Delete",
            "Firewall",
            "Edge",
            Some(&created.physical_id),
            json!({}),
        ))
        .await;
    assert!(deleted.is_success(), "{}", deleted.reason);

    let operations = env.plane.operations();
    let position = |op: Operation| operations.iter().position(|seen| *seen == op);
    let acl = position(Operation::DeleteWebAcl).expect("acl deleted");
    let ip_set = position(Operation::DeleteIpSet).expect("ip set deleted");
    assert!(acl < ip_set, "{operations:?}");
}

#[tokio::test]
async fn deleting_unknown_resources_succeeds_for_every_family() {
    let env = env();
    for (family, physical_id) in [
        ("ScalingGroup", "app-never-created"),
        ("Firewall", "REGIONAL/app-never-created"),
        ("DnsRecord", "Z0000000000/never.example.com./A"),
    ] {
        let result = env
            .dispatcher
            .handle_event(&event("Delete", family, "Ghost", Some(physical_id), json!({})))
            .await;
        assert!(result.is_success(), "{family}: {}", result.reason);
        assert_eq!(result.physical_id, physical_id);
    }
    assert_eq!(env.transport.payloads().len(), 3);
}

#[tokio::test]
async fn dns_record_follows_a_changed_target() {
    let env = env();
    let properties = |target: &str| {
        json!({
            "HostedZoneId": "Z0123456789ABC",
            "RecordName": "api.example.com",
            "TargetDnsName": target,
            "TargetHostedZoneId": "Z35SXDOTRQ7X7K",
            "EvaluateTargetHealth": "true"
        })
    };
    let created = env
        .dispatcher
        .handle_event(&event(
            "Create",
            "DnsRecord",
            "Api",
            None,
            properties("lb-1.elb.amazonaws.com"),
        ))
        .await;
    assert!(created.is_success(), "{}", created.reason);

    let updated = env
        .dispatcher
        .handle_event(&event(
            "Update",
            "DnsRecord",
            "Api",
            Some(&created.physical_id),
            properties("lb-2.elb.amazonaws.com"),
        ))
        .await;
    assert_eq!(updated.physical_id, created.physical_id);
    let records = env.plane.alias_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].target_dns_name, "lb-2.elb.amazonaws.com");
}

#[tokio::test]
async fn transient_throttling_is_retried_to_success() {
    let policy = RetryPolicy::new(
        4,
        Duration::from_millis(5),
        Duration::from_millis(20),
        Duration::ZERO,
    )
    .with_seed(11);
    let env = env_with(policy, DispatcherConfig::default());
    env.plane.fail_times(
        Operation::CreateLaunchTemplate,
        2,
        "Throttling",
        "Rate exceeded",
    );

    let result = create_worker_group(&env).await;
    assert!(result.is_success(), "{}", result.reason);
    assert_eq!(env.plane.count_calls(Operation::CreateLaunchTemplate), 3);
}

#[tokio::test]
async fn retries_stop_at_the_request_deadline() {
    let policy = RetryPolicy::new(
        10,
        Duration::from_secs(30),
        Duration::from_secs(60),
        Duration::ZERO,
    );
    let env = env_with(policy, DispatcherConfig::default());
    env.plane.fail_always(Operation::UpsertAliasRecord, "Throttling", "Rate exceeded");

    let request = crorch_orchestrator::LifecycleRequest::from_value(&event(
        "Create",
        "DnsRecord",
        "Api",
        None,
        json!({
            "HostedZoneId": "Z0123456789ABC",
            "RecordName": "api.example.com",
            "TargetDnsName": "lb-1.elb.amazonaws.com",
            "TargetHostedZoneId": "Z35SXDOTRQ7X7K"
        }),
    ))
    .expect("valid event");
    let result = env
        .dispatcher
        .handle_with_budget(request, Duration::from_secs(5))
        .await;

    assert_eq!(result.status, LifecycleStatus::Failed);
    assert!(result.reason.contains("retry budget exhausted"), "{}", result.reason);
    assert_eq!(env.plane.count_calls(Operation::UpsertAliasRecord), 1);
}

#[tokio::test]
async fn lifecycle_metrics_are_recorded() {
    let registry = new_registry();
    let env = env();
    let dispatcher = env
        .dispatcher
        .clone()
        .with_metrics(OrchestratorMetrics::new(&registry).expect("metrics"));

    dispatcher
        .handle_event(&event("Create", "Bogus", "Thing", None, json!({})))
        .await;
    dispatcher
        .handle_event(&event("Create", "Firewall", "Edge", None, edge_firewall()))
        .await;

    let text = metrics::render(&registry).expect("render");
    assert!(text.contains("status=\"FAILED\""));
    assert!(text.contains("status=\"SUCCESS\""));
    assert!(text.contains("crorch_callback_deliveries_total{outcome=\"delivered\"} 2"));
    assert!(text.contains("crorch_lifecycle_duration_seconds_count 2"));
}
