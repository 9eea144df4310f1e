//! ---
//! crorch_section: "04-configuration-orchestration"
//! crorch_subsection: "module"
//! crorch_type: "source"
//! crorch_scope: "code"
//! crorch_description: "Terminal lifecycle results and their callback wire shape."
//! crorch_version: "v0.1.0"
//! crorch_owner: "platform"
//! ---
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::request::{LifecycleRequest, MalformedEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleStatus {
    Success,
    Failed,
}

impl LifecycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleStatus::Success => "SUCCESS",
            LifecycleStatus::Failed => "FAILED",
        }
    }
}

/// The single terminal answer to a lifecycle request.
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleResult {
    pub status: LifecycleStatus,
    /// Required on every result, including failures.
    pub physical_id: String,
    /// Empty on success.
    pub reason: String,
    pub data: Map<String, Value>,
}

impl LifecycleResult {
    pub fn success(physical_id: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            status: LifecycleStatus::Success,
            physical_id: physical_id.into(),
            reason: String::new(),
            data,
        }
    }

    pub fn failed(physical_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            status: LifecycleStatus::Failed,
            physical_id: physical_id.into(),
            reason: reason.into(),
            data: Map::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == LifecycleStatus::Success
    }
}

/// Placeholder id for a request that failed before any resource existed.
/// Deleting it later succeeds because no provider resource carries it.
pub fn failed_physical_id(logical_id: &str, request_id: &str) -> String {
    format!("failed-{logical_id}-{request_id}")
}

/// Callback body in the shape template engines expect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CallbackPayload {
    pub status: LifecycleStatus,
    pub reason: String,
    pub physical_resource_id: String,
    pub stack_id: String,
    pub request_id: String,
    pub logical_resource_id: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl CallbackPayload {
    pub fn new(request: &LifecycleRequest, result: &LifecycleResult) -> Self {
        Self {
            status: result.status,
            reason: result.reason.clone(),
            physical_resource_id: result.physical_id.clone(),
            stack_id: request.stack_context.clone(),
            request_id: request.request_id.clone(),
            logical_resource_id: request.logical_id.clone(),
            data: result.data.clone(),
        }
    }

    /// FAILED body for an envelope that could not be parsed.
    pub fn for_malformed(event: &MalformedEvent) -> Self {
        let logical_id = event.logical_id.clone().unwrap_or_default();
        let request_id = event.request_id.clone().unwrap_or_default();
        let physical_id = event
            .physical_id
            .clone()
            .unwrap_or_else(|| failed_physical_id(&logical_id, &request_id));
        Self {
            status: LifecycleStatus::Failed,
            reason: event.to_string(),
            physical_resource_id: physical_id,
            stack_id: event.stack_context.clone().unwrap_or_default(),
            request_id,
            logical_resource_id: logical_id,
            data: Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn payload_uses_template_engine_field_names() {
        let request = LifecycleRequest::from_value(&json!({
            "RequestType": "Create",
            "ResponseURL": "stdout:",
            "StackId": "stack-1",
            "RequestId": "req-9",
            "ResourceType": "Custom::DnsRecord",
            "LogicalResourceId": "Api"
        }))
        .expect("parse");
        let mut data = Map::new();
        data.insert("fqdn".into(), json!("api.example.com."));
        let result = LifecycleResult::success("Z1/api.example.com./A", data);

        let body = serde_json::to_value(CallbackPayload::new(&request, &result)).expect("encode");
        assert_eq!(
            body,
            json!({
                "Status": "SUCCESS",
                "Reason": "",
                "PhysicalResourceId": "Z1/api.example.com./A",
                "StackId": "stack-1",
                "RequestId": "req-9",
                "LogicalResourceId": "Api",
                "Data": {"fqdn": "api.example.com."}
            })
        );
    }

    #[test]
    fn malformed_events_get_a_placeholder_id() {
        let err = LifecycleRequest::from_value(&json!({
            "ResponseURL": "https://callback.example.com/x",
            "RequestId": "req-2",
            "LogicalResourceId": "Edge"
        }))
        .unwrap_err();
        let payload = CallbackPayload::for_malformed(&err);
        assert_eq!(payload.status, LifecycleStatus::Failed);
        assert_eq!(payload.physical_resource_id, "failed-Edge-req-2");
        assert!(payload.reason.contains("RequestType"));
    }

    #[test]
    fn failed_results_carry_no_data() {
        let result = LifecycleResult::failed("failed-A-r", "boom");
        assert!(!result.is_success());
        assert!(result.data.is_empty());
        assert_eq!(result.status.as_str(), "FAILED");
    }
}
