//! ---
//! crorch_section: "04-configuration-orchestration"
//! crorch_subsection: "module"
//! crorch_type: "source"
//! crorch_scope: "code"
//! crorch_description: "Inbound lifecycle event envelope parsing and redaction."
//! crorch_version: "v0.1.0"
//! crorch_owner: "platform"
//! ---
//! Inbound lifecycle events.
//!
//! Events arrive in the custom-resource envelope used by declarative template
//! engines (`RequestType`, `ResponseURL`, `ResourceProperties`, ...). Parsing
//! keeps as much correlation data as it can when an envelope is malformed so
//! the caller can still be told that the request failed.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

const CUSTOM_PREFIX: &str = "Custom::";
const REDACTED: &str = "<redacted>";
const SENSITIVE_FRAGMENTS: [&str; 5] = ["password", "secret", "key", "token", "credential"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestType {
    Create,
    Update,
    Delete,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::Create => "Create",
            RequestType::Update => "Update",
            RequestType::Delete => "Delete",
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestType {
    type Err = RequestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "Create" => Ok(RequestType::Create),
            "Update" => Ok(RequestType::Update),
            "Delete" => Ok(RequestType::Delete),
            other => Err(RequestError::UnknownRequestType(other.to_owned())),
        }
    }
}

/// One lifecycle transition for one declared resource.
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleRequest {
    pub request_type: RequestType,
    /// Family tag selecting the handler, without the `Custom::` prefix.
    pub resource_type: String,
    pub logical_id: String,
    /// Present on Update and Delete.
    pub physical_id: Option<String>,
    pub desired_properties: Map<String, Value>,
    pub old_properties: Option<Map<String, Value>>,
    pub callback_target: String,
    pub request_id: String,
    pub stack_context: String,
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("event is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("event must be a JSON object")]
    NotAnObject,
    #[error("event is missing {0}")]
    MissingField(&'static str),
    #[error("field {field} must be {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },
    #[error("unknown request type {0}")]
    UnknownRequestType(String),
}

/// A rejected envelope plus whatever correlation data could be salvaged.
#[derive(Debug, Error)]
#[error("malformed lifecycle event: {error}")]
pub struct MalformedEvent {
    #[source]
    pub error: RequestError,
    pub callback_target: Option<String>,
    pub request_id: Option<String>,
    pub logical_id: Option<String>,
    pub physical_id: Option<String>,
    pub stack_context: Option<String>,
}

impl MalformedEvent {
    fn bare(error: RequestError) -> Self {
        Self {
            error,
            callback_target: None,
            request_id: None,
            logical_id: None,
            physical_id: None,
            stack_context: None,
        }
    }
}

impl From<serde_json::Error> for MalformedEvent {
    fn from(err: serde_json::Error) -> Self {
        Self::bare(RequestError::Json(err))
    }
}

impl LifecycleRequest {
    /// Parse a raw JSON event.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, MalformedEvent> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> Result<Self, MalformedEvent> {
        let Some(envelope) = value.as_object() else {
            return Err(MalformedEvent::bare(RequestError::NotAnObject));
        };
        let text = |field: &str| {
            envelope
                .get(field)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
        };

        let callback_target = text("ResponseURL");
        let request_id = text("RequestId");
        let logical_id = text("LogicalResourceId");
        let physical_id = text("PhysicalResourceId");
        let stack_context = text("StackId");

        let parsed = parse_envelope(
            envelope,
            &callback_target,
            &request_id,
            &logical_id,
            &physical_id,
            &stack_context,
        );
        parsed.map_err(|error| MalformedEvent {
            error,
            callback_target,
            request_id,
            logical_id,
            physical_id,
            stack_context,
        })
    }
}

fn parse_envelope(
    envelope: &Map<String, Value>,
    callback_target: &Option<String>,
    request_id: &Option<String>,
    logical_id: &Option<String>,
    physical_id: &Option<String>,
    stack_context: &Option<String>,
) -> Result<LifecycleRequest, RequestError> {
    let request_type = envelope
        .get("RequestType")
        .and_then(Value::as_str)
        .ok_or(RequestError::MissingField("RequestType"))?
        .parse::<RequestType>()?;
    let callback_target = callback_target
        .clone()
        .ok_or(RequestError::MissingField("ResponseURL"))?;
    let request_id = request_id
        .clone()
        .ok_or(RequestError::MissingField("RequestId"))?;
    let logical_id = logical_id
        .clone()
        .ok_or(RequestError::MissingField("LogicalResourceId"))?;

    let desired_properties = object_field(envelope, "ResourceProperties")?.unwrap_or_default();
    let old_properties = object_field(envelope, "OldResourceProperties")?;
    let resource_type = resource_type(envelope, &desired_properties)
        .ok_or(RequestError::MissingField("ResourceType"))?;

    Ok(LifecycleRequest {
        request_type,
        resource_type,
        logical_id,
        physical_id: physical_id.clone(),
        desired_properties,
        old_properties,
        callback_target,
        request_id,
        stack_context: stack_context.clone().unwrap_or_default(),
    })
}

fn object_field(
    envelope: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<Map<String, Value>>, RequestError> {
    match envelope.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map.clone())),
        Some(_) => Err(RequestError::WrongType {
            field,
            expected: "an object",
        }),
    }
}

/// Family tag from the property bag, falling back to the envelope's
/// `Custom::<Family>` resource type.
fn resource_type(envelope: &Map<String, Value>, properties: &Map<String, Value>) -> Option<String> {
    let from_properties = ["ResourceType", "resourceType"]
        .iter()
        .find_map(|key| properties.get(*key).and_then(Value::as_str));
    let tag = from_properties.or_else(|| envelope.get("ResourceType").and_then(Value::as_str))?;
    let tag = tag.trim();
    let tag = tag.strip_prefix(CUSTOM_PREFIX).unwrap_or(tag);
    (!tag.is_empty()).then(|| tag.to_owned())
}

fn is_sensitive(key: &str) -> bool {
    let lowered = key.to_ascii_lowercase();
    SENSITIVE_FRAGMENTS
        .iter()
        .any(|fragment| lowered.contains(fragment))
}

fn redact_properties(properties: &mut Map<String, Value>) {
    for (key, value) in properties.iter_mut() {
        if is_sensitive(key) {
            *value = Value::String(REDACTED.to_owned());
            continue;
        }
        match value {
            Value::Object(nested) => redact_properties(nested),
            Value::Array(items) => {
                for item in items {
                    if let Value::Object(nested) = item {
                        redact_properties(nested);
                    }
                }
            }
            _ => {}
        }
    }
}

/// Copy of a raw event that is safe to log: the callback URL (a presigned
/// credential) and secret-looking properties are replaced.
pub fn redact_event(event: &Value) -> Value {
    let mut redacted = event.clone();
    if let Value::Object(envelope) = &mut redacted {
        if envelope.contains_key("ResponseURL") {
            envelope.insert("ResponseURL".into(), Value::String(REDACTED.to_owned()));
        }
        for field in ["ResourceProperties", "OldResourceProperties"] {
            if let Some(Value::Object(properties)) = envelope.get_mut(field) {
                redact_properties(properties);
            }
        }
    }
    redacted
}
