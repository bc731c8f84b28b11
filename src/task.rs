use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// A variable in the engine's `{value, type}` wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedVariable {
    pub value: serde_json::Value,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub value_type: Option<String>,
}

impl TypedVariable {
    pub fn string(value: &str) -> Self {
        Self {
            value: serde_json::Value::String(value.to_string()),
            value_type: Some("String".to_string()),
        }
    }

    pub fn json(value: serde_json::Value) -> Self {
        Self {
            value,
            value_type: Some("Json".to_string()),
        }
    }
}

pub type Variables = HashMap<String, TypedVariable>;

/// A unit of work locked from the process engine. Owned by exactly one
/// dispatch unit until it is completed, failed, or its lock expires.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub topic_name: String,
    pub process_instance_id: String,
    pub process_definition_id: String,
    pub activity_id: String,
    /// None = the task has never failed; the worker seeds the retry budget.
    #[serde(default)]
    pub retries: Option<i32>,
    #[serde(default)]
    pub variables: Variables,
}

/// Closed set of downstream service categories. Unknown strings in BPMN
/// extension properties are rejected at binding extraction, per task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Assistant,
    Analysis,
    Store,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Assistant => "assistant",
            ServiceType::Analysis => "analysis",
            ServiceType::Store => "store",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceType {
    type Err = BindingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "assistant" => Ok(ServiceType::Assistant),
            "analysis" => Ok(ServiceType::Analysis),
            "store" => Ok(ServiceType::Store),
            other => Err(BindingError::UnknownServiceType(other.to_string())),
        }
    }
}

/// Error extracting a `ServiceBinding` from extension properties.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BindingError {
    #[error("missing extension property '{0}'")]
    MissingProperty(&'static str),

    #[error("unknown service type '{0}'")]
    UnknownServiceType(String),
}

/// Declarative routing metadata from the activity's extension properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceBinding {
    pub service_type: ServiceType,
    pub service_name: String,
    pub service_version: Option<String>,
    pub operation: Option<String>,
}

impl ServiceBinding {
    /// Extension property keys as they appear in the BPMN diagram.
    pub const TYPE_KEY: &'static str = "service.type";
    pub const NAME_KEY: &'static str = "service.name";
    pub const VERSION_KEY: &'static str = "service.version";
    pub const OPERATION_KEY: &'static str = "service.operation";

    /// Extract a binding from an activity's extension properties.
    /// `service.type` and `service.name` are mandatory.
    pub fn from_properties(props: &HashMap<String, String>) -> Result<Self, BindingError> {
        let type_str = props
            .get(Self::TYPE_KEY)
            .ok_or(BindingError::MissingProperty(Self::TYPE_KEY))?;
        let service_name = props
            .get(Self::NAME_KEY)
            .ok_or(BindingError::MissingProperty(Self::NAME_KEY))?
            .clone();

        Ok(Self {
            service_type: type_str.parse()?,
            service_name,
            service_version: props.get(Self::VERSION_KEY).cloned(),
            operation: props.get(Self::OPERATION_KEY).cloned(),
        })
    }
}

/// Outcome of invoking a downstream service for one task. Every dispatched
/// task produces exactly one of these, which maps to exactly one engine
/// acknowledgment call.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchResult {
    Success(Variables),
    Retryable { message: String, details: String },
    Fatal { message: String },
}

impl DispatchResult {
    pub fn outcome_label(&self) -> &'static str {
        match self {
            DispatchResult::Success(_) => "success",
            DispatchResult::Retryable { .. } => "retryable-failure",
            DispatchResult::Fatal { .. } => "fatal-failure",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn binding_from_full_properties() {
        let binding = ServiceBinding::from_properties(&props(&[
            ("service.type", "assistant"),
            ("service.name", "reviewer"),
            ("service.version", "2"),
            ("service.operation", "review"),
        ]))
        .unwrap();

        assert_eq!(binding.service_type, ServiceType::Assistant);
        assert_eq!(binding.service_name, "reviewer");
        assert_eq!(binding.service_version.as_deref(), Some("2"));
        assert_eq!(binding.operation.as_deref(), Some("review"));
    }

    #[test]
    fn binding_missing_name_errors() {
        let err = ServiceBinding::from_properties(&props(&[("service.type", "analysis")]))
            .unwrap_err();
        assert!(matches!(err, BindingError::MissingProperty("service.name")));
    }

    #[test]
    fn binding_unknown_type_errors() {
        let err = ServiceBinding::from_properties(&props(&[
            ("service.type", "quantum"),
            ("service.name", "x"),
        ]))
        .unwrap_err();
        match err {
            BindingError::UnknownServiceType(t) => assert_eq!(t, "quantum"),
            other => panic!("expected UnknownServiceType, got: {other}"),
        }
    }

    #[test]
    fn task_deserializes_engine_shape() {
        let json = serde_json::json!({
            "id": "task1",
            "topicName": "assistant.review",
            "processInstanceId": "P1",
            "processDefinitionId": "def1",
            "activityId": "Activity_review",
            "retries": null,
            "variables": {
                "fileId": {"value": "abc", "type": "String"}
            }
        });

        let task: Task = serde_json::from_value(json).unwrap();
        assert_eq!(task.id, "task1");
        assert_eq!(task.retries, None);
        assert_eq!(
            task.variables.get("fileId").unwrap().value,
            serde_json::Value::String("abc".to_string())
        );
    }
}
