//! Downstream service invocation: POST the task payload to a resolved
//! endpoint and classify the outcome.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::registry::ServiceEndpoint;
use crate::task::Variables;

/// Conversation context injected for conversational service types.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadContext {
    pub thread_id: String,
    pub assistant_id: String,
}

/// Body of the downstream `POST /process` call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeRequest {
    pub task_id: String,
    pub variables: Variables,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ThreadContext>,
}

/// Invocation failure, split along the retry policy boundary: connectivity
/// and server errors are retryable, client errors and contract violations
/// are fatal for the task.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("connectivity: {0}")]
    Connectivity(String),

    #[error("server error {status}: {body}")]
    Server { status: u16, body: String },

    #[error("client error {status}: {body}")]
    Client { status: u16, body: String },

    #[error("contract violation: {0}")]
    Contract(String),
}

/// Downstream invocation seam.
#[async_trait]
pub trait ServiceInvoker: Send + Sync {
    async fn invoke(
        &self,
        endpoint: &ServiceEndpoint,
        operation: Option<&str>,
        request: &InvokeRequest,
    ) -> Result<Variables, InvokeError>;
}

/// Operation route: `{base}/process`, or `{base}/process/{operation}` when
/// the binding declares a sub-route.
fn process_url(base_url: &str, operation: Option<&str>) -> String {
    let base = base_url.trim_end_matches('/');
    match operation {
        Some(op) => format!("{base}/process/{op}"),
        None => format!("{base}/process"),
    }
}

/// reqwest-backed invoker with a per-call timeout.
pub struct HttpInvoker {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpInvoker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl ServiceInvoker for HttpInvoker {
    async fn invoke(
        &self,
        endpoint: &ServiceEndpoint,
        operation: Option<&str>,
        request: &InvokeRequest,
    ) -> Result<Variables, InvokeError> {
        #[derive(Deserialize)]
        struct ProcessResponse {
            variables: Variables,
        }

        let url = process_url(&endpoint.base_url, operation);
        debug!(task = %request.task_id, %url, "invoking downstream service");

        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| InvokeError::Connectivity(e.to_string()))?;

        let status = response.status().as_u16();
        match status {
            200..=299 => {
                let body = response
                    .text()
                    .await
                    .map_err(|e| InvokeError::Connectivity(e.to_string()))?;
                let parsed: ProcessResponse = serde_json::from_str(&body)
                    .map_err(|e| InvokeError::Contract(format!("bad response body: {e}")))?;
                Ok(parsed.variables)
            }
            400..=499 => Err(InvokeError::Client {
                status,
                body: response.text().await.unwrap_or_default(),
            }),
            _ => Err(InvokeError::Server {
                status,
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TypedVariable;

    #[test]
    fn process_url_with_and_without_operation() {
        assert_eq!(process_url("http://svc:9000", None), "http://svc:9000/process");
        assert_eq!(
            process_url("http://svc:9000/", Some("review")),
            "http://svc:9000/process/review"
        );
    }

    #[test]
    fn request_serializes_engine_wire_shape() {
        let mut variables = Variables::new();
        variables.insert("fileId".to_string(), TypedVariable::string("abc"));

        let request = InvokeRequest {
            task_id: "task1".to_string(),
            variables,
            context: Some(ThreadContext {
                thread_id: "thread-1".to_string(),
                assistant_id: "asst-A".to_string(),
            }),
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["taskId"], "task1");
        assert_eq!(json["variables"]["fileId"]["value"], "abc");
        assert_eq!(json["variables"]["fileId"]["type"], "String");
        assert_eq!(json["context"]["threadId"], "thread-1");
    }

    #[test]
    fn context_omitted_when_absent() {
        let request = InvokeRequest {
            task_id: "task1".to_string(),
            variables: Variables::new(),
            context: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("context").is_none());
    }
}
