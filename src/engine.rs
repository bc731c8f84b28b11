//! Task Source Client: protocol-correct communication with the process
//! engine's external-task REST API.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use crate::bpmn::{self, ActivityProperties};
use crate::config::TopicConfig;
use crate::task::{Task, Variables};

/// Error from an engine API call.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("task {0} not found (already completed or reclaimed)")]
    NotFound(String),

    #[error("task {0} is locked by another worker")]
    LockMismatch(String),

    #[error("engine returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("bpmn: {0}")]
    Bpmn(#[from] bpmn::BpmnError),
}

impl EngineError {
    /// Whether retrying the same call could succeed. Ownership errors
    /// (`NotFound`, `LockMismatch`) never will.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Http(_) => true,
            EngineError::Status { status, .. } => *status >= 500,
            EngineError::NotFound(_) | EngineError::LockMismatch(_) => false,
            EngineError::Bpmn(_) => false,
        }
    }
}

/// The engine seam. The worker and dispatcher only see this trait, so
/// tests drive them with `MockEngine`.
#[async_trait]
pub trait EngineApi: Send + Sync {
    /// Long-poll for tasks on the subscribed topics. Returns an empty vec
    /// when the poll times out with nothing available.
    async fn fetch_and_lock(&self, max_tasks: u32) -> Result<Vec<Task>, EngineError>;

    async fn complete(&self, task_id: &str, variables: &Variables) -> Result<(), EngineError>;

    async fn report_failure(
        &self,
        task_id: &str,
        error_message: &str,
        error_details: &str,
        retries: i32,
        retry_timeout_ms: u64,
    ) -> Result<(), EngineError>;

    /// Extension properties for one activity. Cached per process
    /// definition; deployed definitions are immutable so the cache is
    /// never invalidated.
    async fn extension_properties(
        &self,
        process_definition_id: &str,
        activity_id: &str,
    ) -> Result<HashMap<String, String>, EngineError>;
}

/// reqwest-backed engine client.
pub struct EngineClient {
    client: reqwest::Client,
    base_url: String,
    worker_id: String,
    topics: Vec<TopicConfig>,
    async_response_timeout: Duration,
    request_timeout: Duration,
    definitions: Mutex<HashMap<String, ActivityProperties>>,
}

impl EngineClient {
    pub fn new(
        base_url: &str,
        worker_id: &str,
        topics: Vec<TopicConfig>,
        async_response_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            worker_id: worker_id.to_string(),
            topics,
            async_response_timeout,
            request_timeout,
            definitions: Mutex::new(HashMap::new()),
        }
    }

    /// Parse and cache one definition's BPMN XML.
    pub fn prime_definition(
        &self,
        process_definition_id: &str,
        xml: &str,
    ) -> Result<(), EngineError> {
        let parsed = bpmn::extension_properties(xml)?;
        self.definitions
            .lock()
            .unwrap()
            .insert(process_definition_id.to_string(), parsed);
        Ok(())
    }

    fn cached_properties(
        &self,
        process_definition_id: &str,
        activity_id: &str,
    ) -> Option<HashMap<String, String>> {
        self.definitions
            .lock()
            .unwrap()
            .get(process_definition_id)
            .map(|def| def.get(activity_id).cloned().unwrap_or_default())
    }
}

/// Build the fetch-and-lock request body.
fn fetch_body(
    worker_id: &str,
    max_tasks: u32,
    async_response_timeout: Duration,
    topics: &[TopicConfig],
) -> serde_json::Value {
    let topics: Vec<serde_json::Value> = topics
        .iter()
        .map(|t| {
            let mut entry = serde_json::json!({
                "topicName": t.name,
                "lockDuration": t.lock_duration_ms,
            });
            if let Some(vars) = &t.variables {
                entry["variables"] = serde_json::json!(vars);
            }
            entry
        })
        .collect();

    serde_json::json!({
        "workerId": worker_id,
        "maxTasks": max_tasks,
        "usePriority": true,
        "asyncResponseTimeout": async_response_timeout.as_millis() as u64,
        "topics": topics,
    })
}

async fn expect_no_content(task_id: &str, response: reqwest::Response) -> Result<(), EngineError> {
    let status = response.status();
    match status.as_u16() {
        200..=299 => Ok(()),
        404 => Err(EngineError::NotFound(task_id.to_string())),
        409 => Err(EngineError::LockMismatch(task_id.to_string())),
        code => Err(EngineError::Status {
            status: code,
            body: response.text().await.unwrap_or_default(),
        }),
    }
}

#[async_trait]
impl EngineApi for EngineClient {
    async fn fetch_and_lock(&self, max_tasks: u32) -> Result<Vec<Task>, EngineError> {
        let body = fetch_body(
            &self.worker_id,
            max_tasks,
            self.async_response_timeout,
            &self.topics,
        );

        // The engine holds the request open for the long-poll window; the
        // client timeout only needs to bound the slack beyond it.
        let response = self
            .client
            .post(format!("{}/external-task/fetchAndLock", self.base_url))
            .timeout(self.async_response_timeout + self.request_timeout)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(EngineError::Status {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let tasks: Vec<Task> = response.json().await?;
        debug!(count = tasks.len(), "fetch-and-lock returned");
        Ok(tasks)
    }

    async fn complete(&self, task_id: &str, variables: &Variables) -> Result<(), EngineError> {
        let response = self
            .client
            .post(format!("{}/external-task/{task_id}/complete", self.base_url))
            .timeout(self.request_timeout)
            .json(&serde_json::json!({
                "workerId": self.worker_id,
                "variables": variables,
            }))
            .send()
            .await?;
        expect_no_content(task_id, response).await
    }

    async fn report_failure(
        &self,
        task_id: &str,
        error_message: &str,
        error_details: &str,
        retries: i32,
        retry_timeout_ms: u64,
    ) -> Result<(), EngineError> {
        let response = self
            .client
            .post(format!("{}/external-task/{task_id}/failure", self.base_url))
            .timeout(self.request_timeout)
            .json(&serde_json::json!({
                "workerId": self.worker_id,
                "errorMessage": error_message,
                "errorDetails": error_details,
                "retries": retries,
                "retryTimeout": retry_timeout_ms,
            }))
            .send()
            .await?;
        expect_no_content(task_id, response).await
    }

    async fn extension_properties(
        &self,
        process_definition_id: &str,
        activity_id: &str,
    ) -> Result<HashMap<String, String>, EngineError> {
        if let Some(props) = self.cached_properties(process_definition_id, activity_id) {
            return Ok(props);
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct XmlResponse {
            bpmn20_xml: String,
        }

        let response = self
            .client
            .get(format!(
                "{}/process-definition/{process_definition_id}/xml",
                self.base_url
            ))
            .timeout(self.request_timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(EngineError::Status {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let xml: XmlResponse = response.json().await?;
        self.prime_definition(process_definition_id, &xml.bpmn20_xml)?;
        debug!(definition = process_definition_id, "cached definition properties");

        Ok(self
            .cached_properties(process_definition_id, activity_id)
            .unwrap_or_default())
    }
}
