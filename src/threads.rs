//! Conversation Thread Manager: get-or-create-and-validate semantics for
//! persistent conversation handles, strictly scoped per process instance.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Error talking to the downstream conversation service.
#[derive(Debug, thiserror::Error)]
pub enum ThreadError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("thread service returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// Downstream conversation-service seam.
#[async_trait]
pub trait ThreadService: Send + Sync {
    /// Create a new thread for the given assistant, returning its opaque
    /// handle.
    async fn create_thread(&self, assistant_id: &str) -> Result<String, ThreadError>;

    /// Existence-check a handle. `false` means the thread expired or was
    /// deleted out-of-band.
    async fn validate_thread(&self, handle: &str) -> Result<bool, ThreadError>;
}

/// HTTP conversation service: `POST {base}/threads` with `{assistantId}`
/// returning `{"threadId": ".."}`; `GET {base}/threads/{id}` is 200 for a
/// live thread and 404 for a gone one.
pub struct HttpThreadService {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpThreadService {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl ThreadService for HttpThreadService {
    async fn create_thread(&self, assistant_id: &str) -> Result<String, ThreadError> {
        #[derive(serde::Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Created {
            thread_id: String,
        }

        let response = self
            .client
            .post(format!("{}/threads", self.base_url))
            .timeout(self.timeout)
            .json(&serde_json::json!({ "assistantId": assistant_id }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ThreadError::Status {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        Ok(response.json::<Created>().await?.thread_id)
    }

    async fn validate_thread(&self, handle: &str) -> Result<bool, ThreadError> {
        let response = self
            .client
            .get(format!("{}/threads/{handle}", self.base_url))
            .timeout(self.timeout)
            .send()
            .await?;

        match response.status().as_u16() {
            200..=299 => Ok(true),
            404 => Ok(false),
            code => Err(ThreadError::Status {
                status: code,
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
struct ThreadEntry {
    handle: String,
    created_at: Instant,
    last_validated_at: Instant,
}

type ThreadKey = (String, String);
type Slot = Arc<tokio::sync::Mutex<Option<ThreadEntry>>>;

/// Per-(process instance, assistant) thread cache.
///
/// Each key has its own async mutex, so concurrent callers for the same
/// key are serialized (exactly one create) while other keys proceed
/// untouched. Distinct process instances can never share a slot, which is
/// what enforces process isolation.
///
/// Slots are never evicted: the map holds one entry per distinct key seen
/// over the worker's lifetime, including completed process instances.
pub struct ThreadManager {
    service: Arc<dyn ThreadService>,
    slots: Mutex<HashMap<ThreadKey, Slot>>,
}

impl ThreadManager {
    pub fn new(service: Arc<dyn ThreadService>) -> Self {
        Self {
            service,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, process_instance_id: &str, assistant_id: &str) -> Slot {
        let key = (process_instance_id.to_string(), assistant_id.to_string());
        self.slots.lock().unwrap().entry(key).or_default().clone()
    }

    /// Return a live thread handle for the key, creating or transparently
    /// recreating one as needed. A thread deleted out-of-band is replaced
    /// without the caller ever observing the staleness.
    pub async fn get_or_create(
        &self,
        process_instance_id: &str,
        assistant_id: &str,
    ) -> Result<String, ThreadError> {
        let slot = self.slot(process_instance_id, assistant_id);
        let mut guard = slot.lock().await;

        if let Some(entry) = guard.as_mut() {
            if self.service.validate_thread(&entry.handle).await? {
                entry.last_validated_at = Instant::now();
                return Ok(entry.handle.clone());
            }
            debug!(
                process_instance = process_instance_id,
                assistant = assistant_id,
                age_secs = entry.created_at.elapsed().as_secs(),
                validated_secs_ago = entry.last_validated_at.elapsed().as_secs(),
                "cached thread is stale, recreating"
            );
            *guard = None;
        }

        let handle = self.service.create_thread(assistant_id).await?;
        info!(
            process_instance = process_instance_id,
            assistant = assistant_id,
            thread = %handle,
            "created conversation thread"
        );
        let now = Instant::now();
        *guard = Some(ThreadEntry {
            handle: handle.clone(),
            created_at: now,
            last_validated_at: now,
        });
        Ok(handle)
    }
}
