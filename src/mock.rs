//! Mocks for the worker's seam traits. Each one returns configurable
//! outcomes per call and records what it was asked to do, for test
//! verification.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::engine::{EngineApi, EngineError};
use crate::invoker::{InvokeError, InvokeRequest, ServiceInvoker};
use crate::registry::{ServiceDirectory, ServiceEndpoint};
use crate::task::{ServiceType, Task, Variables};
use crate::threads::{ThreadError, ThreadService};

/// One recorded `report_failure` call.
#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub task_id: String,
    pub error_message: String,
    pub error_details: String,
    pub retries: i32,
    pub retry_timeout_ms: u64,
}

/// In-memory engine. Tasks are queued with `push_task` and drained by
/// `fetch_and_lock`; acknowledgments are recorded. An empty queue makes
/// the fetch sleep briefly to imitate a long-poll timeout.
pub struct MockEngine {
    queue: Mutex<VecDeque<Task>>,
    properties: Mutex<HashMap<(String, String), HashMap<String, String>>>,
    completions: Mutex<Vec<(String, Variables)>>,
    failures: Mutex<Vec<FailureRecord>>,
    fetch_calls: AtomicUsize,
    failing_fetches: AtomicUsize,
    failing_acks: AtomicUsize,
    not_found_tasks: Mutex<HashSet<String>>,
    poll_delay: Mutex<Duration>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            properties: Mutex::new(HashMap::new()),
            completions: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            fetch_calls: AtomicUsize::new(0),
            failing_fetches: AtomicUsize::new(0),
            failing_acks: AtomicUsize::new(0),
            not_found_tasks: Mutex::new(HashSet::new()),
            poll_delay: Mutex::new(Duration::from_millis(10)),
        }
    }

    pub fn push_task(&self, task: Task) {
        self.queue.lock().unwrap().push_back(task);
    }

    pub fn set_properties(&self, definition: &str, activity: &str, props: &[(&str, &str)]) {
        self.properties.lock().unwrap().insert(
            (definition.to_string(), activity.to_string()),
            props
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
    }

    /// Make the next `n` fetch calls fail with a 503.
    pub fn fail_next_fetches(&self, n: usize) {
        self.failing_fetches.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` acknowledgment calls (complete or failure) fail
    /// with a 503.
    pub fn fail_next_acks(&self, n: usize) {
        self.failing_acks.store(n, Ordering::SeqCst);
    }

    /// Make `complete` for this task return 404, as after a lock expiry
    /// race.
    pub fn set_not_found(&self, task_id: &str) {
        self.not_found_tasks
            .lock()
            .unwrap()
            .insert(task_id.to_string());
    }

    pub fn set_poll_delay(&self, delay: Duration) {
        *self.poll_delay.lock().unwrap() = delay;
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn completions(&self) -> Vec<(String, Variables)> {
        self.completions.lock().unwrap().clone()
    }

    pub fn failures(&self) -> Vec<FailureRecord> {
        self.failures.lock().unwrap().clone()
    }

    fn take_budget(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EngineApi for MockEngine {
    async fn fetch_and_lock(&self, max_tasks: u32) -> Result<Vec<Task>, EngineError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);

        if Self::take_budget(&self.failing_fetches) {
            return Err(EngineError::Status {
                status: 503,
                body: "engine unavailable".to_string(),
            });
        }

        let batch: Vec<Task> = {
            let mut queue = self.queue.lock().unwrap();
            let n = (max_tasks as usize).min(queue.len());
            queue.drain(..n).collect()
        };

        if batch.is_empty() {
            let delay = *self.poll_delay.lock().unwrap();
            tokio::time::sleep(delay).await;
        }
        Ok(batch)
    }

    async fn complete(&self, task_id: &str, variables: &Variables) -> Result<(), EngineError> {
        if Self::take_budget(&self.failing_acks) {
            return Err(EngineError::Status {
                status: 503,
                body: "engine unavailable".to_string(),
            });
        }
        if self.not_found_tasks.lock().unwrap().contains(task_id) {
            return Err(EngineError::NotFound(task_id.to_string()));
        }
        self.completions
            .lock()
            .unwrap()
            .push((task_id.to_string(), variables.clone()));
        Ok(())
    }

    async fn report_failure(
        &self,
        task_id: &str,
        error_message: &str,
        error_details: &str,
        retries: i32,
        retry_timeout_ms: u64,
    ) -> Result<(), EngineError> {
        if Self::take_budget(&self.failing_acks) {
            return Err(EngineError::Status {
                status: 503,
                body: "engine unavailable".to_string(),
            });
        }
        self.failures.lock().unwrap().push(FailureRecord {
            task_id: task_id.to_string(),
            error_message: error_message.to_string(),
            error_details: error_details.to_string(),
            retries,
            retry_timeout_ms,
        });
        Ok(())
    }

    async fn extension_properties(
        &self,
        process_definition_id: &str,
        activity_id: &str,
    ) -> Result<HashMap<String, String>, EngineError> {
        Ok(self
            .properties
            .lock()
            .unwrap()
            .get(&(process_definition_id.to_string(), activity_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}

enum Scripted {
    Success(Variables),
    Error(InvokeError),
    Panic,
}

type ErrorFactory = Box<dyn Fn() -> InvokeError + Send + Sync>;

/// Mock downstream invoker. A script of per-call outcomes is consumed
/// first; after that the default outcome applies. Tracks the peak number
/// of concurrent invocations for concurrency-ceiling assertions.
pub struct MockInvoker {
    script: Mutex<VecDeque<Scripted>>,
    default_success: Mutex<Variables>,
    default_error: Mutex<Option<ErrorFactory>>,
    requests: Mutex<Vec<InvokeRequest>>,
    delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockInvoker {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_success: Mutex::new(Variables::new()),
            default_error: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            delay: Mutex::new(Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Default outcome for unscripted calls.
    pub fn set_success(&self, variables: Variables) {
        *self.default_success.lock().unwrap() = variables;
        *self.default_error.lock().unwrap() = None;
    }

    pub fn set_error<F>(&self, factory: F)
    where
        F: Fn() -> InvokeError + Send + Sync + 'static,
    {
        *self.default_error.lock().unwrap() = Some(Box::new(factory));
    }

    /// Queue a one-shot outcome, consumed in call order before defaults.
    pub fn push_success(&self, variables: Variables) {
        self.script
            .lock()
            .unwrap()
            .push_back(Scripted::Success(variables));
    }

    pub fn push_error(&self, error: InvokeError) {
        self.script.lock().unwrap().push_back(Scripted::Error(error));
    }

    pub fn push_panic(&self) {
        self.script.lock().unwrap().push_back(Scripted::Panic);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn invocations(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_request(&self) -> Option<InvokeRequest> {
        self.requests.lock().unwrap().last().cloned()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Default for MockInvoker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServiceInvoker for MockInvoker {
    async fn invoke(
        &self,
        _endpoint: &ServiceEndpoint,
        _operation: Option<&str>,
        request: &InvokeRequest,
    ) -> Result<Variables, InvokeError> {
        self.requests.lock().unwrap().push(request.clone());

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let scripted = self.script.lock().unwrap().pop_front();
        match scripted {
            Some(Scripted::Success(variables)) => Ok(variables),
            Some(Scripted::Error(error)) => Err(error),
            Some(Scripted::Panic) => panic!("scripted invoker panic"),
            None => {
                if let Some(factory) = self.default_error.lock().unwrap().as_ref() {
                    return Err(factory());
                }
                Ok(self.default_success.lock().unwrap().clone())
            }
        }
    }
}

/// Mock dynamic service directory with a lookup counter.
pub struct MockDirectory {
    entries: Mutex<HashMap<String, String>>,
    lookups: AtomicUsize,
}

impl MockDirectory {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            lookups: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, service_type: &str, service_name: &str, base_url: &str) {
        self.entries
            .lock()
            .unwrap()
            .insert(format!("{service_type}/{service_name}"), base_url.to_string());
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl Default for MockDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServiceDirectory for MockDirectory {
    async fn lookup(
        &self,
        service_type: ServiceType,
        service_name: &str,
        _service_version: Option<&str>,
    ) -> Option<String> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.entries
            .lock()
            .unwrap()
            .get(&format!("{service_type}/{service_name}"))
            .cloned()
    }
}

/// Mock conversation service: handles are `thread-<n>`, expirable
/// out-of-band with `expire`.
pub struct MockThreadService {
    counter: AtomicUsize,
    live: Mutex<HashSet<String>>,
    create_delay: Mutex<Duration>,
}

impl MockThreadService {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
            live: Mutex::new(HashSet::new()),
            create_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Delete a handle out-of-band, as the downstream service might.
    pub fn expire(&self, handle: &str) {
        self.live.lock().unwrap().remove(handle);
    }

    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = delay;
    }

    pub fn creates(&self) -> usize {
        self.counter.load(Ordering::SeqCst)
    }
}

impl Default for MockThreadService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ThreadService for MockThreadService {
    async fn create_thread(&self, _assistant_id: &str) -> Result<String, ThreadError> {
        let delay = *self.create_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = format!("thread-{n}");
        self.live.lock().unwrap().insert(handle.clone());
        Ok(handle)
    }

    async fn validate_thread(&self, handle: &str) -> Result<bool, ThreadError> {
        Ok(self.live.lock().unwrap().contains(handle))
    }
}
