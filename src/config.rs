use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use crate::error::WorkerError;
use crate::task::ServiceType;

/// One subscribed topic: its name, how long fetched tasks stay locked, and
/// an optional variable-name filter (absent = fetch all variables).
#[derive(Debug, Clone, Deserialize)]
pub struct TopicConfig {
    pub name: String,
    #[serde(default = "default_lock_duration_ms")]
    pub lock_duration_ms: u64,
    #[serde(default)]
    pub variables: Option<Vec<String>>,
}

impl TopicConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            lock_duration_ms: default_lock_duration_ms(),
            variables: None,
        }
    }

    pub fn lock_duration(&self) -> Duration {
        Duration::from_millis(self.lock_duration_ms)
    }
}

/// Endpoint resolution sources. Static table entries are keyed
/// `"<type>/<name>"` (or `"<type>/<name>@<version>"` for a version pin)
/// and always win over the dynamic directory.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub static_table: HashMap<String, String>,
    #[serde(default)]
    pub fallback_table: HashMap<String, String>,
    #[serde(default)]
    pub directory_url: Option<String>,
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            static_table: HashMap::new(),
            fallback_table: HashMap::new(),
            directory_url: None,
            cache_ttl_ms: default_cache_ttl_ms(),
        }
    }
}

impl RegistryConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

/// Worker configuration, loaded from YAML with CLI overrides on top.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub engine_url: String,
    pub topics: Vec<TopicConfig>,
    pub max_tasks: u32,
    pub max_concurrent: usize,
    pub async_response_timeout_ms: u64,
    pub lock_safety_margin_ms: u64,
    pub default_retries: i32,
    pub retry_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    pub ack_attempts: u32,
    pub registry: RegistryConfig,
    /// Service types whose requests are enriched with a conversation thread.
    pub conversational_types: HashSet<ServiceType>,
    pub thread_service_url: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", ulid::Ulid::new().to_string().to_lowercase()),
            engine_url: "http://localhost:8080/engine-rest".to_string(),
            topics: Vec::new(),
            max_tasks: 10,
            max_concurrent: 8,
            async_response_timeout_ms: 30_000,
            lock_safety_margin_ms: 5_000,
            default_retries: 3,
            retry_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
            shutdown_grace_ms: 10_000,
            ack_attempts: 3,
            registry: RegistryConfig::default(),
            conversational_types: HashSet::from([ServiceType::Assistant]),
            thread_service_url: None,
        }
    }
}

impl WorkerConfig {
    pub fn load(path: &Path) -> Result<Self, WorkerError> {
        let bytes = std::fs::read(path)?;
        let config: Self = serde_yaml::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), WorkerError> {
        if self.engine_url.is_empty() {
            return Err(WorkerError::Config("engine_url must be set".into()));
        }
        if self.topics.is_empty() {
            return Err(WorkerError::Config("at least one topic required".into()));
        }
        if self.max_concurrent == 0 {
            return Err(WorkerError::Config("max_concurrent must be > 0".into()));
        }
        if self.max_tasks == 0 {
            return Err(WorkerError::Config("max_tasks must be > 0".into()));
        }
        for topic in &self.topics {
            if topic.lock_duration_ms <= self.lock_safety_margin_ms {
                return Err(WorkerError::Config(format!(
                    "topic '{}': lock_duration_ms {} must exceed lock_safety_margin_ms {}",
                    topic.name, topic.lock_duration_ms, self.lock_safety_margin_ms
                )));
            }
        }
        Ok(())
    }

    pub fn topic(&self, name: &str) -> Option<&TopicConfig> {
        self.topics.iter().find(|t| t.name == name)
    }

    pub fn async_response_timeout(&self) -> Duration {
        Duration::from_millis(self.async_response_timeout_ms)
    }

    pub fn lock_safety_margin(&self) -> Duration {
        Duration::from_millis(self.lock_safety_margin_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

fn default_lock_duration_ms() -> u64 {
    60_000
}

fn default_cache_ttl_ms() -> u64 {
    300_000
}
