//! Service Registry: maps a service binding to a live endpoint.
//!
//! Resolution order is static table, then dynamic directory, then fallback
//! table. Static entries are the operator override and always win. Results
//! are cached with a TTL; the dispatcher invalidates entries after
//! connectivity failures so a restarted service is re-resolved.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::RegistryConfig;
use crate::task::ServiceType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Resolved network target for a service binding.
#[derive(Debug, Clone)]
pub struct ServiceEndpoint {
    pub base_url: String,
    pub health: Health,
    pub resolved_at: Instant,
}

impl ServiceEndpoint {
    fn new(base_url: String) -> Self {
        Self {
            base_url,
            health: Health::Unknown,
            resolved_at: Instant::now(),
        }
    }
}

/// No source could resolve the binding. Fatal for the task: a missing
/// service binding will not fix itself.
#[derive(Debug, Clone, thiserror::Error)]
#[error("no endpoint for service {service_type}/{service_name}")]
pub struct UnresolvedService {
    pub service_type: ServiceType,
    pub service_name: String,
}

/// Dynamic service-directory source. Implementations treat their own
/// transport errors as a miss (logged), so resolution falls through to
/// the fallback table.
#[async_trait]
pub trait ServiceDirectory: Send + Sync {
    async fn lookup(
        &self,
        service_type: ServiceType,
        service_name: &str,
        service_version: Option<&str>,
    ) -> Option<String>;
}

/// HTTP directory client: `GET {base}/services/{type}/{name}` returning
/// `{"baseUrl": ".."}`.
pub struct HttpDirectory {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpDirectory {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl ServiceDirectory for HttpDirectory {
    async fn lookup(
        &self,
        service_type: ServiceType,
        service_name: &str,
        service_version: Option<&str>,
    ) -> Option<String> {
        #[derive(serde::Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Entry {
            base_url: String,
        }

        let mut request = self
            .client
            .get(format!(
                "{}/services/{service_type}/{service_name}",
                self.base_url
            ))
            .timeout(self.timeout);
        if let Some(version) = service_version {
            request = request.query(&[("version", version)]);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                response.json::<Entry>().await.ok().map(|e| e.base_url)
            }
            Ok(response) => {
                debug!(
                    service = %service_name,
                    status = response.status().as_u16(),
                    "directory miss"
                );
                None
            }
            Err(e) => {
                warn!(service = %service_name, error = %e, "directory lookup failed");
                None
            }
        }
    }
}

type CacheKey = (ServiceType, String, Option<String>);

/// TTL-cached endpoint resolution over static config, dynamic directory,
/// and a hardcoded fallback table.
pub struct ServiceRegistry {
    config: RegistryConfig,
    directory: Option<Arc<dyn ServiceDirectory>>,
    cache: Mutex<HashMap<CacheKey, ServiceEndpoint>>,
    ttl: Duration,
}

impl ServiceRegistry {
    pub fn new(config: RegistryConfig, directory: Option<Arc<dyn ServiceDirectory>>) -> Self {
        let ttl = config.cache_ttl();
        Self {
            config,
            directory,
            cache: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Table key, most specific first: `type/name@version`, then `type/name`.
    fn table_lookup(
        table: &HashMap<String, String>,
        service_type: ServiceType,
        name: &str,
        version: Option<&str>,
    ) -> Option<String> {
        if let Some(version) = version {
            if let Some(url) = table.get(&format!("{service_type}/{name}@{version}")) {
                return Some(url.clone());
            }
        }
        table.get(&format!("{service_type}/{name}")).cloned()
    }

    pub async fn resolve(
        &self,
        service_type: ServiceType,
        service_name: &str,
        service_version: Option<&str>,
    ) -> Result<ServiceEndpoint, UnresolvedService> {
        let key: CacheKey = (
            service_type,
            service_name.to_string(),
            service_version.map(str::to_string),
        );

        if let Some(cached) = self.cache.lock().unwrap().get(&key) {
            if cached.resolved_at.elapsed() < self.ttl {
                return Ok(cached.clone());
            }
        }

        let base_url = Self::table_lookup(
            &self.config.static_table,
            service_type,
            service_name,
            service_version,
        );

        let base_url = match base_url {
            Some(url) => Some(url),
            None => match &self.directory {
                Some(directory) => {
                    directory
                        .lookup(service_type, service_name, service_version)
                        .await
                }
                None => None,
            },
        };

        let base_url = base_url.or_else(|| {
            Self::table_lookup(
                &self.config.fallback_table,
                service_type,
                service_name,
                service_version,
            )
        });

        match base_url {
            Some(url) => {
                debug!(service = %service_name, endpoint = %url, "resolved service");
                let endpoint = ServiceEndpoint::new(url);
                self.cache.lock().unwrap().insert(key, endpoint.clone());
                Ok(endpoint)
            }
            None => Err(UnresolvedService {
                service_type,
                service_name: service_name.to_string(),
            }),
        }
    }

    /// Drop every cached endpoint for the service so the next `resolve`
    /// hits the sources again. Called after connectivity failures.
    pub fn invalidate(&self, service_type: ServiceType, service_name: &str) {
        self.cache
            .lock()
            .unwrap()
            .retain(|(t, n, _), _| !(*t == service_type && n == service_name));
    }

    /// Flag cached endpoints without dropping them. The dispatcher fails
    /// fast on `Unhealthy` instead of waiting on a dead connection.
    pub fn mark_health(&self, service_type: ServiceType, service_name: &str, health: Health) {
        let mut cache = self.cache.lock().unwrap();
        for ((t, n, _), endpoint) in cache.iter_mut() {
            if *t == service_type && n == service_name {
                endpoint.health = health;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDirectory;

    fn registry_with(
        static_entries: &[(&str, &str)],
        fallback_entries: &[(&str, &str)],
        directory: Option<Arc<dyn ServiceDirectory>>,
        ttl_ms: u64,
    ) -> ServiceRegistry {
        let config = RegistryConfig {
            static_table: static_entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            fallback_table: fallback_entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            directory_url: None,
            cache_ttl_ms: ttl_ms,
        };
        ServiceRegistry::new(config, directory)
    }

    #[tokio::test]
    async fn static_config_beats_directory() {
        let directory = Arc::new(MockDirectory::new());
        directory.set("assistant", "reviewer", "http://dynamic:9000");

        let registry = registry_with(
            &[("assistant/reviewer", "http://static:9000")],
            &[],
            Some(directory.clone()),
            300_000,
        );

        let endpoint = registry
            .resolve(ServiceType::Assistant, "reviewer", None)
            .await
            .unwrap();
        assert_eq!(endpoint.base_url, "http://static:9000");
        assert_eq!(directory.lookups(), 0);
    }

    #[tokio::test]
    async fn directory_used_when_static_misses() {
        let directory = Arc::new(MockDirectory::new());
        directory.set("analysis", "scanner", "http://dynamic:9100");

        let registry = registry_with(&[], &[], Some(directory.clone()), 300_000);

        let endpoint = registry
            .resolve(ServiceType::Analysis, "scanner", None)
            .await
            .unwrap();
        assert_eq!(endpoint.base_url, "http://dynamic:9100");
        assert_eq!(directory.lookups(), 1);
    }

    #[tokio::test]
    async fn fallback_is_last_resort() {
        let directory = Arc::new(MockDirectory::new());
        let registry = registry_with(
            &[],
            &[("store/graph", "http://fallback:9200")],
            Some(directory),
            300_000,
        );

        let endpoint = registry
            .resolve(ServiceType::Store, "graph", None)
            .await
            .unwrap();
        assert_eq!(endpoint.base_url, "http://fallback:9200");
    }

    #[tokio::test]
    async fn unresolved_everywhere_is_an_error() {
        let registry = registry_with(&[], &[], None, 300_000);
        let err = registry
            .resolve(ServiceType::Assistant, "ghost", None)
            .await
            .unwrap_err();
        assert_eq!(err.service_name, "ghost");
    }

    #[tokio::test]
    async fn version_pin_wins_over_unversioned_entry() {
        let registry = registry_with(
            &[
                ("assistant/reviewer", "http://v-any:9000"),
                ("assistant/reviewer@2", "http://v2:9000"),
            ],
            &[],
            None,
            300_000,
        );

        let pinned = registry
            .resolve(ServiceType::Assistant, "reviewer", Some("2"))
            .await
            .unwrap();
        assert_eq!(pinned.base_url, "http://v2:9000");

        let any = registry
            .resolve(ServiceType::Assistant, "reviewer", None)
            .await
            .unwrap();
        assert_eq!(any.base_url, "http://v-any:9000");
    }

    #[tokio::test]
    async fn cache_serves_until_ttl_expires() {
        let directory = Arc::new(MockDirectory::new());
        directory.set("analysis", "scanner", "http://dynamic:9100");

        let registry = registry_with(&[], &[], Some(directory.clone()), 300_000);
        registry
            .resolve(ServiceType::Analysis, "scanner", None)
            .await
            .unwrap();
        registry
            .resolve(ServiceType::Analysis, "scanner", None)
            .await
            .unwrap();
        assert_eq!(directory.lookups(), 1);
    }

    #[tokio::test]
    async fn zero_ttl_forces_re_resolution() {
        let directory = Arc::new(MockDirectory::new());
        directory.set("analysis", "scanner", "http://dynamic:9100");

        let registry = registry_with(&[], &[], Some(directory.clone()), 0);
        registry
            .resolve(ServiceType::Analysis, "scanner", None)
            .await
            .unwrap();
        registry
            .resolve(ServiceType::Analysis, "scanner", None)
            .await
            .unwrap();
        assert_eq!(directory.lookups(), 2);
    }

    #[tokio::test]
    async fn invalidate_drops_cached_entry() {
        let directory = Arc::new(MockDirectory::new());
        directory.set("analysis", "scanner", "http://dynamic:9100");

        let registry = registry_with(&[], &[], Some(directory.clone()), 300_000);
        registry
            .resolve(ServiceType::Analysis, "scanner", None)
            .await
            .unwrap();
        registry.invalidate(ServiceType::Analysis, "scanner");
        registry
            .resolve(ServiceType::Analysis, "scanner", None)
            .await
            .unwrap();
        assert_eq!(directory.lookups(), 2);
    }

    #[tokio::test]
    async fn mark_health_flags_cached_endpoint() {
        let registry = registry_with(
            &[("assistant/reviewer", "http://static:9000")],
            &[],
            None,
            300_000,
        );
        registry
            .resolve(ServiceType::Assistant, "reviewer", None)
            .await
            .unwrap();
        registry.mark_health(ServiceType::Assistant, "reviewer", Health::Unhealthy);

        let endpoint = registry
            .resolve(ServiceType::Assistant, "reviewer", None)
            .await
            .unwrap();
        assert_eq!(endpoint.health, Health::Unhealthy);
    }
}
