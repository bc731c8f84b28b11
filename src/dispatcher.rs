//! Task Dispatcher: converts one locked task into one `DispatchResult`.
//!
//! The dispatcher never talks back to the engine; dispatch and
//! acknowledgment are separate, sequential steps owned by the worker loop.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::engine::EngineApi;
use crate::invoker::{InvokeError, InvokeRequest, ServiceInvoker, ThreadContext};
use crate::registry::{Health, ServiceRegistry};
use crate::task::{DispatchResult, ServiceBinding, ServiceType, Task};
use crate::threads::ThreadManager;

pub struct Dispatcher {
    engine: Arc<dyn EngineApi>,
    registry: Arc<ServiceRegistry>,
    threads: Option<Arc<ThreadManager>>,
    invoker: Arc<dyn ServiceInvoker>,
    conversational_types: HashSet<ServiceType>,
}

impl Dispatcher {
    pub fn new(
        engine: Arc<dyn EngineApi>,
        registry: Arc<ServiceRegistry>,
        threads: Option<Arc<ThreadManager>>,
        invoker: Arc<dyn ServiceInvoker>,
        conversational_types: HashSet<ServiceType>,
    ) -> Self {
        Self {
            engine,
            registry,
            threads,
            invoker,
            conversational_types,
        }
    }

    /// Run the per-task state machine to a terminal `DispatchResult`.
    pub async fn dispatch(&self, task: &Task) -> DispatchResult {
        let result = self.try_dispatch(task).await;
        info!(
            task = %task.id,
            topic = %task.topic_name,
            outcome = result.outcome_label(),
            "dispatch finished"
        );
        result
    }

    async fn try_dispatch(&self, task: &Task) -> DispatchResult {
        // Routing metadata comes from the activity's cached extension
        // properties; a fetch failure is transient, a parse failure is not.
        let props = match self
            .engine
            .extension_properties(&task.process_definition_id, &task.activity_id)
            .await
        {
            Ok(props) => props,
            Err(e) if e.is_retryable() => {
                return DispatchResult::Retryable {
                    message: "failed to load extension properties".to_string(),
                    details: e.to_string(),
                }
            }
            Err(e) => {
                return DispatchResult::Fatal {
                    message: format!("unusable process definition: {e}"),
                }
            }
        };

        let binding = match ServiceBinding::from_properties(&props) {
            Ok(binding) => binding,
            Err(e) => {
                return DispatchResult::Fatal {
                    message: format!("activity '{}': {e}", task.activity_id),
                }
            }
        };

        let endpoint = match self
            .registry
            .resolve(
                binding.service_type,
                &binding.service_name,
                binding.service_version.as_deref(),
            )
            .await
        {
            Ok(endpoint) => endpoint,
            Err(e) => return DispatchResult::Fatal { message: e.to_string() },
        };

        if endpoint.health == Health::Unhealthy {
            // Fail fast instead of waiting on a dead connection; drop the
            // entry so the next attempt re-resolves.
            warn!(task = %task.id, endpoint = %endpoint.base_url, "endpoint flagged unhealthy");
            self.registry
                .invalidate(binding.service_type, &binding.service_name);
            return DispatchResult::Retryable {
                message: format!("endpoint {} flagged unhealthy", endpoint.base_url),
                details: String::new(),
            };
        }

        let context = match self.thread_context(task, &binding).await {
            Ok(context) => context,
            Err(result) => return result,
        };

        let request = InvokeRequest {
            task_id: task.id.clone(),
            variables: task.variables.clone(),
            context,
        };

        match self
            .invoker
            .invoke(&endpoint, binding.operation.as_deref(), &request)
            .await
        {
            Ok(variables) => DispatchResult::Success(variables),
            Err(InvokeError::Connectivity(details)) => {
                // The service may have restarted on a new address.
                self.registry
                    .invalidate(binding.service_type, &binding.service_name);
                DispatchResult::Retryable {
                    message: format!("cannot reach {}", endpoint.base_url),
                    details,
                }
            }
            Err(InvokeError::Server { status, body }) => {
                self.registry.mark_health(
                    binding.service_type,
                    &binding.service_name,
                    Health::Unhealthy,
                );
                DispatchResult::Retryable {
                    message: format!("downstream returned {status}"),
                    details: body,
                }
            }
            Err(InvokeError::Client { status, body }) => DispatchResult::Fatal {
                message: format!("downstream rejected request ({status}): {body}"),
            },
            Err(InvokeError::Contract(details)) => DispatchResult::Fatal {
                message: format!("downstream contract violation: {details}"),
            },
        }
    }

    async fn thread_context(
        &self,
        task: &Task,
        binding: &ServiceBinding,
    ) -> Result<Option<ThreadContext>, DispatchResult> {
        if !self.conversational_types.contains(&binding.service_type) {
            return Ok(None);
        }

        let Some(threads) = &self.threads else {
            return Err(DispatchResult::Fatal {
                message: format!(
                    "service type '{}' needs conversation context but no thread service is configured",
                    binding.service_type
                ),
            });
        };

        match threads
            .get_or_create(&task.process_instance_id, &binding.service_name)
            .await
        {
            Ok(thread_id) => Ok(Some(ThreadContext {
                thread_id,
                assistant_id: binding.service_name.clone(),
            })),
            Err(e) => Err(DispatchResult::Retryable {
                message: "conversation thread unavailable".to_string(),
                details: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use crate::mock::{MockEngine, MockInvoker, MockThreadService};
    use crate::task::{TypedVariable, Variables};

    fn task(topic: &str, activity: &str) -> Task {
        Task {
            id: "task1".to_string(),
            topic_name: topic.to_string(),
            process_instance_id: "P1".to_string(),
            process_definition_id: "def1".to_string(),
            activity_id: activity.to_string(),
            retries: None,
            variables: Variables::new(),
        }
    }

    fn registry(static_entries: &[(&str, &str)]) -> Arc<ServiceRegistry> {
        let config = RegistryConfig {
            static_table: static_entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..RegistryConfig::default()
        };
        Arc::new(ServiceRegistry::new(config, None))
    }

    fn dispatcher(
        engine: Arc<MockEngine>,
        registry: Arc<ServiceRegistry>,
        threads: Option<Arc<ThreadManager>>,
        invoker: Arc<MockInvoker>,
    ) -> Dispatcher {
        Dispatcher::new(
            engine,
            registry,
            threads,
            invoker,
            HashSet::from([ServiceType::Assistant]),
        )
    }

    #[tokio::test]
    async fn success_maps_output_variables() {
        let engine = Arc::new(MockEngine::new());
        engine.set_properties(
            "def1",
            "Activity_scan",
            &[("service.type", "analysis"), ("service.name", "scanner")],
        );
        let invoker = Arc::new(MockInvoker::new());
        let mut output = Variables::new();
        output.insert("result".to_string(), TypedVariable::string("clean"));
        invoker.set_success(output.clone());

        let d = dispatcher(
            engine,
            registry(&[("analysis/scanner", "http://svc:9100")]),
            None,
            invoker.clone(),
        );

        let result = d.dispatch(&task("analysis.scan", "Activity_scan")).await;
        assert_eq!(result, DispatchResult::Success(output));
        assert_eq!(invoker.invocations(), 1);
    }

    #[tokio::test]
    async fn missing_binding_is_fatal() {
        let engine = Arc::new(MockEngine::new());
        engine.set_properties("def1", "Activity_bare", &[("service.type", "analysis")]);
        let invoker = Arc::new(MockInvoker::new());

        let d = dispatcher(engine, registry(&[]), None, invoker.clone());
        let result = d.dispatch(&task("t", "Activity_bare")).await;

        assert!(matches!(result, DispatchResult::Fatal { .. }));
        assert_eq!(invoker.invocations(), 0);
    }

    #[tokio::test]
    async fn unresolved_service_is_fatal() {
        let engine = Arc::new(MockEngine::new());
        engine.set_properties(
            "def1",
            "Activity_scan",
            &[("service.type", "analysis"), ("service.name", "ghost")],
        );
        let d = dispatcher(engine, registry(&[]), None, Arc::new(MockInvoker::new()));

        let result = d.dispatch(&task("t", "Activity_scan")).await;
        match result {
            DispatchResult::Fatal { message } => assert!(message.contains("ghost")),
            other => panic!("expected Fatal, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn connectivity_failure_is_retryable_and_invalidates() {
        let engine = Arc::new(MockEngine::new());
        engine.set_properties(
            "def1",
            "Activity_scan",
            &[("service.type", "analysis"), ("service.name", "scanner")],
        );
        let invoker = Arc::new(MockInvoker::new());
        invoker.set_error(|| InvokeError::Connectivity("connection refused".to_string()));

        let registry = registry(&[("analysis/scanner", "http://svc:9100")]);
        let d = dispatcher(engine, registry.clone(), None, invoker);

        let result = d.dispatch(&task("t", "Activity_scan")).await;
        assert!(matches!(result, DispatchResult::Retryable { .. }));
        // The entry was invalidated: next resolve goes back to the sources.
        let endpoint = registry
            .resolve(ServiceType::Analysis, "scanner", None)
            .await
            .unwrap();
        assert_eq!(endpoint.health, Health::Unknown);
    }

    #[tokio::test]
    async fn client_error_is_fatal() {
        let engine = Arc::new(MockEngine::new());
        engine.set_properties(
            "def1",
            "Activity_scan",
            &[("service.type", "analysis"), ("service.name", "scanner")],
        );
        let invoker = Arc::new(MockInvoker::new());
        invoker.set_error(|| InvokeError::Client {
            status: 400,
            body: "bad request".to_string(),
        });

        let d = dispatcher(
            engine,
            registry(&[("analysis/scanner", "http://svc:9100")]),
            None,
            invoker,
        );
        let result = d.dispatch(&task("t", "Activity_scan")).await;
        assert!(matches!(result, DispatchResult::Fatal { .. }));
    }

    #[tokio::test]
    async fn malformed_downstream_response_is_fatal() {
        let engine = Arc::new(MockEngine::new());
        engine.set_properties(
            "def1",
            "Activity_scan",
            &[("service.type", "analysis"), ("service.name", "scanner")],
        );
        let invoker = Arc::new(MockInvoker::new());
        // 2xx with a body that fails to parse: the contract is broken, a
        // retry cannot help.
        invoker.set_error(|| {
            InvokeError::Contract("bad response body: missing field `variables`".to_string())
        });

        let d = dispatcher(
            engine,
            registry(&[("analysis/scanner", "http://svc:9100")]),
            None,
            invoker.clone(),
        );
        let result = d.dispatch(&task("t", "Activity_scan")).await;
        match result {
            DispatchResult::Fatal { message } => {
                assert!(message.contains("contract violation"));
            }
            other => panic!("expected Fatal, got: {other:?}"),
        }
        assert_eq!(invoker.invocations(), 1);
    }

    #[tokio::test]
    async fn server_error_is_retryable_and_marks_unhealthy() {
        let engine = Arc::new(MockEngine::new());
        engine.set_properties(
            "def1",
            "Activity_scan",
            &[("service.type", "analysis"), ("service.name", "scanner")],
        );
        let invoker = Arc::new(MockInvoker::new());
        invoker.set_error(|| InvokeError::Server {
            status: 503,
            body: String::new(),
        });

        let registry = registry(&[("analysis/scanner", "http://svc:9100")]);
        let d = dispatcher(engine, registry.clone(), None, invoker);

        let result = d.dispatch(&task("t", "Activity_scan")).await;
        assert!(matches!(result, DispatchResult::Retryable { .. }));
        let endpoint = registry
            .resolve(ServiceType::Analysis, "scanner", None)
            .await
            .unwrap();
        assert_eq!(endpoint.health, Health::Unhealthy);
    }

    #[tokio::test]
    async fn conversational_task_is_enriched_with_thread() {
        let engine = Arc::new(MockEngine::new());
        engine.set_properties(
            "def1",
            "Activity_review",
            &[("service.type", "assistant"), ("service.name", "reviewer")],
        );
        let thread_service = Arc::new(MockThreadService::new());
        let threads = Arc::new(ThreadManager::new(thread_service.clone()));
        let invoker = Arc::new(MockInvoker::new());

        let d = dispatcher(
            engine,
            registry(&[("assistant/reviewer", "http://svc:9000")]),
            Some(threads),
            invoker.clone(),
        );

        d.dispatch(&task("assistant.review", "Activity_review")).await;

        let request = invoker.last_request().unwrap();
        let context = request.context.unwrap();
        assert_eq!(context.assistant_id, "reviewer");
        assert_eq!(thread_service.creates(), 1);
    }

    #[tokio::test]
    async fn non_conversational_task_has_no_context() {
        let engine = Arc::new(MockEngine::new());
        engine.set_properties(
            "def1",
            "Activity_scan",
            &[("service.type", "analysis"), ("service.name", "scanner")],
        );
        let invoker = Arc::new(MockInvoker::new());

        let d = dispatcher(
            engine,
            registry(&[("analysis/scanner", "http://svc:9100")]),
            None,
            invoker.clone(),
        );
        d.dispatch(&task("analysis.scan", "Activity_scan")).await;

        assert!(invoker.last_request().unwrap().context.is_none());
    }

    #[tokio::test]
    async fn conversational_without_thread_service_is_fatal() {
        let engine = Arc::new(MockEngine::new());
        engine.set_properties(
            "def1",
            "Activity_review",
            &[("service.type", "assistant"), ("service.name", "reviewer")],
        );
        let d = dispatcher(
            engine,
            registry(&[("assistant/reviewer", "http://svc:9000")]),
            None,
            Arc::new(MockInvoker::new()),
        );

        let result = d.dispatch(&task("assistant.review", "Activity_review")).await;
        assert!(matches!(result, DispatchResult::Fatal { .. }));
    }
}
