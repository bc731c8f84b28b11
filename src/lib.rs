pub mod bpmn;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod invoker;
pub mod mock;
pub mod registry;
pub mod task;
pub mod threads;
pub mod worker;

pub use config::{RegistryConfig, TopicConfig, WorkerConfig};
pub use dispatcher::Dispatcher;
pub use engine::{EngineApi, EngineClient, EngineError};
pub use error::WorkerError;
pub use invoker::{HttpInvoker, InvokeError, InvokeRequest, ServiceInvoker, ThreadContext};
pub use registry::{
    Health, HttpDirectory, ServiceDirectory, ServiceEndpoint, ServiceRegistry, UnresolvedService,
};
pub use task::{DispatchResult, ServiceBinding, ServiceType, Task, TypedVariable, Variables};
pub use threads::{HttpThreadService, ThreadManager, ThreadService};
pub use worker::{ShutdownHandle, Worker};
