use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

use exttask_worker::{
    Dispatcher, EngineClient, HttpDirectory, HttpInvoker, HttpThreadService, ServiceDirectory,
    ServiceRegistry, ThreadManager, Worker, WorkerConfig, WorkerError,
};

#[derive(Parser)]
#[command(
    name = "exttask-worker",
    about = "External-task worker: polls a BPMN engine and orchestrates downstream services"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the worker. Ctrl-C triggers a graceful drain.
    Run {
        /// Path to YAML worker configuration
        #[arg(long)]
        config: PathBuf,

        /// Override the engine base URL
        #[arg(long)]
        engine_url: Option<String>,

        /// Override the worker identity
        #[arg(long)]
        worker_id: Option<String>,

        /// Override the dispatch concurrency ceiling
        #[arg(long)]
        max_concurrent: Option<usize>,
    },
    /// List the topics this worker would subscribe to.
    Topics {
        /// Path to YAML worker configuration
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    match run().await {
        Ok(()) => ExitCode::from(0),
        Err(e) => {
            error!(error = %e, "worker error");
            ExitCode::from(1)
        }
    }
}

async fn run() -> Result<(), WorkerError> {
    let cli = Cli::parse();

    match cli.command {
        Command::Topics { config } => {
            let config = WorkerConfig::load(&config)?;
            for topic in &config.topics {
                println!("{} (lock {}ms)", topic.name, topic.lock_duration_ms);
            }
            Ok(())
        }
        Command::Run {
            config,
            engine_url,
            worker_id,
            max_concurrent,
        } => {
            let mut config = WorkerConfig::load(&config)?;
            if let Some(url) = engine_url {
                config.engine_url = url;
            }
            if let Some(id) = worker_id {
                config.worker_id = id;
            }
            if let Some(n) = max_concurrent {
                config.max_concurrent = n;
            }
            config.validate()?;

            let engine = Arc::new(EngineClient::new(
                &config.engine_url,
                &config.worker_id,
                config.topics.clone(),
                config.async_response_timeout(),
                config.request_timeout(),
            ));

            let directory: Option<Arc<dyn ServiceDirectory>> = config
                .registry
                .directory_url
                .as_deref()
                .map(|url| {
                    Arc::new(HttpDirectory::new(url, config.request_timeout()))
                        as Arc<dyn ServiceDirectory>
                });
            let registry = Arc::new(ServiceRegistry::new(config.registry.clone(), directory));

            let threads = config.thread_service_url.as_deref().map(|url| {
                Arc::new(ThreadManager::new(Arc::new(HttpThreadService::new(
                    url,
                    config.request_timeout(),
                ))))
            });

            let invoker = Arc::new(HttpInvoker::new(config.request_timeout()));
            let dispatcher = Arc::new(Dispatcher::new(
                engine.clone(),
                registry,
                threads,
                invoker,
                config.conversational_types.clone(),
            ));

            let worker = Worker::new(config, engine, dispatcher);
            let shutdown = worker.shutdown_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown signal received");
                    shutdown.signal();
                }
            });

            worker.run().await
        }
    }
}
