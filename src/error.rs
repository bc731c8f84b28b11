use std::io;

/// Errors produced by the external-task worker. Task-level failures never
/// surface here; they are acknowledged to the engine per task.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io: {0}")]
    Io(#[from] io::Error),
}
