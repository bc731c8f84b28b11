//! Worker Loop: owns the poll/lock/dispatch/acknowledge cycle, the
//! concurrency ceiling, per-task lock deadlines, and graceful shutdown.
//!
//! Lifecycle: Stopped -> Starting -> Polling/Dispatching -> Draining ->
//! Stopped. Polling and dispatching coexist; draining is entered only on
//! a shutdown signal.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::dispatcher::Dispatcher;
use crate::engine::EngineApi;
use crate::error::WorkerError;
use crate::task::{DispatchResult, Task, Variables};

/// Requests a graceful shutdown of the worker it was taken from.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn signal(&self) {
        let _ = self.tx.send(true);
    }
}

/// Terminal state of one dispatch unit.
enum UnitOutcome {
    Dispatched(DispatchResult),
    /// The unit would have outlived the task's lock; cancelled proactively
    /// rather than risking silent lock expiry and duplicate dispatch.
    Deadline,
    Panicked(String),
    Shutdown,
}

/// Exponential poll backoff with jitter, reset on any successful fetch.
struct PollBackoff {
    consecutive: u32,
}

impl PollBackoff {
    const BASE_MS: u64 = 500;
    const CAP_MS: u64 = 30_000;

    fn new() -> Self {
        Self { consecutive: 0 }
    }

    fn reset(&mut self) {
        self.consecutive = 0;
    }

    fn consecutive(&self) -> u32 {
        self.consecutive
    }

    fn next_delay(&mut self) -> Duration {
        self.consecutive += 1;
        let exp = Self::BASE_MS
            .saturating_mul(1 << (self.consecutive - 1).min(6))
            .min(Self::CAP_MS);
        let jitter = rand::thread_rng().gen_range(0..=exp / 4);
        Duration::from_millis(exp + jitter)
    }
}

pub struct Worker {
    config: Arc<WorkerConfig>,
    engine: Arc<dyn EngineApi>,
    dispatcher: Arc<Dispatcher>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Worker {
    pub fn new(config: WorkerConfig, engine: Arc<dyn EngineApi>, dispatcher: Arc<Dispatcher>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config: Arc::new(config),
            engine,
            dispatcher,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Run until a shutdown signal, then drain and stop.
    pub async fn run(&self) -> Result<(), WorkerError> {
        info!(
            worker = %self.config.worker_id,
            topics = self.config.topics.len(),
            max_concurrent = self.config.max_concurrent,
            "worker starting"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent));
        let mut units: JoinSet<()> = JoinSet::new();
        // Second stage of shutdown: drain grace expired, abandon dispatch.
        let (force_tx, _) = watch::channel(false);
        let mut backoff = PollBackoff::new();
        let mut shutdown_rx = self.shutdown_rx.clone();

        'poll: loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }

            // Reap finished units so the set does not grow unbounded.
            while let Some(joined) = units.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "dispatch unit join error");
                }
            }

            let fetched = tokio::select! {
                fetched = self.engine.fetch_and_lock(self.config.max_tasks) => fetched,
                _ = shutdown_rx.changed() => break,
            };

            let tasks = match fetched {
                Ok(tasks) => {
                    backoff.reset();
                    tasks
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    if backoff.consecutive() > 3 {
                        error!(error = %e, attempts = backoff.consecutive(), "engine unreachable, backing off");
                    } else {
                        warn!(error = %e, "fetch-and-lock failed, backing off");
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = shutdown_rx.changed() => break,
                    }
                }
            };

            if !tasks.is_empty() {
                debug!(count = tasks.len(), "locked tasks");
            }

            let mut tasks = tasks.into_iter();
            while let Some(task) = tasks.next() {
                // Over the ceiling, fetched tasks wait here rather than
                // being dropped.
                let permit = tokio::select! {
                    permit = semaphore.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break 'poll,
                    },
                    _ = shutdown_rx.changed() => {
                        // These tasks are locked but will never run; hand
                        // them back promptly instead of waiting out the
                        // lock.
                        self.acknowledge(&task, UnitOutcome::Shutdown).await;
                        for task in tasks.by_ref() {
                            self.acknowledge(&task, UnitOutcome::Shutdown).await;
                        }
                        break 'poll;
                    }
                };

                let dispatcher = self.dispatcher.clone();
                let engine = self.engine.clone();
                let config = self.config.clone();
                let mut force_rx = force_tx.subscribe();
                let deadline = self.dispatch_deadline(&task);

                units.spawn(async move {
                    let _permit = permit;
                    let task_for_dispatch = task.clone();
                    // The nested spawn isolates a panicking dispatch so
                    // the task still gets exactly one acknowledgment.
                    let mut dispatch = tokio::spawn(async move {
                        timeout(deadline, dispatcher.dispatch(&task_for_dispatch)).await
                    });

                    let outcome = tokio::select! {
                        joined = &mut dispatch => match joined {
                            Ok(Ok(result)) => UnitOutcome::Dispatched(result),
                            Ok(Err(_)) => UnitOutcome::Deadline,
                            Err(e) => UnitOutcome::Panicked(e.to_string()),
                        },
                        _ = force_rx.changed() => {
                            dispatch.abort();
                            UnitOutcome::Shutdown
                        }
                    };

                    acknowledge(engine.as_ref(), &config, &task, outcome).await;
                });
            }
        }

        info!("draining in-flight dispatch units");
        let grace = self.config.shutdown_grace();
        let drained = timeout(grace, async {
            while let Some(joined) = units.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "dispatch unit join error");
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(grace_ms = grace.as_millis() as u64, "grace period expired, force-failing remaining tasks");
            let _ = force_tx.send(true);
            while let Some(joined) = units.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "dispatch unit join error");
                }
            }
        }

        info!("worker stopped");
        Ok(())
    }

    /// Overall deadline for one dispatch: the topic's lock duration minus
    /// the safety margin.
    fn dispatch_deadline(&self, task: &Task) -> Duration {
        let lock = self
            .config
            .topic(&task.topic_name)
            .map(|t| t.lock_duration())
            .unwrap_or(Duration::from_millis(60_000));
        lock.saturating_sub(self.config.lock_safety_margin())
            .max(Duration::from_millis(100))
    }

    async fn acknowledge(&self, task: &Task, outcome: UnitOutcome) {
        acknowledge(self.engine.as_ref(), &self.config, task, outcome).await;
    }
}

enum Ack {
    Complete(Variables),
    Failure {
        message: String,
        details: String,
        retries: i32,
        retry_timeout_ms: u64,
    },
}

/// Map a unit outcome to exactly one engine acknowledgment and deliver it
/// with bounded retries. A dropped acknowledgment is logged and accepted:
/// the task is reclaimed via lock expiry (documented at-least-once risk).
async fn acknowledge(
    engine: &dyn EngineApi,
    config: &WorkerConfig,
    task: &Task,
    outcome: UnitOutcome,
) {
    let remaining = task.retries.unwrap_or(config.default_retries);
    let ack = match outcome {
        UnitOutcome::Dispatched(DispatchResult::Success(variables)) => Ack::Complete(variables),
        UnitOutcome::Dispatched(DispatchResult::Retryable { message, details }) => Ack::Failure {
            message,
            details,
            retries: (remaining - 1).max(0),
            retry_timeout_ms: config.retry_timeout_ms,
        },
        UnitOutcome::Dispatched(DispatchResult::Fatal { message }) => Ack::Failure {
            message,
            details: String::new(),
            // Zero retries makes the engine raise an incident for human
            // attention instead of looping.
            retries: 0,
            retry_timeout_ms: 0,
        },
        UnitOutcome::Deadline => Ack::Failure {
            message: "dispatch exceeded lock deadline".to_string(),
            details: String::new(),
            retries: (remaining - 1).max(0),
            retry_timeout_ms: config.retry_timeout_ms,
        },
        UnitOutcome::Panicked(details) => Ack::Failure {
            message: "dispatch unit panicked".to_string(),
            details,
            retries: (remaining - 1).max(0),
            retry_timeout_ms: config.retry_timeout_ms,
        },
        UnitOutcome::Shutdown => Ack::Failure {
            message: "worker shutting down".to_string(),
            details: String::new(),
            // Not the task's fault: keep its retry budget and let the
            // engine hand it to another worker immediately.
            retries: remaining.max(1),
            retry_timeout_ms: 0,
        },
    };

    for attempt in 1..=config.ack_attempts {
        let result = match &ack {
            Ack::Complete(variables) => engine.complete(&task.id, variables).await,
            Ack::Failure {
                message,
                details,
                retries,
                retry_timeout_ms,
            } => {
                engine
                    .report_failure(&task.id, message, details, *retries, *retry_timeout_ms)
                    .await
            }
        };

        match result {
            Ok(()) => return,
            Err(e) if !e.is_retryable() => {
                // 404/409: the task raced away from us (lock expiry).
                warn!(task = %task.id, error = %e, "acknowledgment rejected, task no longer ours");
                return;
            }
            Err(e) => {
                warn!(task = %task.id, attempt, error = %e, "acknowledgment failed");
                if attempt < config.ack_attempts {
                    tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
                }
            }
        }
    }

    warn!(
        task = %task.id,
        "dropping acknowledgment; task will be reclaimed via lock expiry"
    );
}
