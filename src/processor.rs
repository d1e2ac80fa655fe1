// Copyright (c) 2025 - Cowboy AI, Inc.
//! Command Processor
//!
//! Runs commands against aggregates on a bounded pool of workers, using
//! optimistic concurrency: every attempt loads the current aggregate,
//! computes the next one, and tries to store it with a compare-and-swap. A
//! lost race sends the attempt back to loading.
//!
//! # Attempt State Machine
//!
//! ```text
//! Loading → Computing → Storing ─┬─ stored ──→ Success
//!    ↑                           └─ lost race → Retry ─┐
//!    └─────────────────────────────────────────────────┘
//!   any other error ──→ Fatal
//! ```
//!
//! # Concurrency Model
//!
//! - **No locks**: the processor never serializes commands. Two commands for
//!   the same identifier may race on two workers; the store's compare-and-swap
//!   is the only thing that orders them.
//! - **Bounded backlog**: submissions go through a bounded queue and fail
//!   synchronously with [`SubmitError::Rejected`] when it is full.
//! - **Elastic pool**: `min_workers` are always alive; more are started on
//!   demand up to `max_workers` and reclaimed after `idle_timeout`.
//! - **Exactly once**: every accepted command resolves exactly once, on a
//!   worker, as either a success or a failure.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cim_command_processor::accounts::{account_upcasters, Account, AccountHandler};
//! use cim_command_processor::processor::{CommandProcessor, ProcessorConfig};
//! use cim_command_processor::store::{DocumentStore, InMemoryCollection, JsonSerde};
//!
//! # async fn example(command: cim_command_processor::domain::Command) -> anyhow::Result<()> {
//! let store = DocumentStore::<Account, _, _>::new(InMemoryCollection::new(), JsonSerde, account_upcasters()?)?;
//! let processor = CommandProcessor::<Account>::new(Arc::new(store), AccountHandler, ProcessorConfig::default())?;
//!
//! let result = processor.submit_async(command)?.await?;
//! println!("success: {}", result.is_success());
//! # Ok(())
//! # }
//! ```

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::domain::{
    Aggregate, Command, CommandResult, FailureResult, Handler, SuccessfulResult,
    NO_PREVIOUS_SEQUENCE,
};
use crate::errors::{ConfigurationError, ProcessError, SubmitError};
use crate::store::AggregateStore;

/// How many times a command may lose the compare-and-swap race
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// Retry until the store accepts the write
    ///
    /// A sufficiently hot identifier can keep a worker busy indefinitely.
    #[default]
    Unbounded,
    /// Give up with `MaxRetriesExceeded` after this many retries
    Limited(u32),
}

impl RetryPolicy {
    /// Whether another attempt may follow `attempts` lost attempts
    pub fn allows_retry(&self, attempts: u32) -> bool {
        match self {
            RetryPolicy::Unbounded => true,
            RetryPolicy::Limited(max_retries) => attempts <= *max_retries,
        }
    }
}

/// Configuration for the worker pool
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Workers kept alive while idle
    pub min_workers: usize,
    /// Upper bound on concurrently running workers
    pub max_workers: usize,
    /// Commands that may wait for a worker before submissions are rejected
    pub queue_capacity: usize,
    /// How long a worker above the minimum may sit idle before it exits
    pub idle_timeout: Duration,
    /// Behavior under sustained contention
    pub retry_policy: RetryPolicy,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 10,
            queue_capacity: 1000,
            idle_timeout: Duration::from_secs(30),
            retry_policy: RetryPolicy::Unbounded,
        }
    }
}

impl ProcessorConfig {
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_min_workers(mut self, min_workers: usize) -> Self {
        self.min_workers = min_workers;
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        // A queued command must always find a live worker
        if self.min_workers == 0 {
            return Err(ConfigurationError(
                "'min_workers' must be at least 1".to_string(),
            ));
        }
        if self.max_workers == 0 {
            return Err(ConfigurationError(
                "'max_workers' must be at least 1".to_string(),
            ));
        }
        if self.min_workers > self.max_workers {
            return Err(ConfigurationError(format!(
                "'min_workers' ({}) must not exceed 'max_workers' ({})",
                self.min_workers, self.max_workers
            )));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigurationError(
                "'queue_capacity' must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// A stored aggregate and the number of attempts it took
#[derive(Debug, Clone, PartialEq)]
pub struct Processed<A> {
    pub aggregate: A,
    pub attempts: u32,
}

enum Step<A> {
    Loading,
    Computing { previous: Option<A> },
    Storing { expected_sequence: i64, next: A },
    Retry,
}

/// Run one command to completion against `store`
///
/// Lost races are retried according to `policy`; every other error ends the
/// unit of work.
pub async fn execute<A: Aggregate>(
    store: &dyn AggregateStore<A>,
    handler: &dyn Handler<A>,
    command: &Command,
    policy: RetryPolicy,
) -> Result<Processed<A>, ProcessError> {
    let mut attempts: u32 = 1;
    let mut step = Step::Loading;

    loop {
        step = match step {
            Step::Loading => Step::Computing {
                previous: store.load(command.identifier).await?,
            },
            Step::Computing { previous } => {
                let next = handler
                    .handle(previous.as_ref(), command)
                    .map_err(ProcessError::Handler)?;
                Step::Storing {
                    expected_sequence: previous
                        .as_ref()
                        .map_or(NO_PREVIOUS_SEQUENCE, Aggregate::sequence),
                    next,
                }
            }
            Step::Storing {
                expected_sequence,
                next,
            } => {
                if store.store(expected_sequence, &next).await? {
                    return Ok(Processed {
                        aggregate: next,
                        attempts,
                    });
                }
                Step::Retry
            }
            Step::Retry => {
                if !policy.allows_retry(attempts) {
                    return Err(ProcessError::MaxRetriesExceeded { attempts });
                }
                debug!(
                    identifier = command.identifier,
                    intent = command.intent,
                    attempts,
                    "Lost compare-and-swap race, reloading"
                );
                attempts += 1;
                Step::Loading
            }
        };
    }
}

type Completion<A> = Box<dyn FnOnce(CommandResult<A>) + Send>;

struct Job<A> {
    command: Command,
    complete: Completion<A>,
}

struct Shared<A> {
    store: Arc<dyn AggregateStore<A>>,
    handler: Arc<dyn Handler<A>>,
    config: ProcessorConfig,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Job<A>>>,
    workers: AtomicUsize,
    idle: AtomicUsize,
}

/// Bounded, elastic pool of workers executing commands
pub struct CommandProcessor<A: Aggregate> {
    sender: Mutex<Option<mpsc::Sender<Job<A>>>>,
    shared: Arc<Shared<A>>,
    runtime: Handle,
}

impl<A: Aggregate> CommandProcessor<A> {
    /// Create a processor and start its minimum workers
    ///
    /// Must be called from within a Tokio runtime; workers run on that runtime.
    pub fn new<H>(
        store: Arc<dyn AggregateStore<A>>,
        handler: H,
        config: ProcessorConfig,
    ) -> Result<Self, ConfigurationError>
    where
        H: Handler<A>,
    {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|e| ConfigurationError(format!("No Tokio runtime available: {}", e)))?;

        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        let shared = Arc::new(Shared {
            store,
            handler: Arc::new(handler),
            config,
            receiver: tokio::sync::Mutex::new(receiver),
            workers: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
        });

        let processor = Self {
            sender: Mutex::new(Some(sender)),
            shared,
            runtime,
        };
        for _ in 0..processor.shared.config.min_workers {
            processor.try_spawn_worker();
        }
        Ok(processor)
    }

    /// Submit a command, reporting its outcome through callbacks
    ///
    /// Returns as soon as the command is queued. Exactly one of the callbacks
    /// is invoked, once, on a worker.
    ///
    /// # Errors
    ///
    /// `SubmitError::Rejected` if the backlog is full; neither callback runs.
    pub fn submit<S, E>(&self, command: Command, on_success: S, on_error: E) -> Result<(), SubmitError>
    where
        S: FnOnce(SuccessfulResult<A>) + Send + 'static,
        E: FnOnce(FailureResult) + Send + 'static,
    {
        self.enqueue(
            command,
            Box::new(move |result| match result {
                CommandResult::Success(success) => on_success(success),
                CommandResult::Failure(failure) => on_error(failure),
            }),
        )
    }

    /// Submit a command and receive its outcome through a oneshot channel
    pub fn submit_async(
        &self,
        command: Command,
    ) -> Result<oneshot::Receiver<CommandResult<A>>, SubmitError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(
            command,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )?;
        Ok(rx)
    }

    /// Stop accepting commands
    ///
    /// Already queued commands are still processed; workers exit once the
    /// queue is drained.
    pub fn shutdown(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Number of live workers
    pub fn worker_count(&self) -> usize {
        self.shared.workers.load(Ordering::SeqCst)
    }

    /// Number of commands waiting for a worker
    pub fn queued(&self) -> usize {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, |s| s.max_capacity() - s.capacity())
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.shared.config
    }

    fn enqueue(&self, command: Command, complete: Completion<A>) -> Result<(), SubmitError> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(SubmitError::ShutDown)?;

        sender
            .try_send(Job { command, complete })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(job) => {
                    warn!(
                        intent = job.command.intent,
                        identifier = job.command.identifier,
                        capacity = self.shared.config.queue_capacity,
                        "Rejected command, backlog is full"
                    );
                    SubmitError::Rejected {
                        capacity: self.shared.config.queue_capacity,
                    }
                }
                mpsc::error::TrySendError::Closed(_) => SubmitError::ShutDown,
            })?;

        if self.shared.idle.load(Ordering::SeqCst) == 0 {
            self.try_spawn_worker();
        }
        Ok(())
    }

    fn try_spawn_worker(&self) {
        let max = self.shared.config.max_workers;
        let reserved = self
            .shared
            .workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |w| (w < max).then_some(w + 1));

        if let Ok(previous) = reserved {
            debug!(workers = previous + 1, "Starting worker");
            self.runtime.spawn(run_worker(self.shared.clone()));
        }
    }
}

impl<A: Aggregate> fmt::Debug for CommandProcessor<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandProcessor")
            .field("config", &self.shared.config)
            .field("workers", &self.worker_count())
            .finish_non_exhaustive()
    }
}

async fn run_worker<A: Aggregate>(shared: Arc<Shared<A>>) {
    loop {
        shared.idle.fetch_add(1, Ordering::SeqCst);
        let next = tokio::time::timeout(shared.config.idle_timeout, async {
            shared.receiver.lock().await.recv().await
        })
        .await;
        shared.idle.fetch_sub(1, Ordering::SeqCst);

        match next {
            Ok(Some(job)) => process(&shared, job).await,
            Ok(None) => break,
            Err(_) => {
                let min = shared.config.min_workers;
                let reclaimed = shared
                    .workers
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |w| (w > min).then(|| w - 1));
                if reclaimed.is_ok() {
                    debug!("Reclaimed idle worker");
                    return;
                }
            }
        }
    }

    shared.workers.fetch_sub(1, Ordering::SeqCst);
    debug!("Worker stopped, queue closed");
}

async fn process<A: Aggregate>(shared: &Shared<A>, job: Job<A>) {
    let Job { command, complete } = job;

    let outcome = AssertUnwindSafe(execute(
        shared.store.as_ref(),
        shared.handler.as_ref(),
        &command,
        shared.config.retry_policy,
    ))
    .catch_unwind()
    .await
    .unwrap_or_else(|panic| Err(ProcessError::Panicked(panic_message(panic.as_ref()))));

    let result = match outcome {
        Ok(processed) => {
            debug!(
                intent = command.intent,
                identifier = command.identifier,
                sequence = processed.aggregate.sequence(),
                attempts = processed.attempts,
                "Command succeeded"
            );
            CommandResult::Success(SuccessfulResult {
                intent: command.intent,
                aggregate: processed.aggregate,
            })
        }
        Err(err) => {
            error!(
                intent = command.intent,
                identifier = command.identifier,
                kind = err.kind(),
                error = %err,
                "Command failed"
            );
            CommandResult::Failure(FailureResult::unknown(command.intent))
        }
    };

    if std::panic::catch_unwind(AssertUnwindSafe(|| complete(result))).is_err() {
        warn!(intent = command.intent, "Result callback panicked");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
