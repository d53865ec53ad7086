/*!
 * Bounded Executor
 *
 * Admission limiter in front of a task sink. Each task holds one admission
 * token from before it is handed to the sink until it finishes; submitters
 * wait up to `max_wait` for a token and are rejected as busy after that.
 *
 * The token travels inside the wrapped task, so it is returned exactly once:
 * when the task completes, panics, or is dropped by a sink that refused it.
 */

use super::sink::TaskSink;
use crate::core::errors::{ExecutorError, TaskError};
use crate::core::limits::{DEFAULT_ADMISSION_WAIT, DEFAULT_MAX_PENDING_TASKS};
use crate::core::serde::{serde_as, DurationMilliSeconds};
use crate::core::sync::{AcquireError, Semaphore, SemaphorePermit};
use crate::core::task::{bind, TaskFuture};
use crate::core::types::{LimiterName, Task};
use crate::monitoring::span_wait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Admission limits of a bounded executor
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundedConfig {
    /// Tasks admitted and not yet finished
    pub max_pending_tasks: usize,

    /// How long a submitter waits for a token
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_wait: Duration,
}

impl Default for BoundedConfig {
    fn default() -> Self {
        Self {
            max_pending_tasks: DEFAULT_MAX_PENDING_TASKS,
            max_wait: DEFAULT_ADMISSION_WAIT,
        }
    }
}

impl BoundedConfig {
    pub const fn new(max_pending_tasks: usize, max_wait: Duration) -> Self {
        Self {
            max_pending_tasks,
            max_wait,
        }
    }

    /// Reject immediately when saturated
    pub const fn fail_fast(max_pending_tasks: usize) -> Self {
        Self {
            max_pending_tasks,
            max_wait: Duration::ZERO,
        }
    }

    pub fn validate(&self) -> Result<(), ExecutorError> {
        if self.max_pending_tasks == 0 {
            return Err(ExecutorError::InvalidConfig(
                "max_pending_tasks must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Semaphore-limited executor over any [`TaskSink`]
///
/// # Example
///
/// ```
/// use loadguard::executor::{BoundedConfig, BoundedExecutor, DirectSink};
/// use std::time::Duration;
///
/// let executor = BoundedExecutor::new(
///     "inline",
///     DirectSink::new("inline"),
///     BoundedConfig::new(4, Duration::from_millis(10)),
/// )
/// .unwrap();
///
/// let future = executor.submit(|| 6 * 7).unwrap();
/// assert_eq!(future.get(), Ok(42));
/// assert_eq!(executor.in_flight(), 0);
/// ```
pub struct BoundedExecutor<S: TaskSink> {
    name: LimiterName,
    sink: S,
    admission: Semaphore,
    config: BoundedConfig,
}

impl<S: TaskSink> BoundedExecutor<S> {
    pub fn new(
        name: impl Into<LimiterName>,
        sink: S,
        config: BoundedConfig,
    ) -> Result<Self, ExecutorError> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            sink,
            admission: Semaphore::new(config.max_pending_tasks),
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BoundedConfig {
        &self.config
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Admitted tasks not yet finished
    pub fn in_flight(&self) -> usize {
        self.admission.in_use()
    }

    /// Tokens free right now
    pub fn available(&self) -> usize {
        self.admission.available()
    }

    /// Threads blocked waiting for admission
    pub fn waiting(&self) -> usize {
        self.admission.waiters()
    }

    /// Run `task` on the sink once admitted
    ///
    /// On an `Arc<BoundedExecutor<_>>` with `TaskSink` in scope, method syntax
    /// resolves to `TaskSink::execute`, which takes a boxed `Task`; call
    /// `BoundedExecutor::execute(&executor, f)` there.
    pub fn execute<F>(&self, task: F) -> Result<(), ExecutorError>
    where
        F: FnOnce() + Send + 'static,
    {
        let token = self.admit(1)?;
        self.sink.execute(Box::new(move || {
            let _token = token;
            task();
        }))
    }

    /// Run `f` on the sink once admitted, returning a future for its result
    pub fn submit<T, F>(&self, f: F) -> Result<TaskFuture<T>, ExecutorError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let token = self.admit(1)?;
        let (task, future) = bind(f);
        self.sink.execute(Self::holding(token, task))?;
        Ok(future)
    }

    /// Admit the whole batch at once, run it, and wait for every result
    ///
    /// If the sink refuses part of the batch, the tasks it already accepted
    /// are cancelled where they have not started, and the error is returned.
    pub fn invoke_all<T, F>(&self, tasks: Vec<F>) -> Result<Vec<Result<T, TaskError>>, ExecutorError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }
        let tokens = self.admit(tasks.len())?.split();

        let mut futures = Vec::with_capacity(tasks.len());
        for (f, token) in tasks.into_iter().zip(tokens) {
            let (task, future) = bind(f);
            if let Err(e) = self.sink.execute(Self::holding(token, task)) {
                for pending in &futures {
                    TaskFuture::cancel(pending);
                }
                return Err(e);
            }
            futures.push(future);
        }

        Ok(futures.into_iter().map(TaskFuture::get).collect())
    }

    /// Admit the whole batch at once and return the first successful result
    ///
    /// The remaining tasks are cancelled where they have not started. If no
    /// task succeeds, the last task error is returned.
    pub fn invoke_any<T, F>(&self, tasks: Vec<F>) -> Result<Result<T, TaskError>, ExecutorError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if tasks.is_empty() {
            return Err(ExecutorError::EmptyBatch {
                executor: self.name.clone(),
            });
        }
        let tokens = self.admit(tasks.len())?.split();
        let (done_tx, done_rx) = flume::unbounded::<usize>();

        let mut futures: Vec<Option<TaskFuture<T>>> = Vec::with_capacity(tasks.len());
        for (index, (f, token)) in tasks.into_iter().zip(tokens).enumerate() {
            let (task, future) = bind(f);
            let done = done_tx.clone();
            let wrapped: Task = Box::new(move || {
                let _token = token;
                task();
                let _ = done.send(index);
            });
            if let Err(e) = self.sink.execute(wrapped) {
                futures.iter().flatten().for_each(|f| {
                    f.cancel();
                });
                return Err(e);
            }
            futures.push(Some(future));
        }
        drop(done_tx);

        let mut last_error = TaskError::Cancelled;
        // Ends once every wrapped task has run or been dropped
        for index in done_rx.iter() {
            let Some(future) = futures.get_mut(index).and_then(Option::take) else {
                continue;
            };
            match future.get() {
                Ok(value) => {
                    futures.iter().flatten().for_each(|f| {
                        f.cancel();
                    });
                    return Ok(Ok(value));
                }
                Err(e) => last_error = e,
            }
        }
        Ok(Err(last_error))
    }

    /// Stop accepting work in the sink
    pub fn shutdown(&self) {
        self.sink.shutdown();
    }

    /// Interrupt admission waiters, then stop the sink and drain its queue
    pub fn shutdown_now(&self) -> Vec<Task> {
        self.admission.interrupt();
        self.sink.shutdown_now()
    }

    pub fn is_shutdown(&self) -> bool {
        self.sink.is_shutdown()
    }

    pub fn is_terminated(&self) -> bool {
        self.sink.is_terminated()
    }

    pub fn await_termination(&self, timeout: Duration) -> bool {
        self.sink.await_termination(timeout)
    }

    /// Wake every thread blocked on admission with `ExecutorError::Interrupted`
    pub fn interrupt_waiters(&self) {
        debug!(executor = %self.name, waiting = self.waiting(), "interrupting admission waiters");
        self.admission.interrupt();
    }

    fn holding(token: SemaphorePermit, task: Task) -> Task {
        Box::new(move || {
            let _token = token;
            task();
        })
    }

    fn admit(&self, count: usize) -> Result<SemaphorePermit, ExecutorError> {
        let span = span_wait(&self.name, "admission");
        match self.admission.acquire_timeout(count, self.config.max_wait) {
            Ok(token) => {
                span.record_outcome("admitted");
                Ok(token)
            }
            Err(AcquireError::Timeout) => {
                span.record_outcome("busy");
                let waited_ms = span.elapsed().as_millis() as u64;
                warn!(
                    executor = %self.name,
                    requested = count,
                    in_flight = self.in_flight(),
                    waited_ms,
                    "admission rejected: busy"
                );
                Err(ExecutorError::Busy {
                    executor: self.name.clone(),
                    waited_ms,
                })
            }
            Err(AcquireError::Interrupted) => {
                span.record_outcome("interrupted");
                Err(ExecutorError::Interrupted {
                    executor: self.name.clone(),
                })
            }
            Err(AcquireError::Oversized {
                requested,
                capacity,
            }) => {
                span.record_outcome("oversized");
                Err(ExecutorError::BatchTooLarge {
                    executor: self.name.clone(),
                    requested,
                    capacity,
                })
            }
        }
    }
}

/// A bounded executor is itself a sink, so limiters can be stacked
impl<S: TaskSink> TaskSink for BoundedExecutor<S> {
    fn execute(&self, task: Task) -> Result<(), ExecutorError> {
        BoundedExecutor::execute(self, task)
    }

    fn shutdown(&self) {
        BoundedExecutor::shutdown(self)
    }

    fn shutdown_now(&self) -> Vec<Task> {
        BoundedExecutor::shutdown_now(self)
    }

    fn is_shutdown(&self) -> bool {
        BoundedExecutor::is_shutdown(self)
    }

    fn is_terminated(&self) -> bool {
        BoundedExecutor::is_terminated(self)
    }

    fn await_termination(&self, timeout: Duration) -> bool {
        BoundedExecutor::await_termination(self, timeout)
    }
}

impl<S: TaskSink> std::fmt::Debug for BoundedExecutor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedExecutor")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
