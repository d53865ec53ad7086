/*!
 * Scaling Worker Pool
 *
 * Thread pool that grows before it queues:
 * - Below `min_threads` every submission starts a new worker
 * - A task is queued only when an idle worker can pick it up
 * - Otherwise a new worker is started, up to `max_threads`
 * - At `max_threads` the task joins the overflow queue, blocking the
 *   submitter while a bounded queue is full
 *
 * Workers above `min_threads` exit after `keep_alive` without work. Task
 * panics are caught; the worker survives.
 */

use super::config::PoolConfig;
use super::factory::{NamedThreadFactory, ThreadFactory};
use crate::core::clock::deadline_after;
use crate::core::errors::ExecutorError;
use crate::core::serde::is_zero_usize;
use crate::core::task::{bind, TaskFuture};
use crate::core::types::{panic_message, LimiterName, Task};
use crate::executor::TaskSink;
use crate::monitoring::span_wait;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

#[derive(Default)]
struct PoolState {
    /// Workers running or reserved
    live: usize,
    /// Workers holding a task
    busy: usize,
    largest: usize,
    queue: VecDeque<Task>,
    shutdown: bool,
    /// Submitters waiting for queue space
    blocked: usize,
    /// Bumped by `interrupt_blocked`
    interrupt_epoch: u64,
}

impl PoolState {
    fn reserve(&mut self, with_task: bool) {
        self.live += 1;
        if with_task {
            self.busy += 1;
        }
        self.largest = self.largest.max(self.live);
    }

    fn has_idle_capacity(&self) -> bool {
        self.busy + self.queue.len() < self.live
    }
}

/// Where a submission goes
enum Placement {
    Spawn(Task),
    Queued,
}

struct PoolShared {
    name: LimiterName,
    config: PoolConfig,
    factory: Arc<dyn ThreadFactory>,
    state: Mutex<PoolState>,
    /// Signalled when a task is queued or on shutdown
    work_ready: Condvar,
    /// Signalled when a blocked submitter may make progress
    space_ready: Condvar,
    terminated: Condvar,
    active: AtomicUsize,
    completed: AtomicU64,
}

impl PoolShared {
    fn place(&self, task: Task) -> Result<Placement, ExecutorError> {
        let mut state = self.state.lock();
        let epoch = state.interrupt_epoch;
        let mut span = None;

        loop {
            if state.shutdown {
                return Err(ExecutorError::Shutdown {
                    executor: self.name.clone(),
                });
            }
            if state.interrupt_epoch != epoch {
                return Err(ExecutorError::Interrupted {
                    executor: self.name.clone(),
                });
            }

            if state.live < self.config.min_threads {
                state.reserve(true);
                return Ok(Placement::Spawn(task));
            }
            if state.has_idle_capacity() {
                state.queue.push_back(task);
                self.work_ready.notify_one();
                return Ok(Placement::Queued);
            }
            if state.live < self.config.max_threads {
                state.reserve(true);
                return Ok(Placement::Spawn(task));
            }

            let full = self
                .config
                .queue_capacity
                .map_or(false, |capacity| state.queue.len() >= capacity);
            if !full {
                state.queue.push_back(task);
                self.work_ready.notify_one();
                return Ok(Placement::Queued);
            }

            span.get_or_insert_with(|| span_wait(&self.name, "pool_queue"));
            state.blocked += 1;
            self.space_ready.wait(&mut state);
            state.blocked -= 1;
        }
    }

    fn spawn_worker(self: &Arc<Self>, first: Option<Task>) -> Result<(), ExecutorError> {
        let with_task = first.is_some();
        let shared = Arc::clone(self);

        match self.factory.spawn(Box::new(move || shared.run_worker(first))) {
            Ok(_detached) => {
                debug!(pool = %self.name, live = self.state.lock().live, "worker started");
                Ok(())
            }
            Err(e) => {
                let mut state = self.state.lock();
                state.live -= 1;
                if with_task {
                    state.busy -= 1;
                }
                self.space_ready.notify_all();
                if state.shutdown && state.live == 0 {
                    self.terminated.notify_all();
                }
                error!(pool = %self.name, error = %e, "failed to spawn worker");
                Err(ExecutorError::SpawnFailed(e.to_string()))
            }
        }
    }

    fn run_worker(&self, first: Option<Task>) {
        let mut next = match first {
            Some(task) => Some(task),
            None => self.take_task(false),
        };

        while let Some(task) = next {
            self.active.fetch_add(1, Ordering::SeqCst);
            let outcome = catch_unwind(AssertUnwindSafe(task));
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.completed.fetch_add(1, Ordering::Relaxed);

            if let Err(payload) = outcome {
                error!(
                    pool = %self.name,
                    panic = %panic_message(payload.as_ref()),
                    "task panicked; worker continues"
                );
            }
            next = self.take_task(true);
        }
    }

    /// Wait for the next task; `None` means this worker must exit
    ///
    /// A returning `None` has already removed the worker from `live`.
    fn take_task(&self, finished_one: bool) -> Option<Task> {
        let mut state = self.state.lock();
        if finished_one {
            state.busy -= 1;
            self.space_ready.notify_all();
        }

        loop {
            if let Some(task) = state.queue.pop_front() {
                state.busy += 1;
                self.space_ready.notify_all();
                return Some(task);
            }
            if state.shutdown {
                break;
            }

            if state.live <= self.config.min_threads {
                self.work_ready.wait(&mut state);
            } else {
                let timed_out = self
                    .work_ready
                    .wait_for(&mut state, self.config.keep_alive)
                    .timed_out();
                if timed_out && state.queue.is_empty() && state.live > self.config.min_threads {
                    debug!(pool = %self.name, live = state.live - 1, "idle worker retiring");
                    break;
                }
            }
        }

        state.live -= 1;
        self.space_ready.notify_all();
        if state.shutdown && state.live == 0 {
            self.terminated.notify_all();
        }
        None
    }
}

/// Point-in-time view of a pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub name: String,
    pub pool_size: usize,
    pub active: usize,
    #[serde(default, skip_serializing_if = "is_zero_usize")]
    pub queued: usize,
    pub largest_pool_size: usize,
    pub completed_tasks: u64,
    pub shutdown: bool,
}

/// Pool that prefers starting threads over queueing
///
/// Dropping the pool shuts it down gracefully.
///
/// # Example
///
/// ```
/// use loadguard::executor::TaskSink;
/// use loadguard::pool::{PoolConfig, ScalingPool};
/// use std::time::Duration;
///
/// let pool = ScalingPool::new("docs", PoolConfig::new(1, 4, Duration::from_secs(1))).unwrap();
/// let future = pool.submit(|| "hello").unwrap();
/// assert_eq!(future.get(), Ok("hello"));
///
/// pool.shutdown();
/// assert!(pool.await_termination(Duration::from_secs(1)));
/// ```
pub struct ScalingPool {
    shared: Arc<PoolShared>,
}

impl ScalingPool {
    /// Pool naming its threads after `config.thread_name_prefix`
    pub fn new(name: impl Into<LimiterName>, config: PoolConfig) -> Result<Self, ExecutorError> {
        let factory = Arc::new(NamedThreadFactory::new(config.thread_name_prefix.clone()));
        Self::with_factory(name, config, factory)
    }

    pub fn with_factory(
        name: impl Into<LimiterName>,
        config: PoolConfig,
        factory: Arc<dyn ThreadFactory>,
    ) -> Result<Self, ExecutorError> {
        config.validate()?;
        let name = name.into();
        info!(
            pool = %name,
            min = config.min_threads,
            max = config.max_threads,
            keep_alive_ms = config.keep_alive.as_millis() as u64,
            "scaling pool created"
        );

        Ok(Self {
            shared: Arc::new(PoolShared {
                name,
                config,
                factory,
                state: Mutex::new(PoolState::default()),
                work_ready: Condvar::new(),
                space_ready: Condvar::new(),
                terminated: Condvar::new(),
                active: AtomicUsize::new(0),
                completed: AtomicU64::new(0),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Start idle workers up to `min_threads`; returns how many were started
    pub fn prestart_core_threads(&self) -> Result<usize, ExecutorError> {
        let mut started = 0;
        loop {
            {
                let mut state = self.shared.state.lock();
                if state.shutdown || state.live >= self.shared.config.min_threads {
                    return Ok(started);
                }
                state.reserve(false);
            }
            self.shared.spawn_worker(None)?;
            started += 1;
        }
    }

    /// Run `f` on the pool, returning a future for its result
    pub fn submit<T, F>(&self, f: F) -> Result<TaskFuture<T>, ExecutorError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (task, future) = bind(f);
        self.execute(task)?;
        Ok(future)
    }

    /// Tasks running right now
    pub fn active_count(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Live worker threads
    pub fn pool_size(&self) -> usize {
        self.shared.state.lock().live
    }

    pub fn queued(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Live workers not holding a task
    pub fn idle_count(&self) -> usize {
        let state = self.shared.state.lock();
        state.live - state.busy
    }

    /// Submitters blocked on a full queue
    pub fn blocked_submitters(&self) -> usize {
        self.shared.state.lock().blocked
    }

    pub fn largest_pool_size(&self) -> usize {
        self.shared.state.lock().largest
    }

    pub fn completed_tasks(&self) -> u64 {
        self.shared.completed.load(Ordering::Relaxed)
    }

    /// Wake submitters blocked on a full queue with `ExecutorError::Interrupted`
    pub fn interrupt_blocked(&self) {
        let mut state = self.shared.state.lock();
        state.interrupt_epoch = state.interrupt_epoch.wrapping_add(1);
        self.shared.space_ready.notify_all();
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            name: self.shared.name.to_string(),
            pool_size: state.live,
            active: self.active_count(),
            queued: state.queue.len(),
            largest_pool_size: state.largest,
            completed_tasks: self.completed_tasks(),
            shutdown: state.shutdown,
        }
    }
}

impl TaskSink for ScalingPool {
    fn execute(&self, task: Task) -> Result<(), ExecutorError> {
        match self.shared.place(task)? {
            Placement::Queued => Ok(()),
            Placement::Spawn(task) => self.shared.spawn_worker(Some(task)),
        }
    }

    fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return;
        }
        state.shutdown = true;
        self.shared.work_ready.notify_all();
        self.shared.space_ready.notify_all();
        if state.live == 0 {
            self.shared.terminated.notify_all();
        }
        info!(pool = %self.shared.name, live = state.live, queued = state.queue.len(), "pool shutting down");
    }

    fn shutdown_now(&self) -> Vec<Task> {
        self.shutdown();
        let drained: Vec<Task> = self.shared.state.lock().queue.drain(..).collect();
        if !drained.is_empty() {
            debug!(pool = %self.shared.name, drained = drained.len(), "drained queued tasks");
        }
        drained
    }

    fn is_shutdown(&self) -> bool {
        self.shared.state.lock().shutdown
    }

    fn is_terminated(&self) -> bool {
        let state = self.shared.state.lock();
        state.shutdown && state.live == 0
    }

    fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = deadline_after(timeout);
        let mut state = self.shared.state.lock();
        while !(state.shutdown && state.live == 0) {
            if self
                .shared
                .terminated
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.shutdown && state.live == 0;
            }
        }
        true
    }
}

impl Drop for ScalingPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ScalingPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScalingPool")
            .field("name", &self.shared.name)
            .field("config", &self.shared.config)
            .finish()
    }
}
