/*!
 * Scheduled Pool
 *
 * Delayed and periodic submission on top of a scaling pool. A single
 * scheduler thread keeps a deadline heap; at fire time it only hands the task
 * to the pool, which runs it.
 *
 * A `ScheduledHandle` follows its task through explicit phases:
 * `Pending` until fire time, `Dispatched` once handed to the pool (queries go
 * to the execution future), and `Cancelled` / `Failed` when over. The phase is
 * published under the same mutex that cancellation takes, so a cancel racing
 * with dispatch lands on exactly one side.
 *
 * On `shutdown`, one-shot tasks still fire at their time while periodic tasks
 * are cancelled. Cancelled entries are dropped from the heap from then on, so
 * the scheduler exits once nothing live is left and then shuts the pool down.
 */

use super::config::PoolConfig;
use super::scaling::ScalingPool;
use crate::core::clock::{deadline_after, instant_after};
use crate::core::errors::{ExecutorError, TaskError};
use crate::core::task::{bind, TaskFuture};
use crate::core::types::{panic_message, LimiterName, Task};
use crate::executor::TaskSink;
use parking_lot::{Condvar, Mutex};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

enum Phase<T> {
    Pending,
    Dispatched(TaskFuture<T>),
    Cancelled,
    Failed(TaskError),
}

struct HandleSlot<T> {
    phase: Phase<T>,
    next_fire: Instant,
}

struct HandleInner<T> {
    slot: Mutex<HandleSlot<T>>,
    changed: Condvar,
    periodic: bool,
}

impl<T> HandleInner<T> {
    fn new(next_fire: Instant, periodic: bool) -> Self {
        Self {
            slot: Mutex::new(HandleSlot {
                phase: Phase::Pending,
                next_fire,
            }),
            changed: Condvar::new(),
            periodic,
        }
    }

    fn set_phase(&self, phase: Phase<T>) {
        self.slot.lock().phase = phase;
        self.changed.notify_all();
    }

    fn cancel(&self) -> bool {
        let mut slot = self.slot.lock();
        let execution_stopped = match &slot.phase {
            Phase::Pending => true,
            Phase::Dispatched(future) => future.cancel(),
            Phase::Cancelled | Phase::Failed(_) => return false,
        };

        let was_pending = matches!(slot.phase, Phase::Pending);
        // A periodic task stops rescheduling even if the current run goes on
        let cancelled = if was_pending || self.periodic {
            slot.phase = Phase::Cancelled;
            true
        } else {
            execution_stopped
        };
        drop(slot);
        self.changed.notify_all();
        cancelled
    }

    /// Cancelled or failed; the heap entry will never fire
    fn is_settled(&self) -> bool {
        !matches!(self.slot.lock().phase, Phase::Pending)
    }

    fn is_done(&self) -> bool {
        match &self.slot.lock().phase {
            Phase::Pending => false,
            Phase::Dispatched(future) => !self.periodic && future.is_done(),
            Phase::Cancelled | Phase::Failed(_) => true,
        }
    }

    /// Block until the handle settles into a phase that answers result queries
    ///
    /// For one-shot tasks that is `Dispatched`; periodic tasks only settle
    /// when cancelled or failed.
    fn settled(&self, deadline: Option<Instant>) -> Option<Result<TaskFuture<T>, TaskError>> {
        let mut slot = self.slot.lock();
        loop {
            let answer = match &slot.phase {
                Phase::Dispatched(future) if !self.periodic => Some(Ok(future.share())),
                Phase::Cancelled => Some(Err(TaskError::Cancelled)),
                Phase::Failed(e) => Some(Err(e.clone())),
                Phase::Pending | Phase::Dispatched(_) => None,
            };
            if answer.is_some() {
                return answer;
            }
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut slot, deadline).timed_out() {
                        return None;
                    }
                }
                None => self.changed.wait(&mut slot),
            }
        }
    }
}

/// Handle to a delayed or periodic task
pub struct ScheduledHandle<T> {
    inner: Arc<HandleInner<T>>,
    scheduler: Weak<SchedulerShared>,
}

impl<T> ScheduledHandle<T> {
    /// Cancel the task
    ///
    /// Before fire time the task never runs. After dispatch a one-shot task is
    /// cancelled only if it has not started; a periodic task stops being
    /// rescheduled. Returns false if the task had already settled or started.
    pub fn cancel(&self) -> bool {
        let cancelled = self.inner.cancel();
        if cancelled {
            if let Some(scheduler) = self.scheduler.upgrade() {
                scheduler.prune_if_draining();
            }
        }
        cancelled
    }

    pub fn is_cancelled(&self) -> bool {
        match &self.inner.slot.lock().phase {
            Phase::Cancelled => true,
            Phase::Dispatched(future) => future.is_cancelled(),
            Phase::Pending | Phase::Failed(_) => false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.inner.is_done()
    }

    pub fn is_periodic(&self) -> bool {
        self.inner.periodic
    }

    /// Time until the next scheduled run
    pub fn delay(&self) -> Duration {
        self.inner
            .slot
            .lock()
            .next_fire
            .saturating_duration_since(Instant::now())
    }

    /// Block until the task completes and take its result
    ///
    /// A periodic task only completes by cancellation or failure.
    pub fn get(self) -> Result<T, TaskError> {
        match self.inner.settled(None) {
            Some(Ok(future)) => future.get(),
            Some(Err(e)) => Err(e),
            None => Err(TaskError::Cancelled),
        }
    }

    /// Block until the task is done or the timeout elapses; true if done
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = deadline_after(timeout);
        match self.inner.settled(Some(deadline)) {
            Some(Ok(future)) => {
                future.wait_timeout(deadline.saturating_duration_since(Instant::now()))
            }
            Some(Err(_)) => true,
            None => false,
        }
    }
}

impl<T> std::fmt::Debug for ScheduledHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = match &self.inner.slot.lock().phase {
            Phase::Pending => "pending",
            Phase::Dispatched(_) => "dispatched",
            Phase::Cancelled => "cancelled",
            Phase::Failed(_) => "failed",
        };
        f.debug_struct("ScheduledHandle")
            .field("phase", &phase)
            .field("periodic", &self.inner.periodic)
            .finish()
    }
}

/// What the scheduler thread needs to fire an entry
#[derive(Clone)]
struct FireContext {
    pool: Arc<ScalingPool>,
    scheduler: Weak<SchedulerShared>,
}

trait Scheduled: Send + Sync {
    fn fire(self: Arc<Self>, ctx: &FireContext);
    fn cancel(&self) -> bool;
    fn is_periodic(&self) -> bool;
    fn is_settled(&self) -> bool;
}

type OneShotBody<T> = Box<dyn FnOnce() -> T + Send + 'static>;

struct OneShot<T> {
    handle: Arc<HandleInner<T>>,
    body: Mutex<Option<OneShotBody<T>>>,
}

impl<T: Send + 'static> Scheduled for OneShot<T> {
    fn fire(self: Arc<Self>, ctx: &FireContext) {
        let task = {
            let mut slot = self.handle.slot.lock();
            if !matches!(slot.phase, Phase::Pending) {
                return;
            }
            let Some(body) = self.body.lock().take() else {
                return;
            };
            let (task, future) = bind(body);
            slot.phase = Phase::Dispatched(future);
            task
        };
        self.handle.changed.notify_all();

        // A refused task is dropped, which cancels its future
        if let Err(e) = ctx.pool.execute(task) {
            debug!(error = %e, "scheduled task refused by pool");
        }
    }

    fn cancel(&self) -> bool {
        let cancelled = self.handle.cancel();
        if cancelled {
            self.body.lock().take();
        }
        cancelled
    }

    fn is_periodic(&self) -> bool {
        false
    }

    fn is_settled(&self) -> bool {
        self.handle.is_settled()
    }
}

#[derive(Debug, Clone, Copy)]
enum Cadence {
    FixedRate(Duration),
    FixedDelay(Duration),
}

struct Repeating {
    handle: Arc<HandleInner<()>>,
    body: Arc<dyn Fn() + Send + Sync + 'static>,
    cadence: Cadence,
}

impl Repeating {
    fn after_run(
        self: Arc<Self>,
        outcome: Result<(), TaskError>,
        fired_for: Instant,
        ctx: &FireContext,
    ) {
        match outcome {
            Ok(()) => {
                let next = match self.cadence {
                    Cadence::FixedRate(period) => instant_after(fired_for, period),
                    Cadence::FixedDelay(delay) => deadline_after(delay),
                };
                {
                    let mut slot = self.handle.slot.lock();
                    if !matches!(slot.phase, Phase::Dispatched(_)) {
                        return;
                    }
                    slot.phase = Phase::Pending;
                    slot.next_fire = next;
                }
                self.handle.changed.notify_all();

                let handle = Arc::clone(&self.handle);
                let rescheduled = ctx
                    .scheduler
                    .upgrade()
                    .map_or(false, |scheduler| scheduler.push(next, self));
                if !rescheduled {
                    handle.set_phase(Phase::Cancelled);
                }
            }
            Err(TaskError::Cancelled) => self.handle.set_phase(Phase::Cancelled),
            Err(e) => {
                error!(error = %e, "periodic task failed; no further runs");
                self.handle.set_phase(Phase::Failed(e));
            }
        }
    }
}

impl Scheduled for Repeating {
    fn fire(self: Arc<Self>, ctx: &FireContext) {
        let (task, watch, fired_for) = {
            let mut slot = self.handle.slot.lock();
            if !matches!(slot.phase, Phase::Pending) {
                return;
            }
            let body = Arc::clone(&self.body);
            let (task, future) = bind(move || body());
            let watch = future.share();
            slot.phase = Phase::Dispatched(future);
            (task, watch, slot.next_fire)
        };
        self.handle.changed.notify_all();

        let handle = Arc::clone(&self.handle);
        let run_ctx = ctx.clone();
        let run: Task = Box::new(move || {
            task();
            self.after_run(watch.get(), fired_for, &run_ctx);
        });

        if let Err(e) = ctx.pool.execute(run) {
            debug!(error = %e, "periodic task refused by pool");
            handle.set_phase(Phase::Cancelled);
        }
    }

    fn cancel(&self) -> bool {
        self.handle.cancel()
    }

    fn is_periodic(&self) -> bool {
        true
    }

    fn is_settled(&self) -> bool {
        self.handle.is_settled()
    }
}

struct Entry {
    at: Instant,
    seq: u64,
    job: Arc<dyn Scheduled>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.at.cmp(&other.at).then(self.seq.cmp(&other.seq))
    }
}

#[derive(Default)]
struct SchedulerState {
    heap: BinaryHeap<Reverse<Entry>>,
    next_seq: u64,
    shutdown: bool,
    exited: bool,
}

struct SchedulerShared {
    name: LimiterName,
    state: Mutex<SchedulerState>,
    wake: Condvar,
    exited: Condvar,
}

impl SchedulerShared {
    /// Queue a job; false once shut down
    fn push(&self, at: Instant, job: Arc<dyn Scheduled>) -> bool {
        let mut state = self.state.lock();
        if state.shutdown {
            return false;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        let earliest = state.heap.peek().map_or(true, |Reverse(head)| at < head.at);
        state.heap.push(Reverse(Entry { at, seq, job }));
        if earliest {
            self.wake.notify_one();
        }
        true
    }

    /// Wake the scheduler to drop a cancelled entry once shut down
    fn prune_if_draining(&self) {
        let state = self.state.lock();
        if state.shutdown {
            self.wake.notify_all();
        }
    }

    /// Next due job, or `None` when the scheduler should exit
    fn next_due(&self) -> Option<Arc<dyn Scheduled>> {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                state.heap.retain(|Reverse(entry)| !entry.job.is_settled());
            }
            let head = state
                .heap
                .peek()
                .map(|Reverse(head)| (head.at, head.job.is_settled()));
            match head {
                Some((_, true)) => {
                    state.heap.pop();
                }
                Some((at, false)) if at <= Instant::now() => {
                    return state.heap.pop().map(|Reverse(entry)| entry.job);
                }
                Some((at, false)) => {
                    self.wake.wait_until(&mut state, at);
                }
                None if state.shutdown => return None,
                None => self.wake.wait(&mut state),
            }
        }
    }

    fn run(self: Arc<Self>, pool: Arc<ScalingPool>) {
        let ctx = FireContext {
            pool: Arc::clone(&pool),
            scheduler: Arc::downgrade(&self),
        };

        while let Some(job) = self.next_due() {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| job.fire(&ctx))) {
                error!(
                    scheduler = %self.name,
                    panic = %panic_message(payload.as_ref()),
                    "failed to dispatch scheduled task"
                );
            }
        }

        pool.shutdown();
        self.state.lock().exited = true;
        self.exited.notify_all();
        debug!(scheduler = %self.name, "scheduler exited");
    }
}

/// Delayed and periodic execution on a scaling pool
///
/// # Example
///
/// ```
/// use loadguard::executor::TaskSink;
/// use loadguard::pool::{PoolConfig, ScheduledPool};
/// use std::time::Duration;
///
/// let pool = ScheduledPool::new("timers", PoolConfig::default()).unwrap();
/// let handle = pool.schedule(Duration::from_millis(10), || "fired").unwrap();
/// assert_eq!(handle.get(), Ok("fired"));
///
/// pool.shutdown();
/// assert!(pool.await_termination(Duration::from_secs(1)));
/// ```
pub struct ScheduledPool {
    scheduler: Arc<SchedulerShared>,
    pool: Arc<ScalingPool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ScheduledPool {
    pub fn new(name: impl Into<LimiterName>, config: PoolConfig) -> Result<Self, ExecutorError> {
        let name = name.into();
        let pool = Arc::new(ScalingPool::new(name.clone(), config)?);
        Self::with_pool(name, pool)
    }

    /// Scheduler over an existing pool; the pool is shut down with the scheduler
    pub fn with_pool(
        name: impl Into<LimiterName>,
        pool: Arc<ScalingPool>,
    ) -> Result<Self, ExecutorError> {
        let scheduler = Arc::new(SchedulerShared {
            name: name.into(),
            state: Mutex::new(SchedulerState::default()),
            wake: Condvar::new(),
            exited: Condvar::new(),
        });

        let thread_name = format!("{}-scheduler", pool.config().thread_name_prefix);
        let runner = Arc::clone(&scheduler);
        let runner_pool = Arc::clone(&pool);
        let thread = thread::Builder::new()
            .name(thread_name)
            .spawn(move || runner.run(runner_pool))
            .map_err(|e| ExecutorError::SpawnFailed(e.to_string()))?;

        info!(scheduler = %scheduler.name, "scheduled pool started");

        Ok(Self {
            scheduler,
            pool,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// The pool that runs fired tasks
    pub fn pool(&self) -> &Arc<ScalingPool> {
        &self.pool
    }

    /// Entries waiting in the scheduler
    ///
    /// Before shutdown this may include cancelled entries the scheduler has
    /// not reached yet.
    pub fn scheduled_count(&self) -> usize {
        self.scheduler.state.lock().heap.len()
    }

    /// Run `f` once after `delay`
    pub fn schedule<T, F>(&self, delay: Duration, f: F) -> Result<ScheduledHandle<T>, ExecutorError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let at = deadline_after(delay);
        let handle = Arc::new(HandleInner::new(at, false));
        let job = Arc::new(OneShot {
            handle: Arc::clone(&handle),
            body: Mutex::new(Some(Box::new(f) as OneShotBody<T>)),
        });
        self.enqueue(at, job)?;
        Ok(self.handle(handle))
    }

    /// Run `f` every `period`, measured from the scheduled start of each run
    ///
    /// Runs never overlap; a late run is followed immediately by the next
    /// one if that one is already due.
    pub fn schedule_at_fixed_rate<F>(
        &self,
        initial_delay: Duration,
        period: Duration,
        f: F,
    ) -> Result<ScheduledHandle<()>, ExecutorError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.schedule_repeating(initial_delay, Cadence::FixedRate(period), Arc::new(f))
    }

    /// Run `f` repeatedly, waiting `delay` after each run finishes
    pub fn schedule_with_fixed_delay<F>(
        &self,
        initial_delay: Duration,
        delay: Duration,
        f: F,
    ) -> Result<ScheduledHandle<()>, ExecutorError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.schedule_repeating(initial_delay, Cadence::FixedDelay(delay), Arc::new(f))
    }

    /// Run `f` on the pool now
    pub fn submit<T, F>(&self, f: F) -> Result<TaskFuture<T>, ExecutorError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.ensure_running()?;
        self.pool.submit(f)
    }

    fn schedule_repeating(
        &self,
        initial_delay: Duration,
        cadence: Cadence,
        body: Arc<dyn Fn() + Send + Sync + 'static>,
    ) -> Result<ScheduledHandle<()>, ExecutorError> {
        let (Cadence::FixedRate(step) | Cadence::FixedDelay(step)) = cadence;
        if step.is_zero() {
            return Err(ExecutorError::InvalidConfig(
                "period of a repeating task must be non-zero".into(),
            ));
        }

        let at = deadline_after(initial_delay);
        let handle = Arc::new(HandleInner::new(at, true));
        let job = Arc::new(Repeating {
            handle: Arc::clone(&handle),
            body,
            cadence,
        });
        self.enqueue(at, job)?;
        Ok(self.handle(handle))
    }

    fn handle<T>(&self, inner: Arc<HandleInner<T>>) -> ScheduledHandle<T> {
        ScheduledHandle {
            inner,
            scheduler: Arc::downgrade(&self.scheduler),
        }
    }

    fn enqueue(&self, at: Instant, job: Arc<dyn Scheduled>) -> Result<(), ExecutorError> {
        if self.scheduler.push(at, job) {
            Ok(())
        } else {
            Err(self.shutdown_error())
        }
    }

    fn ensure_running(&self) -> Result<(), ExecutorError> {
        if self.scheduler.state.lock().shutdown {
            Err(self.shutdown_error())
        } else {
            Ok(())
        }
    }

    fn shutdown_error(&self) -> ExecutorError {
        ExecutorError::Shutdown {
            executor: self.scheduler.name.clone(),
        }
    }

    fn join_scheduler(&self) {
        if let Some(thread) = self.thread.lock().take() {
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

impl TaskSink for ScheduledPool {
    fn execute(&self, task: Task) -> Result<(), ExecutorError> {
        self.ensure_running()?;
        self.pool.execute(task)
    }

    /// Stop accepting work and cancel periodic tasks; delayed one-shots
    /// still fire
    fn shutdown(&self) {
        let cancelled: Vec<Arc<dyn Scheduled>> = {
            let mut state = self.scheduler.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            let (periodic, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut state.heap)
                .into_iter()
                .partition(|Reverse(entry)| entry.job.is_periodic());
            state.heap = keep
                .into_iter()
                .filter(|Reverse(entry)| !entry.job.is_settled())
                .collect();
            self.scheduler.wake.notify_all();
            periodic.into_iter().map(|Reverse(entry)| entry.job).collect()
        };

        for job in &cancelled {
            job.cancel();
        }
        info!(
            scheduler = %self.scheduler.name,
            cancelled_periodic = cancelled.len(),
            "scheduled pool shutting down"
        );
    }

    /// Cancel everything not yet fired and drain the pool's queue
    fn shutdown_now(&self) -> Vec<Task> {
        let pending: Vec<Arc<dyn Scheduled>> = {
            let mut state = self.scheduler.state.lock();
            state.shutdown = true;
            self.scheduler.wake.notify_all();
            std::mem::take(&mut state.heap)
                .into_iter()
                .map(|Reverse(entry)| entry.job)
                .collect()
        };
        for job in &pending {
            job.cancel();
        }
        self.pool.shutdown_now()
    }

    fn is_shutdown(&self) -> bool {
        self.scheduler.state.lock().shutdown
    }

    fn is_terminated(&self) -> bool {
        self.scheduler.state.lock().exited && self.pool.is_terminated()
    }

    /// Wait for the scheduler, then the pool, against one deadline
    fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = deadline_after(timeout);
        {
            let mut state = self.scheduler.state.lock();
            while !state.exited {
                if self
                    .scheduler
                    .exited
                    .wait_until(&mut state, deadline)
                    .timed_out()
                    && !state.exited
                {
                    return false;
                }
            }
        }
        self.join_scheduler();
        self.pool
            .await_termination(deadline.saturating_duration_since(Instant::now()))
    }
}

impl Drop for ScheduledPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ScheduledPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledPool")
            .field("name", &self.scheduler.name)
            .field("scheduled", &self.scheduled_count())
            .field("pool", &self.pool)
            .finish()
    }
}
