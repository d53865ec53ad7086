/*!
 * Task Futures
 *
 * Blocking completion handles for work submitted to a task sink.
 * A task is bound to its future at creation; the future completes when the
 * task runs, panics, is cancelled, or is dropped without running.
 */

use super::clock::deadline_after;
use super::errors::TaskError;
use super::types::{panic_message, Task};
use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

enum Slot<T> {
    Pending,
    Running,
    Done(Result<T, TaskError>),
    Taken,
}

struct Completion<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

impl<T> Completion<T> {
    fn finish(&self, result: Result<T, TaskError>) {
        let mut slot = self.slot.lock();
        if matches!(*slot, Slot::Pending | Slot::Running) {
            *slot = Slot::Done(result);
            self.ready.notify_all();
        }
    }
}

/// Handle to the result of a submitted task
pub struct TaskFuture<T> {
    inner: Arc<Completion<T>>,
}

/// Producer side of a task future, owned by the task closure
struct Promise<T> {
    inner: Arc<Completion<T>>,
    settled: bool,
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        // Task dropped without running (rejected or drained on shutdown)
        if !self.settled {
            self.inner.finish(Err(TaskError::Cancelled));
        }
    }
}

/// Bind a closure to a new future
///
/// The returned task runs the closure, catching panics, unless the future
/// was cancelled first.
pub fn bind<T, F>(f: F) -> (Task, TaskFuture<T>)
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let inner = Arc::new(Completion {
        slot: Mutex::new(Slot::Pending),
        ready: Condvar::new(),
    });
    let mut promise = Promise {
        inner: Arc::clone(&inner),
        settled: false,
    };

    let task: Task = Box::new(move || {
        {
            let mut slot = promise.inner.slot.lock();
            if !matches!(*slot, Slot::Pending) {
                promise.settled = true;
                return;
            }
            *slot = Slot::Running;
        }

        let result = catch_unwind(AssertUnwindSafe(f))
            .map_err(|payload| TaskError::Panicked(panic_message(payload.as_ref())));
        promise.settled = true;
        promise.inner.finish(result);
    });

    (task, TaskFuture { inner })
}

impl<T> TaskFuture<T> {
    /// Second handle to the same completion, used by delegating handles
    pub(crate) fn share(&self) -> TaskFuture<T> {
        TaskFuture {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Cancel the task if it has not started yet
    ///
    /// Returns false once the task is running or finished.
    pub fn cancel(&self) -> bool {
        let mut slot = self.inner.slot.lock();
        if matches!(*slot, Slot::Pending) {
            *slot = Slot::Done(Err(TaskError::Cancelled));
            self.inner.ready.notify_all();
            true
        } else {
            false
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            *self.inner.slot.lock(),
            Slot::Done(Err(TaskError::Cancelled))
        )
    }

    pub fn is_done(&self) -> bool {
        matches!(*self.inner.slot.lock(), Slot::Done(_) | Slot::Taken)
    }

    /// Block until the task completes
    pub fn wait(&self) {
        let mut slot = self.inner.slot.lock();
        while matches!(*slot, Slot::Pending | Slot::Running) {
            self.inner.ready.wait(&mut slot);
        }
    }

    /// Block until the task completes or the timeout elapses
    ///
    /// Returns true if the task completed
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = deadline_after(timeout);
        let mut slot = self.inner.slot.lock();
        while matches!(*slot, Slot::Pending | Slot::Running) {
            if self.inner.ready.wait_until(&mut slot, deadline).timed_out() {
                return !matches!(*slot, Slot::Pending | Slot::Running);
            }
        }
        true
    }

    /// Block until the task completes and take its result
    pub fn get(self) -> Result<T, TaskError> {
        let mut slot = self.inner.slot.lock();
        while matches!(*slot, Slot::Pending | Slot::Running) {
            self.inner.ready.wait(&mut slot);
        }
        match std::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Done(result) => result,
            // Another shared handle already took the value
            _ => Err(TaskError::Cancelled),
        }
    }
}

impl<T> std::fmt::Debug for TaskFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match *self.inner.slot.lock() {
            Slot::Pending => "pending",
            Slot::Running => "running",
            Slot::Done(Ok(_)) => "completed",
            Slot::Done(Err(_)) => "failed",
            Slot::Taken => "taken",
        };
        f.debug_struct("TaskFuture").field("state", &state).finish()
    }
}
