/*!
 * Task Sinks
 * Anything that can run a submitted task, plus its lifecycle
 */

use crate::core::clock::deadline_after;
use crate::core::errors::ExecutorError;
use crate::core::types::{LimiterName, Task};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

/// Destination for admitted work
///
/// `execute` takes ownership of the task; a sink that refuses it drops it.
pub trait TaskSink: Send + Sync {
    fn execute(&self, task: Task) -> Result<(), ExecutorError>;

    /// Stop accepting work; already accepted work still runs
    fn shutdown(&self);

    /// Stop accepting work and return tasks that never started
    fn shutdown_now(&self) -> Vec<Task>;

    fn is_shutdown(&self) -> bool;

    /// Shut down and no task is running
    fn is_terminated(&self) -> bool;

    /// Block until terminated or the timeout elapses; true if terminated
    fn await_termination(&self, timeout: Duration) -> bool;
}

impl<S: TaskSink + ?Sized> TaskSink for Arc<S> {
    fn execute(&self, task: Task) -> Result<(), ExecutorError> {
        (**self).execute(task)
    }

    fn shutdown(&self) {
        (**self).shutdown()
    }

    fn shutdown_now(&self) -> Vec<Task> {
        (**self).shutdown_now()
    }

    fn is_shutdown(&self) -> bool {
        (**self).is_shutdown()
    }

    fn is_terminated(&self) -> bool {
        (**self).is_terminated()
    }

    fn await_termination(&self, timeout: Duration) -> bool {
        (**self).await_termination(timeout)
    }
}

#[derive(Debug, Default)]
struct DirectState {
    shutdown: bool,
    running: usize,
}

/// Runs each task on the submitting thread
#[derive(Debug)]
pub struct DirectSink {
    name: LimiterName,
    state: Mutex<DirectState>,
    idle: Condvar,
}

impl DirectSink {
    pub fn new(name: impl Into<LimiterName>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(DirectState::default()),
            idle: Condvar::new(),
        }
    }
}

/// Decrements the running count even if the task unwinds
struct Running<'a>(&'a DirectSink);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        let mut state = self.0.state.lock();
        state.running -= 1;
        if state.running == 0 {
            self.0.idle.notify_all();
        }
    }
}

impl TaskSink for DirectSink {
    fn execute(&self, task: Task) -> Result<(), ExecutorError> {
        {
            let mut state = self.state.lock();
            if state.shutdown {
                return Err(ExecutorError::Shutdown {
                    executor: self.name.clone(),
                });
            }
            state.running += 1;
        }
        let _running = Running(self);
        task();
        Ok(())
    }

    fn shutdown(&self) {
        self.state.lock().shutdown = true;
    }

    fn shutdown_now(&self) -> Vec<Task> {
        self.shutdown();
        Vec::new()
    }

    fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    fn is_terminated(&self) -> bool {
        let state = self.state.lock();
        state.shutdown && state.running == 0
    }

    fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = deadline_after(timeout);
        let mut state = self.state.lock();
        while !(state.shutdown && state.running == 0) {
            if self.idle.wait_until(&mut state, deadline).timed_out() {
                return state.shutdown && state.running == 0;
            }
        }
        true
    }
}
