/*!
 * Counting Semaphore
 *
 * Condvar-backed semaphore with timed, all-or-nothing multi-token acquisition
 * and an interrupt that wakes every current waiter.
 */

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use crate::core::clock::deadline_after;
use std::time::Duration;
use thiserror::Error;

/// Semaphore acquisition errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    #[error("Timed out waiting for permits")]
    Timeout,

    #[error("Interrupted while waiting for permits")]
    Interrupted,

    #[error("Requested {requested} permits but capacity is {capacity}")]
    Oversized { requested: usize, capacity: usize },
}

struct SemState {
    available: usize,
    /// Bumped by `interrupt`; waiters that saw an older epoch bail out
    interrupt_epoch: u64,
    waiters: usize,
}

struct SemInner {
    state: Mutex<SemState>,
    released: Condvar,
    capacity: usize,
}

impl SemInner {
    fn release(&self, count: usize) {
        let mut state = self.state.lock();
        state.available += count;
        debug_assert!(state.available <= self.capacity);
        if state.waiters > 0 {
            // Waiters may ask for different counts, wake them all
            self.released.notify_all();
        }
    }
}

/// Counting semaphore
///
/// # Example
///
/// ```
/// use loadguard::core::sync::Semaphore;
/// use std::time::Duration;
///
/// let sem = Semaphore::new(2);
/// let permit = sem.acquire_timeout(2, Duration::from_millis(10)).unwrap();
/// assert_eq!(sem.available(), 0);
/// drop(permit);
/// assert_eq!(sem.available(), 2);
/// ```
#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<SemInner>,
}

impl Semaphore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(SemInner {
                state: Mutex::new(SemState {
                    available: capacity,
                    interrupt_epoch: 0,
                    waiters: 0,
                }),
                released: Condvar::new(),
                capacity,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn available(&self) -> usize {
        self.inner.state.lock().available
    }

    /// Permits currently held
    pub fn in_use(&self) -> usize {
        self.inner.capacity - self.available()
    }

    /// Threads currently blocked in `acquire_timeout`
    pub fn waiters(&self) -> usize {
        self.inner.state.lock().waiters
    }

    /// Take `count` permits without blocking
    pub fn try_acquire(&self, count: usize) -> Option<SemaphorePermit> {
        let mut state = self.inner.state.lock();
        if state.available >= count {
            state.available -= count;
            Some(self.permit(count))
        } else {
            None
        }
    }

    /// Take `count` permits, waiting up to `timeout` for all of them at once
    ///
    /// Either all permits are acquired or none are.
    pub fn acquire_timeout(
        &self,
        count: usize,
        timeout: Duration,
    ) -> Result<SemaphorePermit, AcquireError> {
        if count > self.inner.capacity {
            return Err(AcquireError::Oversized {
                requested: count,
                capacity: self.inner.capacity,
            });
        }

        let deadline = deadline_after(timeout);
        let mut state = self.inner.state.lock();
        let epoch = state.interrupt_epoch;

        while state.available < count {
            state.waiters += 1;
            let timed_out = self
                .inner
                .released
                .wait_until(&mut state, deadline)
                .timed_out();
            state.waiters -= 1;

            if state.interrupt_epoch != epoch {
                return Err(AcquireError::Interrupted);
            }
            if timed_out && state.available < count {
                return Err(AcquireError::Timeout);
            }
        }

        state.available -= count;
        Ok(self.permit(count))
    }

    /// Wake every thread currently waiting with `AcquireError::Interrupted`
    ///
    /// Threads that start waiting afterwards are unaffected.
    pub fn interrupt(&self) {
        let mut state = self.inner.state.lock();
        state.interrupt_epoch = state.interrupt_epoch.wrapping_add(1);
        self.inner.released.notify_all();
    }

    fn permit(&self, count: usize) -> SemaphorePermit {
        SemaphorePermit {
            sem: Arc::clone(&self.inner),
            count,
        }
    }
}

/// Permits held from a semaphore, returned on drop
pub struct SemaphorePermit {
    sem: Arc<SemInner>,
    count: usize,
}

impl SemaphorePermit {
    pub fn count(&self) -> usize {
        self.count
    }

    /// Split into single-permit holders, each released independently
    pub fn split(mut self) -> Vec<SemaphorePermit> {
        let count = std::mem::take(&mut self.count);
        (0..count)
            .map(|_| SemaphorePermit {
                sem: Arc::clone(&self.sem),
                count: 1,
            })
            .collect()
    }
}

impl Drop for SemaphorePermit {
    fn drop(&mut self) {
        if self.count > 0 {
            self.sem.release(self.count);
        }
    }
}

impl std::fmt::Debug for SemaphorePermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemaphorePermit")
            .field("count", &self.count)
            .finish()
    }
}
