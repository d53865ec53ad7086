/*!
 * Lock Sweeper
 *
 * Background thread that periodically runs an eviction pass. A panicking pass
 * is logged and the schedule continues. The thread stops when the owning
 * handle is dropped or the pass reports that its target is gone.
 */

use crate::core::errors::LockError;
use crate::core::limits::SWEEPER_THREAD_NAME;
use crate::core::types::panic_message;
use flume::RecvTimeoutError;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

/// Handle to a running sweeper thread
pub(super) struct Sweeper {
    stop: Option<flume::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Start running `pass` every `interval`
    ///
    /// `pass` returns the number of entries evicted, or `None` once there is
    /// nothing left to sweep.
    pub(super) fn spawn<F>(interval: Duration, mut pass: F) -> Result<Self, LockError>
    where
        F: FnMut() -> Option<usize> + Send + 'static,
    {
        let (stop_tx, stop_rx) = flume::bounded::<()>(1);

        let handle = thread::Builder::new()
            .name(SWEEPER_THREAD_NAME.to_string())
            .spawn(move || {
                debug!(interval_ms = interval.as_millis() as u64, "lock sweeper started");
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        // Stop requested or owner dropped
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }

                    match catch_unwind(AssertUnwindSafe(&mut pass)) {
                        Ok(Some(0)) => {}
                        Ok(Some(evicted)) => debug!(evicted, "swept idle keyed locks"),
                        Ok(None) => break,
                        Err(payload) => error!(
                            panic = %panic_message(payload.as_ref()),
                            "lock sweep failed, continuing schedule"
                        ),
                    }
                }
                debug!("lock sweeper stopped");
            })
            .map_err(|e| LockError::SweeperSpawn(e.to_string()))?;

        info!(
            thread = SWEEPER_THREAD_NAME,
            interval_ms = interval.as_millis() as u64,
            "keyed lock sweeper spawned"
        );

        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.try_send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_panicking_pass_does_not_stop_schedule() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();

        let sweeper = Sweeper::spawn(Duration::from_millis(5), move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                panic!("first pass fails");
            }
            Some(0)
        })
        .unwrap();

        while runs.load(Ordering::SeqCst) < 3 {
            thread::sleep(Duration::from_millis(2));
        }
        drop(sweeper);
    }

    #[test]
    fn test_none_ends_thread() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let sweeper = Sweeper::spawn(Duration::from_millis(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            None
        })
        .unwrap();

        thread::sleep(Duration::from_millis(50));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        drop(sweeper);
    }
}
