/*!
 * State Listeners
 * Synchronous observers of gate transitions
 */

use super::state::StateChange;
use crate::core::types::panic_message;
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

/// Observer notified on every state transition
///
/// Called on the thread that caused the transition, after the gate's
/// internal lock has been released.
pub trait StateListener: Send + Sync {
    fn on_transition(&self, change: &StateChange);
}

/// Adapts a closure into a listener
pub struct FnListener<F>(pub F);

impl<F> StateListener for FnListener<F>
where
    F: Fn(&StateChange) + Send + Sync,
{
    fn on_transition(&self, change: &StateChange) {
        (self.0)(change)
    }
}

/// Channel-backed listener; a disconnected receiver is ignored
impl StateListener for flume::Sender<StateChange> {
    fn on_transition(&self, change: &StateChange) {
        let _ = self.send(change.clone());
    }
}

/// Registered listeners of one gate
#[derive(Default)]
pub(super) struct ListenerSet {
    listeners: RwLock<Vec<Arc<dyn StateListener>>>,
}

impl ListenerSet {
    pub(super) fn add(&self, listener: Arc<dyn StateListener>) {
        self.listeners.write().push(listener);
    }

    pub(super) fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Deliver each change to every listener, containing panics
    pub(super) fn notify(&self, changes: &[StateChange]) {
        if changes.is_empty() {
            return;
        }
        // Snapshot so a listener may register another without deadlocking
        let listeners: Vec<_> = self.listeners.read().clone();

        for change in changes {
            for listener in &listeners {
                if let Err(payload) =
                    catch_unwind(AssertUnwindSafe(|| listener.on_transition(change)))
                {
                    error!(
                        gate = %change.gate,
                        from = %change.from,
                        to = %change.to,
                        panic = %panic_message(payload.as_ref()),
                        "state listener panicked"
                    );
                }
            }
        }
    }
}
