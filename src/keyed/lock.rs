/*!
 * Fair Reentrant Read/Write Lock
 *
 * Thread-owned lock granted in FIFO ticket order:
 * - A reader passes once no writer holds the lock and only readers queue ahead of it
 * - A writer passes once the lock is free and it is at the head of the queue
 * - Holders re-enter without queueing (write holders may also take read)
 * - Read -> write upgrade is refused
 *
 * Each lock also carries a membership monitor used by the manager: acquirers
 * enlist before blocking, and the sweeper may only retire a lock that nobody
 * holds, waits on, or is enlisted for. The monitor is never held while
 * blocking on the lock itself.
 */

use crate::core::errors::LockError;
use crate::core::types::LockMode;
use ahash::RandomState;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::thread::{self, ThreadId};

#[derive(Debug, Clone, Copy)]
struct Waiter {
    ticket: u64,
    mode: LockMode,
}

#[derive(Debug, Default)]
struct RwState {
    writer: Option<ThreadId>,
    write_holds: usize,
    readers: HashMap<ThreadId, usize, RandomState>,
    queue: VecDeque<Waiter>,
    next_ticket: u64,
}

impl RwState {
    fn enqueue(&mut self, mode: LockMode) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket = self.next_ticket.wrapping_add(1);
        self.queue.push_back(Waiter { ticket, mode });
        ticket
    }

    fn dequeue(&mut self, ticket: u64) {
        if let Some(pos) = self.queue.iter().position(|w| w.ticket == ticket) {
            self.queue.remove(pos);
        }
    }

    fn read_admissible(&self, ticket: u64) -> bool {
        self.writer.is_none()
            && self
                .queue
                .iter()
                .take_while(|w| w.ticket != ticket)
                .all(|w| w.mode == LockMode::Read)
    }

    fn write_admissible(&self, ticket: u64) -> bool {
        self.writer.is_none()
            && self.readers.is_empty()
            && self.queue.front().map_or(false, |w| w.ticket == ticket)
    }

    fn is_idle(&self) -> bool {
        self.writer.is_none() && self.readers.is_empty() && self.queue.is_empty()
    }
}

#[derive(Debug, Default)]
struct Membership {
    enlisted: usize,
    retired: bool,
}

/// Lock guarding one key
#[derive(Debug, Default)]
pub(super) struct KeyLock {
    membership: Mutex<Membership>,
    state: Mutex<RwState>,
    changed: Condvar,
}

impl KeyLock {
    pub(super) fn new() -> Self {
        Self::default()
    }

    /// Register an acquirer; fails once the sweeper retired this lock
    pub(super) fn try_enlist(&self) -> bool {
        let mut membership = self.membership.lock();
        if membership.retired {
            return false;
        }
        membership.enlisted += 1;
        true
    }

    pub(super) fn delist(&self) {
        let mut membership = self.membership.lock();
        debug_assert!(membership.enlisted > 0);
        membership.enlisted -= 1;
    }

    /// Mark the lock dead if it is completely idle
    ///
    /// After a successful retire no thread can enlist, so the entry may be
    /// removed from the map.
    pub(super) fn try_retire(&self) -> bool {
        let mut membership = self.membership.lock();
        if membership.retired {
            return true;
        }
        if membership.enlisted > 0 || !self.state.lock().is_idle() {
            return false;
        }
        membership.retired = true;
        true
    }

    pub(super) fn is_held(&self) -> bool {
        let state = self.state.lock();
        state.writer.is_some() || !state.readers.is_empty()
    }

    pub(super) fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Block until the calling thread holds a read lock
    pub(super) fn acquire_read(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();

        if let Some(holds) = state.readers.get_mut(&me) {
            *holds += 1;
            return;
        }
        if state.writer == Some(me) {
            state.readers.insert(me, 1);
            return;
        }

        let ticket = state.enqueue(LockMode::Read);
        while !state.read_admissible(ticket) {
            self.changed.wait(&mut state);
        }
        state.dequeue(ticket);
        state.readers.insert(me, 1);
        // Readers queued directly behind may now pass as well
        self.changed.notify_all();
    }

    /// Block until the calling thread holds the write lock
    pub(super) fn acquire_write(&self, key: &dyn Debug) -> Result<(), LockError> {
        let me = thread::current().id();
        let mut state = self.state.lock();

        if state.writer == Some(me) {
            state.write_holds += 1;
            return Ok(());
        }
        if state.readers.contains_key(&me) {
            return Err(LockError::UpgradeUnsupported {
                key: format!("{key:?}"),
            });
        }

        let ticket = state.enqueue(LockMode::Write);
        while !state.write_admissible(ticket) {
            self.changed.wait(&mut state);
        }
        state.dequeue(ticket);
        state.writer = Some(me);
        state.write_holds = 1;
        Ok(())
    }

    pub(super) fn release_read(&self, key: &dyn Debug) -> Result<(), LockError> {
        let me = thread::current().id();
        let mut state = self.state.lock();

        let remaining = match state.readers.get_mut(&me) {
            Some(holds) => {
                *holds -= 1;
                *holds
            }
            None => {
                return Err(LockError::NotHeld {
                    key: format!("{key:?}"),
                    mode: LockMode::Read,
                })
            }
        };
        if remaining == 0 {
            state.readers.remove(&me);
            self.changed.notify_all();
        }
        Ok(())
    }

    pub(super) fn release_write(&self, key: &dyn Debug) -> Result<(), LockError> {
        let me = thread::current().id();
        let mut state = self.state.lock();

        if state.writer != Some(me) {
            return Err(LockError::NotHeld {
                key: format!("{key:?}"),
                mode: LockMode::Write,
            });
        }
        state.write_holds -= 1;
        if state.write_holds == 0 {
            state.writer = None;
            self.changed.notify_all();
        }
        Ok(())
    }
}
