/*!
 * Thread Factories
 */

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

/// Body run by a pool thread
pub type ThreadBody = Box<dyn FnOnce() + Send + 'static>;

/// Creates the OS threads of a pool
pub trait ThreadFactory: Send + Sync {
    fn spawn(&self, body: ThreadBody) -> io::Result<JoinHandle<()>>;
}

/// Spawns threads named `<prefix>-<n>`
#[derive(Debug)]
pub struct NamedThreadFactory {
    prefix: String,
    next: AtomicUsize,
    stack_size: Option<usize>,
}

impl NamedThreadFactory {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicUsize::new(1),
            stack_size: None,
        }
    }

    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl ThreadFactory for NamedThreadFactory {
    fn spawn(&self, body: ThreadBody) -> io::Result<JoinHandle<()>> {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        let mut builder = thread::Builder::new().name(format!("{}-{}", self.prefix, n));
        if let Some(bytes) = self.stack_size {
            builder = builder.stack_size(bytes);
        }
        builder.spawn(body)
    }
}
