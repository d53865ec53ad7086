/*!
 * RAII Resource Guards
 *
 * Shared abstraction for everything a caller holds and must give back:
 * breaker permits, keyed lock guards and admission tokens.
 *
 * ## Design Principles
 *
 * 1. **Release once**: a second release is an error, never a double free
 * 2. **Drop releases**: forgetting to release cannot leak capacity
 * 3. **Observable**: guards carry metadata for tracing hold times
 */

mod traits;

pub use traits::Guard;

/// Result type for guard operations
pub type GuardResult<T> = Result<T, GuardError>;

/// Errors that can occur during guard operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuardError {
    #[error("Resource already released")]
    AlreadyReleased,

    #[error("Resource is not held by the current thread")]
    NotOwner,
}

/// Guard metadata for observability
#[derive(Debug, Clone)]
pub struct GuardMetadata {
    pub resource_type: &'static str,
    pub creation_time: std::time::Instant,
}

impl GuardMetadata {
    #[inline]
    pub fn new(resource_type: &'static str) -> Self {
        Self {
            resource_type,
            creation_time: std::time::Instant::now(),
        }
    }

    #[inline]
    pub fn lifetime_micros(&self) -> u64 {
        self.creation_time.elapsed().as_micros() as u64
    }
}
