/*!
 * Core Module
 * Shared types, error handling and plumbing used by every limiter
 */

pub mod clock;
pub mod errors;
pub mod guard;
pub mod limits;
pub mod serde;
pub mod sync;
pub mod task;
pub mod types;

// Re-export for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use errors::*;
pub use guard::{Guard, GuardError, GuardMetadata, GuardResult};
pub use sync::{AcquireError, Semaphore, SemaphorePermit};
pub use task::TaskFuture;
pub use types::*;
