/*!
 * loadguard
 * In-process admission control and contention management
 *
 * Four independent primitives sharing one core layer:
 * - `breaker`: circuit breaker that stops calling a failing dependency
 * - `keyed`: fair per-key read/write locks with idle-lock eviction
 * - `executor`: admission-limited submission in front of any task sink
 * - `pool`: worker pool that grows before it queues, plus scheduling
 */

pub mod breaker;
pub mod core;
pub mod executor;
pub mod keyed;
pub mod monitoring;
pub mod pool;

// Re-exports
pub use breaker::{AccessPermit, BreakerConfig, CircuitBreaker, CircuitState, HalfOpenPolicy};
pub use crate::core::errors::*;
pub use crate::core::task::TaskFuture;
pub use executor::{BoundedConfig, BoundedExecutor, DirectSink, TaskSink};
pub use keyed::{KeyedLockConfig, KeyedLockManager};
pub use monitoring::init_tracing;
pub use pool::{PoolConfig, ScalingPool, ScheduledHandle, ScheduledPool};
