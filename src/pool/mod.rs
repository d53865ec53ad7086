/*!
 * Worker Pools
 * Thread pool that grows before it queues, plus a delayed/periodic
 * scheduling front end
 */

mod config;
mod factory;
mod scaling;
mod scheduled;

pub use config::PoolConfig;
pub use factory::{NamedThreadFactory, ThreadBody, ThreadFactory};
pub use scaling::{PoolStats, ScalingPool};
pub use scheduled::{ScheduledHandle, ScheduledPool};
