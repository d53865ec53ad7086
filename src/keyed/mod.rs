/*!
 * Keyed Locks
 * Fair read/write locks addressed by key value, with background eviction
 * of idle locks
 */

mod lock;
mod manager;
mod sweeper;

pub use manager::{
    KeyReadGuard, KeyWriteGuard, KeyedLockConfig, KeyedLockManager, KeyedLockStats, LockKey,
};
