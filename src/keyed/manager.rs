/*!
 * Keyed Lock Manager
 *
 * Maps keys to fair read/write locks created on demand. Idle locks are
 * evicted by a periodic sweep so the map does not grow with every key ever
 * seen.
 *
 * # Creation race
 *
 * An acquirer looks the key up, and if absent inserts a fresh candidate via
 * an atomic insert-if-absent; if another thread won, the winner is used and
 * the candidate dropped. Before blocking, the acquirer enlists on the lock. A
 * lock the sweeper already retired refuses enlistment, and the acquirer
 * retries against the map.
 */

use super::lock::KeyLock;
use super::sweeper::Sweeper;
use crate::core::errors::LockError;
use crate::core::guard::{Guard, GuardError, GuardMetadata, GuardResult};
use crate::core::limits::DEFAULT_SWEEP_INTERVAL;
use crate::core::serde::{is_zero_u64, serde_as, DurationMilliSeconds};
use ahash::RandomState;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::trace;

/// Bound for key types
pub trait LockKey: Hash + Eq + Clone + Debug + Send + Sync + 'static {}

impl<T> LockKey for T where T: Hash + Eq + Clone + Debug + Send + Sync + 'static {}

/// Keyed lock manager configuration
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyedLockConfig {
    /// Period of the idle-lock sweep
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub sweep_interval: Duration,

    /// Run the sweep on a background thread; otherwise only `sweep_now` evicts
    #[serde(default = "default_background_sweep")]
    pub background_sweep: bool,
}

fn default_background_sweep() -> bool {
    true
}

impl Default for KeyedLockConfig {
    fn default() -> Self {
        Self {
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            background_sweep: true,
        }
    }
}

impl KeyedLockConfig {
    /// Sweep often; for workloads with many short-lived keys
    pub const fn high_churn() -> Self {
        Self {
            sweep_interval: Duration::from_secs(1),
            background_sweep: true,
        }
    }

    /// No background thread; the owner calls `sweep_now`
    pub const fn manual() -> Self {
        Self {
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            background_sweep: false,
        }
    }
}

/// Map plus sweep counters, shared weakly with the sweeper thread
struct Registry<K: LockKey> {
    locks: DashMap<K, Arc<KeyLock>, RandomState>,
    sweeps: AtomicU64,
    evicted: AtomicU64,
}

impl<K: LockKey> Registry<K> {
    fn sweep(&self) -> usize {
        let candidates: Vec<(K, Arc<KeyLock>)> = self
            .locks
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut evicted = 0;
        for (key, lock) in candidates {
            if lock.try_retire()
                && self
                    .locks
                    .remove_if(&key, |_, current| Arc::ptr_eq(current, &lock))
                    .is_some()
            {
                evicted += 1;
            }
        }

        self.sweeps.fetch_add(1, Ordering::Relaxed);
        self.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }
}

/// Snapshot of a manager's map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyedLockStats {
    pub entries: usize,
    pub held: usize,
    pub waiting: usize,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub sweeps: u64,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub evicted: u64,
}

/// Per-key read/write locks
///
/// # Example
///
/// ```
/// use loadguard::keyed::{KeyedLockConfig, KeyedLockManager};
///
/// let locks = KeyedLockManager::with_config(KeyedLockConfig::manual()).unwrap();
/// let total = locks.with_write_lock(&"account-7", || 40 + 2).unwrap();
/// assert_eq!(total, 42);
/// assert_eq!(locks.sweep_now(), 1);
/// assert!(locks.is_empty());
/// ```
pub struct KeyedLockManager<K: LockKey> {
    registry: Arc<Registry<K>>,
    config: KeyedLockConfig,
    _sweeper: Option<Sweeper>,
}

impl<K: LockKey> KeyedLockManager<K> {
    /// Manager sweeping on the default interval
    pub fn new() -> Result<Self, LockError> {
        Self::with_config(KeyedLockConfig::default())
    }

    /// Manager sweeping every `interval`
    pub fn with_sweep_interval(interval: Duration) -> Result<Self, LockError> {
        Self::with_config(KeyedLockConfig {
            sweep_interval: interval,
            ..Default::default()
        })
    }

    pub fn with_config(config: KeyedLockConfig) -> Result<Self, LockError> {
        let registry = Arc::new(Registry {
            locks: DashMap::with_hasher(RandomState::new()),
            sweeps: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        });

        let sweeper = if config.background_sweep {
            let weak: Weak<Registry<K>> = Arc::downgrade(&registry);
            Some(Sweeper::spawn(config.sweep_interval, move || {
                weak.upgrade().map(|registry| registry.sweep())
            })?)
        } else {
            None
        };

        Ok(Self {
            registry,
            config,
            _sweeper: sweeper,
        })
    }

    pub fn config(&self) -> &KeyedLockConfig {
        &self.config
    }

    /// Block until the calling thread holds the read lock for `key`
    pub fn lock_read(&self, key: &K) {
        let lock = self.enlist(key);
        lock.acquire_read();
        lock.delist();
    }

    /// Block until the calling thread holds the write lock for `key`
    ///
    /// Fails with `UpgradeUnsupported` if the thread holds only a read lock.
    pub fn lock_write(&self, key: &K) -> Result<(), LockError> {
        let lock = self.enlist(key);
        let result = lock.acquire_write(key);
        lock.delist();
        result
    }

    pub fn unlock_read(&self, key: &K) -> Result<(), LockError> {
        self.existing(key)?.release_read(key)
    }

    pub fn unlock_write(&self, key: &K) -> Result<(), LockError> {
        self.existing(key)?.release_write(key)
    }

    /// Read lock released when the guard drops
    pub fn read(&self, key: &K) -> KeyReadGuard<'_, K> {
        let lock = self.enlist(key);
        lock.acquire_read();
        lock.delist();
        KeyReadGuard {
            inner: HeldKey::new(self, key.clone(), lock, "keyed_read_lock"),
        }
    }

    /// Write lock released when the guard drops
    pub fn write(&self, key: &K) -> Result<KeyWriteGuard<'_, K>, LockError> {
        let lock = self.enlist(key);
        let result = lock.acquire_write(key);
        lock.delist();
        result?;
        Ok(KeyWriteGuard {
            inner: HeldKey::new(self, key.clone(), lock, "keyed_write_lock"),
        })
    }

    /// Run `f` holding the read lock for `key`, releasing it on every exit path
    pub fn with_read_lock<R>(&self, key: &K, f: impl FnOnce() -> R) -> R {
        let _guard = self.read(key);
        f()
    }

    /// Run `f` holding the write lock for `key`, releasing it on every exit path
    pub fn with_write_lock<R>(&self, key: &K, f: impl FnOnce() -> R) -> Result<R, LockError> {
        let _guard = self.write(key)?;
        Ok(f())
    }

    /// Evict idle locks now; returns how many were removed
    pub fn sweep_now(&self) -> usize {
        self.registry.sweep()
    }

    /// Number of keys currently mapped to a lock
    pub fn len(&self) -> usize {
        self.registry.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.locks.is_empty()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.registry.locks.contains_key(key)
    }

    pub fn stats(&self) -> KeyedLockStats {
        let mut held = 0;
        let mut waiting = 0;
        for entry in self.registry.locks.iter() {
            if entry.value().is_held() {
                held += 1;
            }
            waiting += entry.value().queued();
        }
        KeyedLockStats {
            entries: self.registry.locks.len(),
            held,
            waiting,
            sweeps: self.registry.sweeps.load(Ordering::Relaxed),
            evicted: self.registry.evicted.load(Ordering::Relaxed),
        }
    }

    /// Obtain-or-create the lock for `key` and enlist on it
    fn enlist(&self, key: &K) -> Arc<KeyLock> {
        loop {
            // Clone out of the shard guard before touching the entry API
            let existing = self.registry.locks.get(key).map(|e| Arc::clone(e.value()));
            let lock = match existing {
                Some(lock) => lock,
                None => {
                    let candidate = Arc::new(KeyLock::new());
                    let winner = self.registry.locks.entry(key.clone()).or_insert(candidate);
                    Arc::clone(winner.value())
                }
            };

            if lock.try_enlist() {
                return lock;
            }
            // Retired by a concurrent sweep; its entry is being removed
            std::thread::yield_now();
        }
    }

    fn existing(&self, key: &K) -> Result<Arc<KeyLock>, LockError> {
        self.registry
            .locks
            .get(key)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| LockError::NotLocked {
                key: format!("{key:?}"),
            })
    }
}

impl<K: LockKey> Debug for KeyedLockManager<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedLockManager")
            .field("entries", &self.len())
            .field("config", &self.config)
            .finish()
    }
}

/// Shared state of both guard kinds; `!Send` because locks are thread-owned
struct HeldKey<'a, K: LockKey> {
    _manager: PhantomData<&'a KeyedLockManager<K>>,
    key: K,
    lock: Arc<KeyLock>,
    released: bool,
    metadata: GuardMetadata,
    _not_send: PhantomData<*const ()>,
}

impl<'a, K: LockKey> HeldKey<'a, K> {
    fn new(
        _manager: &'a KeyedLockManager<K>,
        key: K,
        lock: Arc<KeyLock>,
        resource_type: &'static str,
    ) -> Self {
        Self {
            _manager: PhantomData,
            key,
            lock,
            released: false,
            metadata: GuardMetadata::new(resource_type),
            _not_send: PhantomData,
        }
    }
}

macro_rules! key_guard {
    ($name:ident, $release:ident, $doc:literal) => {
        #[doc = $doc]
        #[must_use = "the lock is released as soon as the guard is dropped"]
        pub struct $name<'a, K: LockKey> {
            inner: HeldKey<'a, K>,
        }

        impl<'a, K: LockKey> $name<'a, K> {
            pub fn key(&self) -> &K {
                &self.inner.key
            }
        }

        impl<'a, K: LockKey> Guard for $name<'a, K> {
            fn resource_type(&self) -> &'static str {
                self.inner.metadata.resource_type
            }

            fn metadata(&self) -> &GuardMetadata {
                &self.inner.metadata
            }

            fn is_active(&self) -> bool {
                !self.inner.released
            }

            fn release(&mut self) -> GuardResult<()> {
                if self.inner.released {
                    return Err(GuardError::AlreadyReleased);
                }
                self.inner.released = true;
                trace!(
                    key = ?self.inner.key,
                    op = stringify!($release),
                    held_us = self.inner.metadata.lifetime_micros(),
                    "key lock released by guard"
                );
                self.inner
                    .lock
                    .$release(&self.inner.key)
                    .map_err(|_| GuardError::NotOwner)
            }
        }

        impl<'a, K: LockKey> Drop for $name<'a, K> {
            fn drop(&mut self) {
                if !self.inner.released {
                    let _ = Guard::release(self);
                }
            }
        }

        impl<'a, K: LockKey> Debug for $name<'a, K> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("key", &self.inner.key)
                    .field("released", &self.inner.released)
                    .finish()
            }
        }
    };
}

key_guard!(KeyReadGuard, release_read, "Shared hold on one key");
key_guard!(KeyWriteGuard, release_write, "Exclusive hold on one key");
