/*!
 * Limits and Defaults
 *
 * Centralized location for default thresholds, capacities and timings.
 * Organized by component so presets stay discoverable.
 */

use std::time::Duration;

// =============================================================================
// CIRCUIT BREAKER
// =============================================================================

/// Failures within the expiry window that open the gate
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Failures older than this no longer count toward the threshold
pub const DEFAULT_FAILURE_EXPIRY: Duration = Duration::from_secs(60);

/// How long an open gate denies permits before probing
pub const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// KEYED LOCKS
// =============================================================================

/// Period of the idle-lock sweep
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Thread name of the idle-lock sweeper
pub const SWEEPER_THREAD_NAME: &str = "loadguard-lock-sweeper";

// =============================================================================
// BOUNDED EXECUTOR
// =============================================================================

/// Tasks admitted (queued + running) before submitters block
pub const DEFAULT_MAX_PENDING_TASKS: usize = 1024;

/// How long a submitter waits for an admission slot
pub const DEFAULT_ADMISSION_WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// SCALING POOL
// =============================================================================

/// Threads kept alive even when idle
pub const DEFAULT_MIN_THREADS: usize = 1;

/// Upper bound on live worker threads
pub const DEFAULT_MAX_THREADS: usize = 16;

/// Idle time after which threads above the minimum retire
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Prefix for worker thread names
pub const DEFAULT_THREAD_PREFIX: &str = "loadguard-worker";
