/*!
 * Scaling Pool Configuration
 */

use crate::core::errors::ExecutorError;
use crate::core::limits::{
    DEFAULT_KEEP_ALIVE, DEFAULT_MAX_THREADS, DEFAULT_MIN_THREADS, DEFAULT_THREAD_PREFIX,
};
use crate::core::serde::{serde_as, DurationMilliSeconds};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sizing and timing of a scaling pool
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Threads kept alive while idle
    pub min_threads: usize,

    /// Upper bound on live threads
    pub max_threads: usize,

    /// Idle time before a thread above `min_threads` exits
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub keep_alive: Duration,

    /// Bound of the overflow queue used once at `max_threads`; unbounded if unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_capacity: Option<usize>,

    #[serde(default = "default_prefix")]
    pub thread_name_prefix: String,
}

fn default_prefix() -> String {
    DEFAULT_THREAD_PREFIX.to_string()
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_threads: DEFAULT_MIN_THREADS,
            max_threads: DEFAULT_MAX_THREADS,
            keep_alive: DEFAULT_KEEP_ALIVE,
            queue_capacity: None,
            thread_name_prefix: default_prefix(),
        }
    }
}

impl PoolConfig {
    pub fn new(min_threads: usize, max_threads: usize, keep_alive: Duration) -> Self {
        Self {
            min_threads,
            max_threads,
            keep_alive,
            ..Default::default()
        }
    }

    /// Many threads that mostly wait on I/O
    pub fn io_bound() -> Self {
        Self {
            min_threads: 2,
            max_threads: 64,
            keep_alive: Duration::from_secs(30),
            ..Default::default()
        }
    }

    /// One thread per core, kept alive
    pub fn cpu_bound() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(DEFAULT_MIN_THREADS);
        Self {
            min_threads: cores,
            max_threads: cores,
            ..Default::default()
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    pub fn validate(&self) -> Result<(), ExecutorError> {
        if self.max_threads == 0 {
            return Err(ExecutorError::InvalidConfig(
                "max_threads must be positive".into(),
            ));
        }
        if self.min_threads > self.max_threads {
            return Err(ExecutorError::InvalidConfig(format!(
                "min_threads ({}) exceeds max_threads ({})",
                self.min_threads, self.max_threads
            )));
        }
        if self.queue_capacity == Some(0) {
            return Err(ExecutorError::InvalidConfig(
                "queue_capacity must be positive when set".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_presets_validate() {
        assert!(PoolConfig::default().validate().is_ok());
        assert!(PoolConfig::io_bound().validate().is_ok());
        assert!(PoolConfig::cpu_bound().validate().is_ok());
    }

    #[test]
    fn test_min_above_max() {
        let config = PoolConfig::new(5, 2, Duration::from_secs(1));
        assert!(matches!(
            config.validate(),
            Err(ExecutorError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_deserialize_minimal() {
        let json = r#"{"min_threads":1,"max_threads":4,"keep_alive":250}"#;
        let config: PoolConfig = serde_json::from_str(json).unwrap();
        assert_eq!(
            config,
            PoolConfig::new(1, 4, Duration::from_millis(250))
        );
    }
}
