/*!
 * Circuit Breaker
 *
 * Three-state admission gate protecting a failing dependency.
 *
 * ## Transitions
 *
 * - Closed -> Open: recent failures reach the threshold, or a fatal failure
 * - Open -> HalfOpen: cooldown elapsed, observed lazily by `state()` / `try_acquire()`
 * - HalfOpen -> Closed: a permit marked successful is released
 * - HalfOpen -> Open: a failed probe, per `HalfOpenPolicy`
 *
 * There is no background timer; all time-based transitions happen on access.
 */

use super::config::{BreakerConfig, HalfOpenPolicy};
use super::listener::{ListenerSet, StateListener};
use super::permit::AccessPermit;
use super::state::{CircuitState, GateCore, StateChange};
use crate::core::clock::{Clock, SystemClock};
use crate::core::errors::{BreakerError, CallError};
use crate::core::types::LimiterName;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

type FatalClassifier = Arc<dyn Fn(&(dyn Error + 'static)) -> bool + Send + Sync>;

/// State shared between a breaker and its permits
pub(super) struct GateShared {
    name: LimiterName,
    config: BreakerConfig,
    core: Mutex<GateCore>,
    listeners: ListenerSet,
    fatal: Option<FatalClassifier>,
    clock: Arc<dyn Clock>,
}

impl GateShared {
    pub(super) fn name(&self) -> &str {
        &self.name
    }

    pub(super) fn record_failure(&self, cause: &(dyn Error + 'static)) {
        let fatal = self.fatal.as_ref().map_or(false, |is_fatal| is_fatal(cause));
        let mut events = Vec::new();
        {
            let mut core = self.core.lock();
            let now = self.clock.now();
            core.record_failure(&self.name, fatal, now, &self.config, &mut events);
        }
        self.publish(events);
    }

    pub(super) fn release(&self, id: u64, success: bool) {
        let mut events = Vec::new();
        let known = {
            let mut core = self.core.lock();
            let now = self.clock.now();
            core.release(&self.name, id, success, now, &mut events)
        };
        debug_assert!(known, "permit {id} was not issued by gate {}", self.name);
        self.publish(events);
    }

    fn publish(&self, events: Vec<StateChange>) {
        for change in &events {
            if change.to == CircuitState::Open {
                warn!(
                    gate = %change.gate,
                    from = %change.from,
                    reason = ?change.reason,
                    cooldown_ms = self.config.reset_timeout.as_millis() as u64,
                    "circuit breaker opened"
                );
            } else {
                info!(
                    gate = %change.gate,
                    from = %change.from,
                    to = %change.to,
                    reason = ?change.reason,
                    "circuit breaker transition"
                );
            }
        }
        self.listeners.notify(&events);
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub recent_failures: usize,
    pub failure_threshold: u32,
    pub outstanding_permits: usize,
    pub transitions: u64,
    /// Time until an open gate admits a probe
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

/// Circuit breaker (admission gate)
///
/// Cloning yields another handle to the same gate.
///
/// # Example
///
/// ```
/// use loadguard::breaker::{CircuitBreaker, CircuitState};
/// use std::time::Duration;
///
/// let gate = CircuitBreaker::builder("db")
///     .failure_threshold(2)
///     .reset_timeout(Duration::from_secs(1))
///     .build()
///     .unwrap();
///
/// let err = std::io::Error::new(std::io::ErrorKind::Other, "down");
/// for _ in 0..2 {
///     let mut permit = gate.try_acquire().unwrap();
///     permit.report_failure(&err).unwrap();
/// }
/// assert_eq!(gate.state(), CircuitState::Open);
/// assert!(gate.try_acquire().is_none());
/// ```
#[derive(Clone)]
pub struct CircuitBreaker {
    shared: Arc<GateShared>,
}

impl CircuitBreaker {
    /// Breaker with the default configuration
    pub fn new(name: impl Into<LimiterName>) -> Self {
        Self::builder(name)
            .build()
            .unwrap_or_else(|_| unreachable!("default breaker config is valid"))
    }

    pub fn builder(name: impl Into<LimiterName>) -> BreakerBuilder {
        BreakerBuilder::new(name.into())
    }

    pub fn name(&self) -> &str {
        self.shared.name()
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.shared.config
    }

    /// Current state, applying the lazy Open -> HalfOpen check
    pub fn state(&self) -> CircuitState {
        let mut events = Vec::new();
        let state = {
            let mut core = self.shared.core.lock();
            let now = self.shared.clock.now();
            core.refresh(&self.shared.name, now, &mut events);
            core.state()
        };
        self.shared.publish(events);
        state
    }

    /// Request a permit without blocking
    ///
    /// Returns `None` while open, or while half-open with a probe outstanding.
    pub fn try_acquire(&self) -> Option<AccessPermit> {
        let mut events = Vec::new();
        let issued = {
            let mut core = self.shared.core.lock();
            let now = self.shared.clock.now();
            core.try_issue(&self.shared.name, now, &mut events)
        };
        self.shared.publish(events);
        issued.map(|id| AccessPermit::new(Arc::clone(&self.shared), id))
    }

    /// Run `op` under a permit, reporting its result
    ///
    /// Returns `CallError::Rejected` without running `op` if no permit is
    /// available.
    pub fn call<T, E, F>(&self, op: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Result<T, E>,
        E: Error + 'static,
    {
        let mut permit = self.try_acquire().ok_or_else(|| CallError::Rejected {
            gate: self.shared.name.clone(),
        })?;

        let result = op();
        // Fresh permit: reporting cannot fail
        let _ = match &result {
            Ok(_) => permit.report_success(),
            Err(e) => permit.report_failure(e),
        };
        let _ = permit.release();

        result.map_err(CallError::Failed)
    }

    /// Register a listener for state transitions
    pub fn add_listener(&self, listener: Arc<dyn StateListener>) {
        self.shared.listeners.add(listener);
    }

    /// Receive state transitions over a channel
    pub fn subscribe(&self) -> flume::Receiver<StateChange> {
        let (tx, rx) = flume::unbounded();
        self.shared.listeners.add(Arc::new(tx));
        rx
    }

    /// Permits issued and not yet released
    pub fn outstanding_permits(&self) -> usize {
        self.shared.core.lock().outstanding()
    }

    pub fn stats(&self) -> BreakerStats {
        let state = self.state();
        let mut core = self.shared.core.lock();
        let now = self.shared.clock.now();
        BreakerStats {
            name: self.shared.name.to_string(),
            state,
            recent_failures: core.recent_failures(now, &self.shared.config),
            failure_threshold: self.shared.config.failure_threshold,
            outstanding_permits: core.outstanding(),
            transitions: core.transitions(),
            retry_after_ms: core
                .deny_until()
                .map(|until| until.saturating_duration_since(now).as_millis() as u64),
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.shared.name)
            .field("state", &self.shared.core.lock().state())
            .field("config", &self.shared.config)
            .finish()
    }
}

/// Builder for [`CircuitBreaker`]
pub struct BreakerBuilder {
    name: LimiterName,
    config: BreakerConfig,
    listeners: Vec<Arc<dyn StateListener>>,
    fatal: Option<FatalClassifier>,
    clock: Arc<dyn Clock>,
}

impl BreakerBuilder {
    fn new(name: LimiterName) -> Self {
        Self {
            name,
            config: BreakerConfig::default(),
            listeners: Vec::new(),
            fatal: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn config(mut self, config: BreakerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn failure_expiry(mut self, expiry: Duration) -> Self {
        self.config.failure_expiry = expiry;
        self
    }

    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.config.reset_timeout = timeout;
        self
    }

    pub fn half_open_policy(mut self, policy: HalfOpenPolicy) -> Self {
        self.config.half_open_policy = policy;
        self
    }

    pub fn listener(mut self, listener: Arc<dyn StateListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Failures for which `is_fatal` returns true open the gate immediately
    pub fn fatal_when<F>(mut self, is_fatal: F) -> Self
    where
        F: Fn(&(dyn Error + 'static)) -> bool + Send + Sync + 'static,
    {
        self.fatal = Some(Arc::new(is_fatal));
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<CircuitBreaker, BreakerError> {
        self.config.validate()?;

        let listeners = ListenerSet::default();
        for listener in self.listeners {
            listeners.add(listener);
        }

        Ok(CircuitBreaker {
            shared: Arc::new(GateShared {
                name: self.name,
                config: self.config,
                core: Mutex::new(GateCore::new()),
                listeners,
                fatal: self.fatal,
                clock: self.clock,
            }),
        })
    }
}
