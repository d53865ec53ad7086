/*!
 * Circuit Breaker State Machine
 *
 * `GateCore` is the mutex-guarded part of a gate. Every method takes `now`
 * explicitly and pushes the transitions it performs into `events`, so the
 * caller can notify listeners after releasing the lock.
 */

use super::config::{BreakerConfig, HalfOpenPolicy};
use crate::core::clock::instant_after;
use crate::core::types::LimiterName;
use ahash::RandomState;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::time::Instant;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Permits are issued freely
    Closed,
    /// No permits until the cooldown expires
    Open,
    /// One probe permit at a time
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Why a transition happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum TransitionReason {
    /// Recent failures reached the threshold
    ThresholdReached { failures: usize },
    /// A failure classified as fatal
    FatalFailure,
    /// The probe of a half-open gate failed
    ProbeFailed,
    /// The open cooldown expired
    CooldownElapsed,
    /// A permit marked successful was released
    SuccessReleased,
}

/// A state transition, delivered to listeners
///
/// Listeners run outside the gate lock, so changes raised on different threads
/// may arrive out of order. `seq` is assigned under the lock and counts up from
/// 1 per gate; order by it when the sequence matters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub gate: LimiterName,
    pub seq: u64,
    pub from: CircuitState,
    pub to: CircuitState,
    pub reason: TransitionReason,
    pub at: Instant,
}

/// Mutable state of one gate
#[derive(Debug)]
pub(super) struct GateCore {
    state: CircuitState,
    failures: VecDeque<Instant>,
    deny_until: Option<Instant>,
    issued: HashSet<u64, RandomState>,
    next_permit: u64,
    transitions: u64,
}

impl GateCore {
    pub(super) fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            deny_until: None,
            issued: HashSet::default(),
            next_permit: 0,
            transitions: 0,
        }
    }

    pub(super) fn state(&self) -> CircuitState {
        self.state
    }

    pub(super) fn outstanding(&self) -> usize {
        self.issued.len()
    }

    pub(super) fn transitions(&self) -> u64 {
        self.transitions
    }

    pub(super) fn deny_until(&self) -> Option<Instant> {
        self.deny_until
    }

    /// Failures still inside the expiry window
    pub(super) fn recent_failures(&mut self, now: Instant, config: &BreakerConfig) -> usize {
        self.prune(now, config);
        self.failures.len()
    }

    /// Lazy OPEN -> HALF_OPEN check
    pub(super) fn refresh(&mut self, gate: &LimiterName, now: Instant, events: &mut Vec<StateChange>) {
        if self.state == CircuitState::Open && self.deny_until.map_or(true, |until| now >= until) {
            self.deny_until = None;
            self.transition(gate, CircuitState::HalfOpen, TransitionReason::CooldownElapsed, now, events);
        }
    }

    /// Issue a permit id if the current state allows it
    pub(super) fn try_issue(
        &mut self,
        gate: &LimiterName,
        now: Instant,
        events: &mut Vec<StateChange>,
    ) -> Option<u64> {
        self.refresh(gate, now, events);

        let allowed = match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            // Serialize probes: one outstanding permit at a time
            CircuitState::HalfOpen => self.issued.is_empty(),
        };
        if !allowed {
            return None;
        }

        let id = self.next_permit;
        self.next_permit = self.next_permit.wrapping_add(1);
        self.issued.insert(id);
        Some(id)
    }

    /// Record a failure and apply the threshold / fatal rules
    pub(super) fn record_failure(
        &mut self,
        gate: &LimiterName,
        fatal: bool,
        now: Instant,
        config: &BreakerConfig,
        events: &mut Vec<StateChange>,
    ) {
        self.failures.push_back(now);
        self.prune(now, config);

        let reason = if fatal {
            Some(TransitionReason::FatalFailure)
        } else if self.state == CircuitState::HalfOpen
            && config.half_open_policy == HalfOpenPolicy::Reopen
        {
            Some(TransitionReason::ProbeFailed)
        } else if self.failures.len() >= config.failure_threshold as usize {
            Some(TransitionReason::ThresholdReached {
                failures: self.failures.len(),
            })
        } else {
            None
        };

        if let Some(reason) = reason {
            // Already open: push the deadline out without a new transition
            self.deny_until = Some(instant_after(now, config.reset_timeout));
            self.transition(gate, CircuitState::Open, reason, now, events);
        }
    }

    /// Forget a permit; a successful one closes the gate
    ///
    /// Returns false if the permit was not outstanding.
    pub(super) fn release(
        &mut self,
        gate: &LimiterName,
        id: u64,
        success: bool,
        now: Instant,
        events: &mut Vec<StateChange>,
    ) -> bool {
        if !self.issued.remove(&id) {
            return false;
        }
        if success && self.state != CircuitState::Closed {
            self.failures.clear();
            self.deny_until = None;
            self.transition(gate, CircuitState::Closed, TransitionReason::SuccessReleased, now, events);
        }
        true
    }

    fn prune(&mut self, now: Instant, config: &BreakerConfig) {
        while let Some(&oldest) = self.failures.front() {
            if now.saturating_duration_since(oldest) > config.failure_expiry {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn transition(
        &mut self,
        gate: &LimiterName,
        to: CircuitState,
        reason: TransitionReason,
        now: Instant,
        events: &mut Vec<StateChange>,
    ) {
        if self.state == to {
            return;
        }
        let from = std::mem::replace(&mut self.state, to);
        self.transitions += 1;
        events.push(StateChange {
            gate: gate.clone(),
            seq: self.transitions,
            from,
            to,
            reason,
            at: now,
        });
    }
}
