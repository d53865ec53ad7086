/*!
 * Circuit Breaker
 * Admission gate that stops calling a dependency after repeated failures
 * and probes it again after a cooldown
 */

mod config;
mod gate;
mod listener;
mod permit;
mod state;

pub use config::{BreakerConfig, HalfOpenPolicy};
pub use gate::{BreakerBuilder, BreakerStats, CircuitBreaker};
pub use listener::{FnListener, StateListener};
pub use permit::AccessPermit;
pub use state::{CircuitState, StateChange, TransitionReason};
