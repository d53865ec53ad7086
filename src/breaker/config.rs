/*!
 * Circuit Breaker Configuration
 *
 * Validated thresholds and timings for an admission gate
 */

use crate::core::errors::BreakerError;
use crate::core::limits::{
    DEFAULT_FAILURE_EXPIRY, DEFAULT_FAILURE_THRESHOLD, DEFAULT_RESET_TIMEOUT,
};
use crate::core::serde::{serde_as, DurationMilliSeconds};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What a failure reported while half-open does to the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HalfOpenPolicy {
    /// Any failure of the probe reopens the gate with a fresh cooldown
    #[default]
    Reopen,
    /// The probe failure joins the rolling failure window; the gate reopens
    /// only when that window reaches the threshold
    Accumulate,
}

/// Circuit breaker configuration
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Failures within `failure_expiry` that open the gate
    pub failure_threshold: u32,

    /// Age after which a failure stops counting
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub failure_expiry: Duration,

    /// Cooldown before an open gate lets a probe through
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub reset_timeout: Duration,

    #[serde(default)]
    pub half_open_policy: HalfOpenPolicy,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            failure_expiry: DEFAULT_FAILURE_EXPIRY,
            reset_timeout: DEFAULT_RESET_TIMEOUT,
            half_open_policy: HalfOpenPolicy::default(),
        }
    }
}

impl BreakerConfig {
    /// Trips quickly and probes again soon; for cheap, latency-critical calls
    pub const fn sensitive() -> Self {
        Self {
            failure_threshold: 2,
            failure_expiry: Duration::from_secs(10),
            reset_timeout: Duration::from_secs(5),
            half_open_policy: HalfOpenPolicy::Reopen,
        }
    }

    /// Tolerates bursts of errors; for flaky but important dependencies
    pub const fn tolerant() -> Self {
        Self {
            failure_threshold: 20,
            failure_expiry: Duration::from_secs(120),
            reset_timeout: Duration::from_secs(60),
            half_open_policy: HalfOpenPolicy::Accumulate,
        }
    }

    pub fn validate(&self) -> Result<(), BreakerError> {
        if self.failure_threshold == 0 {
            return Err(BreakerError::InvalidConfig(
                "failure_threshold must be positive".into(),
            ));
        }
        if self.failure_expiry.is_zero() {
            return Err(BreakerError::InvalidConfig(
                "failure_expiry must be non-zero".into(),
            ));
        }
        if self.reset_timeout.is_zero() {
            return Err(BreakerError::InvalidConfig(
                "reset_timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
