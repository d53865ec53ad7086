/*!
 * Access Permits
 *
 * A permit is the right to perform one guarded operation. The holder reports
 * the outcome, then releases it; releasing a permit marked successful closes
 * the gate. Dropping an unreleased permit releases it.
 */

use super::gate::GateShared;
use crate::core::errors::BreakerError;
use crate::core::guard::{Guard, GuardError, GuardMetadata, GuardResult};
use std::error::Error;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Unset,
    Success,
    Failure,
}

/// Permit issued by a circuit breaker
#[must_use = "a permit that is dropped immediately admits nothing"]
pub struct AccessPermit {
    gate: Arc<GateShared>,
    id: u64,
    outcome: Outcome,
    released: bool,
    metadata: GuardMetadata,
}

impl AccessPermit {
    pub(super) fn new(gate: Arc<GateShared>, id: u64) -> Self {
        Self {
            gate,
            id,
            outcome: Outcome::Unset,
            released: false,
            metadata: GuardMetadata::new("breaker_permit"),
        }
    }

    /// Name of the issuing gate
    pub fn gate(&self) -> &str {
        self.gate.name()
    }

    /// Mark the guarded operation as successful
    pub fn report_success(&mut self) -> Result<(), BreakerError> {
        self.check_reportable()?;
        self.outcome = Outcome::Success;
        Ok(())
    }

    /// Mark the guarded operation as failed
    ///
    /// The failure is recorded immediately and may open the gate.
    pub fn report_failure(&mut self, cause: &(dyn Error + 'static)) -> Result<(), BreakerError> {
        self.check_reportable()?;
        self.outcome = Outcome::Failure;
        self.gate.record_failure(cause);
        Ok(())
    }

    /// Return the permit to the gate
    pub fn release(&mut self) -> Result<(), BreakerError> {
        if self.released {
            return Err(BreakerError::PermitReleased {
                gate: self.gate.name().into(),
            });
        }
        self.released = true;
        self.gate
            .release(self.id, self.outcome == Outcome::Success);
        Ok(())
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    fn check_reportable(&self) -> Result<(), BreakerError> {
        if self.released {
            return Err(BreakerError::PermitReleased {
                gate: self.gate.name().into(),
            });
        }
        if self.outcome != Outcome::Unset {
            return Err(BreakerError::OutcomeAlreadyReported {
                gate: self.gate.name().into(),
            });
        }
        Ok(())
    }
}

impl Guard for AccessPermit {
    fn resource_type(&self) -> &'static str {
        self.metadata.resource_type
    }

    fn metadata(&self) -> &GuardMetadata {
        &self.metadata
    }

    fn is_active(&self) -> bool {
        !self.released
    }

    fn release(&mut self) -> GuardResult<()> {
        AccessPermit::release(self).map_err(|_| GuardError::AlreadyReleased)
    }
}

impl Drop for AccessPermit {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.gate
                .release(self.id, self.outcome == Outcome::Success);
        }
    }
}

impl std::fmt::Debug for AccessPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessPermit")
            .field("gate", &self.gate.name())
            .field("id", &self.id)
            .field("outcome", &self.outcome)
            .field("released", &self.released)
            .finish()
    }
}
