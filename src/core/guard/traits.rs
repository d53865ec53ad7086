/*!
 * Guard Traits
 *
 * Core abstraction for RAII guards handed out by limiters
 */

use super::{GuardMetadata, GuardResult};

/// Core guard trait
///
/// All guards provide:
/// - Resource type identification
/// - Metadata access
/// - Manual release capability
///
/// Dropping an unreleased guard releases it.
pub trait Guard {
    /// Resource type name for logging/debugging
    fn resource_type(&self) -> &'static str;

    /// Get guard metadata
    fn metadata(&self) -> &GuardMetadata;

    /// Check if guard still holds its resource
    fn is_active(&self) -> bool;

    /// Manually release the resource
    ///
    /// Returns `Err(GuardError::AlreadyReleased)` if already released
    fn release(&mut self) -> GuardResult<()>;
}

#[cfg(test)]
mod tests {
    use super::super::GuardError;
    use super::*;

    struct TestGuard {
        metadata: GuardMetadata,
        active: bool,
    }

    impl Guard for TestGuard {
        fn resource_type(&self) -> &'static str {
            "test"
        }

        fn metadata(&self) -> &GuardMetadata {
            &self.metadata
        }

        fn is_active(&self) -> bool {
            self.active
        }

        fn release(&mut self) -> GuardResult<()> {
            if !self.active {
                return Err(GuardError::AlreadyReleased);
            }
            self.active = false;
            Ok(())
        }
    }

    #[test]
    fn test_guard_release() {
        let mut guard = TestGuard {
            metadata: GuardMetadata::new("test"),
            active: true,
        };

        assert!(guard.is_active());
        assert!(guard.release().is_ok());
        assert!(!guard.is_active());
        assert_eq!(guard.release(), Err(GuardError::AlreadyReleased));
        assert_eq!(guard.resource_type(), "test");
    }
}
