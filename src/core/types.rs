/*!
 * Core Types
 * Common type definitions shared by all limiters
 */

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;

/// Name attached to a limiter for diagnostics (gate name, executor name)
///
/// Names are short, so the inline representation avoids a heap allocation
pub type LimiterName = smartstring::alias::String;

/// A unit of work handed to a task sink
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Lock mode requested on a keyed lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Shared access
    Read,
    /// Exclusive access
    Write,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Read => write!(f, "read"),
            LockMode::Write => write!(f, "write"),
        }
    }
}

/// Extract a readable message from a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let payload = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload = std::panic::catch_unwind(|| panic!("code {}", 7)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "code 7");
    }

    #[test]
    fn test_lock_mode_display() {
        assert_eq!(LockMode::Read.to_string(), "read");
        assert_eq!(LockMode::Write.to_string(), "write");
    }
}
