/// Serde helper functions shared by config and stats types
pub use serde_with::{serde_as, DurationMilliSeconds};

/// Skip serializing if value is zero
pub fn is_zero_u64(value: &u64) -> bool {
    *value == 0
}

/// Skip serializing if value is zero
pub fn is_zero_usize(value: &usize) -> bool {
    *value == 0
}
