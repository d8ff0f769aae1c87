//! Error types for strand-core
//!
//! Small enum errors with `Display` and `std::error::Error`, kept
//! dependency-free so downstream crates can convert them freely.

use std::fmt;

/// Errors from the region allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaError {
    /// The address-space reservation itself failed (mmap).
    ReserveFailed,
    /// Committing or decommitting pages failed (mprotect).
    ProtectFailed,
    /// A requested allocation would exceed the arena ceiling.
    OutOfMemory,
    /// min/max arguments do not describe a valid arena.
    InvalidBounds,
}

impl fmt::Display for ArenaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArenaError::ReserveFailed => write!(f, "arena: address-space reservation failed"),
            ArenaError::ProtectFailed => write!(f, "arena: page protection change failed"),
            ArenaError::OutOfMemory => write!(f, "arena: allocation exceeds ceiling"),
            ArenaError::InvalidBounds => write!(f, "arena: invalid min/max bounds"),
        }
    }
}

impl std::error::Error for ArenaError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert!(ArenaError::OutOfMemory.to_string().contains("ceiling"));
        assert!(ArenaError::ReserveFailed.to_string().contains("reservation"));
    }
}
