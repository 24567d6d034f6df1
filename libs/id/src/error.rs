//! Error types for ID parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// A segment is empty.
    #[error("{segment} cannot be empty")]
    Empty { segment: &'static str },

    /// A segment contains a reserved character.
    #[error("{segment} contains reserved character '{character}': {actual}")]
    InvalidCharacter {
        segment: &'static str,
        character: char,
        actual: String,
    },

    /// The endpoint path does not have exactly four segments.
    #[error("endpoint path must have 4 segments, got {count}: {actual}")]
    WrongSegmentCount { count: usize, actual: String },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty { .. })
    }
}
