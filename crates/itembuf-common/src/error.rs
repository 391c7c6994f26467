//! Error types for itembuf.

use thiserror::Error;

/// Result type alias using ItembufError.
pub type Result<T> = std::result::Result<T, ItembufError>;

/// Errors that can occur in itembuf operations.
#[derive(Debug, Error)]
pub enum ItembufError {
    // Type errors
    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    // Lookup errors
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Index {index} out of range (count {count})")]
    OutOfRange { index: usize, count: usize },

    #[error("Stale reference at offset {offset}")]
    StaleReference { offset: u32 },

    // Buffer errors
    #[error("Capacity exceeded: requested {requested} bytes (limit {limit})")]
    CapacityExceeded { requested: usize, limit: usize },

    #[error("Malformed buffer at offset {offset}: {reason}")]
    MalformedBuffer { offset: usize, reason: String },

    #[error("Invalid UTF-8 in item at offset {offset}")]
    InvalidUtf8 { offset: u32 },

    // Name errors
    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Duplicate name: {0}")]
    DuplicateName(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // I/O errors from collaborators persisting exported bytes
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Payload-free discriminant of an [`ItembufError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    TypeMismatch,
    NotFound,
    OutOfRange,
    StaleReference,
    CapacityExceeded,
    MalformedBuffer,
    InvalidUtf8,
    InvalidName,
    DuplicateName,
    Config,
    Io,
}

impl ItembufError {
    /// Returns the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ItembufError::TypeMismatch { .. } => ErrorKind::TypeMismatch,
            ItembufError::NotFound(_) => ErrorKind::NotFound,
            ItembufError::OutOfRange { .. } => ErrorKind::OutOfRange,
            ItembufError::StaleReference { .. } => ErrorKind::StaleReference,
            ItembufError::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            ItembufError::MalformedBuffer { .. } => ErrorKind::MalformedBuffer,
            ItembufError::InvalidUtf8 { .. } => ErrorKind::InvalidUtf8,
            ItembufError::InvalidName(_) => ErrorKind::InvalidName,
            ItembufError::DuplicateName(_) => ErrorKind::DuplicateName,
            ItembufError::Config(_) => ErrorKind::Config,
            ItembufError::Io(_) => ErrorKind::Io,
        }
    }

    /// Shorthand for a `MalformedBuffer` error.
    pub fn malformed(offset: usize, reason: impl Into<String>) -> Self {
        ItembufError::MalformedBuffer {
            offset,
            reason: reason.into(),
        }
    }

    /// Shorthand for a `TypeMismatch` error.
    pub fn type_mismatch(expected: impl ToString, actual: impl ToString) -> Self {
        ItembufError::TypeMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind as IoErrorKind};

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(IoErrorKind::NotFound, "file not found");
        let err: ItembufError = io_err.into();
        assert!(matches!(err, ItembufError::Io(_)));
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_type_mismatch_display() {
        let err = ItembufError::type_mismatch("INT64", "STRING");
        assert_eq!(err.to_string(), "Type mismatch: expected INT64, got STRING");
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    }

    #[test]
    fn test_lookup_errors_display() {
        let err = ItembufError::NotFound("name \"tags\"".to_string());
        assert_eq!(err.to_string(), "Not found: name \"tags\"");

        let err = ItembufError::OutOfRange { index: 5, count: 3 };
        assert_eq!(err.to_string(), "Index 5 out of range (count 3)");

        let err = ItembufError::StaleReference { offset: 64 };
        assert_eq!(err.to_string(), "Stale reference at offset 64");
        assert_eq!(err.kind(), ErrorKind::StaleReference);
    }

    #[test]
    fn test_buffer_errors_display() {
        let err = ItembufError::CapacityExceeded {
            requested: 8192,
            limit: 4096,
        };
        assert_eq!(
            err.to_string(),
            "Capacity exceeded: requested 8192 bytes (limit 4096)"
        );

        let err = ItembufError::malformed(0, "item length 8 shorter than header");
        assert_eq!(
            err.to_string(),
            "Malformed buffer at offset 0: item length 8 shorter than header"
        );
        assert_eq!(err.kind(), ErrorKind::MalformedBuffer);
    }

    #[test]
    fn test_name_errors_display() {
        let err = ItembufError::InvalidName("empty name".to_string());
        assert_eq!(err.to_string(), "Invalid name: empty name");

        let err = ItembufError::DuplicateName("count".to_string());
        assert_eq!(err.to_string(), "Duplicate name: count");
    }

    #[test]
    fn test_kinds_are_distinct() {
        let errors = [
            ItembufError::type_mismatch("a", "b"),
            ItembufError::NotFound("x".to_string()),
            ItembufError::OutOfRange { index: 0, count: 0 },
            ItembufError::StaleReference { offset: 0 },
            ItembufError::CapacityExceeded {
                requested: 0,
                limit: 0,
            },
            ItembufError::malformed(0, "x"),
        ];
        let kinds: std::collections::HashSet<_> = errors.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds.len(), errors.len());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ItembufError>();
    }
}
