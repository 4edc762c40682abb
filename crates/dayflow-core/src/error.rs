//! # Error Types
//!
//! Domain-specific error types for dayflow-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  dayflow-core errors (this file)                                       │
//! │  ├── CoreError        - Envelope / payload errors                      │
//! │  └── ValidationError  - Path segment validation failures               │
//! │                                                                         │
//! │  dayflow-db errors (separate crate)                                    │
//! │  └── DbError          - Local store failures                           │
//! │                                                                         │
//! │  dayflow-sync errors (separate crate)                                  │
//! │  └── SyncError        - Transport, retry, config failures              │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → error callback        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Errors raised while building or reading envelopes and paths.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A remote payload does not have the envelope shape.
    ///
    /// ## When This Occurs
    /// - A node under a collection path is a bare value, not `{data, timestamp, ...}`
    /// - Another client wrote with an older schema
    #[error("Malformed envelope at {path}: {reason}")]
    MalformedEnvelope { path: String, reason: String },

    /// Payload could not be converted to or from JSON.
    #[error("Payload conversion failed: {0}")]
    Payload(#[from] serde_json::Error),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl CoreError {
    /// Creates a MalformedEnvelope error.
    pub fn malformed(path: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::MalformedEnvelope {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Invalid format (e.g., forbidden character in a path segment).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CoreError::malformed("users/u/dailyData/2024-01-01", "missing timestamp");
        assert_eq!(
            err.to_string(),
            "Malformed envelope at users/u/dailyData/2024-01-01: missing timestamp"
        );
    }

    #[test]
    fn test_validation_error_messages() {
        let err = ValidationError::Required {
            field: "collection".to_string(),
        };
        assert_eq!(err.to_string(), "collection is required");

        let err = ValidationError::TooLong {
            field: "key".to_string(),
            max: 768,
        };
        assert_eq!(err.to_string(), "key must be at most 768 characters");
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let validation_err = ValidationError::Required {
            field: "key".to_string(),
        };
        let core_err: CoreError = validation_err.into();
        assert!(matches!(core_err, CoreError::Validation(_)));
    }
}
