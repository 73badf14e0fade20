//! # Error Types
//!
//! Domain errors for till-core. Everything here is about shape: a value
//! arrived that cannot be turned into one of our types.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  CoreError (this file)   - decode / validation failures                 │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  StoreError (till-store) - persistence failures                         │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SyncError (till-sync)   - protocol, auth, transport failures           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Result alias for till-core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised while decoding or validating domain values.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A record was not a JSON object.
    #[error("Record must be a JSON object, got {0}")]
    NotAnObject(String),

    /// A record had no usable `id`.
    ///
    /// ## When This Occurs
    /// - `id` missing entirely
    /// - `id` present but not a string
    /// - `id` is the empty string
    #[error("Record is missing a non-empty string id")]
    MissingId,

    /// A required field is missing or has the wrong type.
    #[error("Field '{field}' is missing or invalid: {reason}")]
    InvalidField { field: String, reason: String },

    /// Queue status string not recognised.
    #[error("Unknown queue status: '{0}'")]
    UnknownStatus(String),

    /// Payload for a recognised operation kind did not match its schema.
    #[error("Invalid payload for operation '{kind}': {reason}")]
    InvalidPayload { kind: String, reason: String },

    /// Timestamp could not be parsed as RFC 3339.
    #[error("Invalid timestamp '{value}': {reason}")]
    InvalidTimestamp { value: String, reason: String },
}

impl CoreError {
    /// Creates an InvalidField error.
    pub fn invalid_field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::InvalidPayload {
            kind: "json".to_string(),
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::invalid_field("productId", "expected string");
        assert!(err.to_string().contains("productId"));
        assert!(err.to_string().contains("expected string"));
    }
}
