//! Domain error types
//!
//! This module defines error types specific to domain operations,
//! including malformed operations, invalid identifiers and bad requests.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A client operation is malformed and must be rejected before logging
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Invalid device identifier
    #[error("Invalid device ID: {0}")]
    InvalidDeviceId(String),

    /// Invalid sequence identifier
    #[error("Invalid sequence ID: {0}")]
    InvalidSequenceId(String),

    /// ID parsing error
    #[error("Invalid ID format: {0}")]
    InvalidId(String),

    /// Timestamp outside the representable range
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// Unknown enum value in a request or stored record
    #[error("Unknown {kind}: {value}")]
    UnknownVariant {
        /// Name of the enum being parsed
        kind: &'static str,
        /// The offending value
        value: String,
    },

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}
