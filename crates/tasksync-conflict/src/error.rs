//! Error types for the conflict engine

use tasksync_core::domain::SyncStatus;
use thiserror::Error;

/// Errors that can occur during conflict resolution
///
/// Detecting a conflict is never an error; see
/// [`DetectionOutcome`](crate::detector::DetectionOutcome).
#[derive(Debug, Error)]
pub enum ConflictError {
    /// Operation or entity not found (or not visible to the caller)
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation already resolved
    #[error("conflict already resolved: {0}")]
    AlreadyResolved(String),

    /// Malformed resolution request
    #[error("invalid resolution request: {0}")]
    InvalidRequest(String),

    /// The entity changed after it was read; read it again and re-decide
    #[error("entity changed concurrently: {0}")]
    Stale(String),

    /// The operation was settled by another writer
    #[error("operation {operation} is already {status}")]
    Settled { operation: String, status: SyncStatus },

    /// Storage error
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_from_anyhow() {
        let err: ConflictError = anyhow::anyhow!("database is locked").into();
        assert!(matches!(err, ConflictError::Storage(_)));
        assert_eq!(err.to_string(), "storage error: database is locked");
    }

    #[test]
    fn test_settled_message_names_status() {
        let err = ConflictError::Settled {
            operation: "12".to_string(),
            status: SyncStatus::Resolved,
        };
        assert_eq!(err.to_string(), "operation 12 is already resolved");
    }
}
