//! TaskSync Sync - Offline sync transactions and batch transfers
//!
//! Provides:
//! - `OperationLog`: idempotent, server-timestamped ingestion of client operations
//! - `OperationProcessor`: detect and resolve one logged operation
//! - `SessionRegistry`: process-wide table of in-flight sessions with guaranteed release
//! - `SyncCoordinator`: one sync transaction per (user, device)
//! - `BatchScheduler`: bounded, cancellable batch processing with progress events
//! - `TransferService`: backlog replay and dataset export on top of the scheduler
//! - `ChangeFeed`: broadcast implementation of the change notification port

pub mod batch;
pub mod coordinator;
pub mod notify;
pub mod oplog;
pub mod processor;
pub mod progress;
pub mod registry;
pub mod transfer;

pub use batch::{BatchEvent, BatchOptions, BatchScheduler, ItemError, RunResult};
pub use coordinator::{FailureKind, OperationFailure, SyncCoordinator, SyncRequest, SyncResponse};
pub use notify::ChangeFeed;
pub use oplog::OperationLog;
pub use processor::{OperationProcessor, ProcessOutcome};
pub use progress::{BatchStatus, RunStatus, ThroughputWindow};
pub use registry::{SessionGuard, SessionRegistry};
pub use transfer::{IExportSink, TransferService};

use tasksync_conflict::ConflictError;
use tasksync_core::domain::{DeviceId, DomainError, UserId};
use thiserror::Error;

/// Errors surfaced by sync transactions and batch runs
///
/// Conflicts are never errors; they are returned as data.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Malformed operation or request, rejected before it is logged
    #[error("validation failed: {0}")]
    Validation(String),

    /// Referenced entity or operation does not exist for this user
    #[error("not found: {0}")]
    NotFound(String),

    /// Another sync for the same client is in flight
    #[error("sync already in progress for user {user_id} on device {device_id}")]
    SyncInProgress { user_id: UserId, device_id: DeviceId },

    /// Another batch run for the same user is in flight
    #[error("batch run already in progress for user {0}")]
    RunInProgress(UserId),

    /// Cancel requested but nothing is running
    #[error("no active batch run for user {0}")]
    NoActiveRun(UserId),

    /// A cooperative stop was honored
    #[error("cancelled")]
    Cancelled,

    /// Store or log unavailable
    #[error("infrastructure error: {0}")]
    Infrastructure(#[from] anyhow::Error),
}

impl SyncError {
    /// Returns true when the whole transaction or run must stop
    ///
    /// Validation and not-found failures are recorded per operation instead.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SyncError::Validation(_) | SyncError::NotFound(_))
    }

    /// Stable label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Validation(_) => "validation",
            SyncError::NotFound(_) => "not_found",
            SyncError::SyncInProgress { .. } => "sync_in_progress",
            SyncError::RunInProgress(_) => "run_in_progress",
            SyncError::NoActiveRun(_) => "no_active_run",
            SyncError::Cancelled => "cancelled",
            SyncError::Infrastructure(_) => "infrastructure",
        }
    }
}

impl From<DomainError> for SyncError {
    fn from(err: DomainError) -> Self {
        SyncError::Validation(err.to_string())
    }
}

impl From<ConflictError> for SyncError {
    fn from(err: ConflictError) -> Self {
        match err {
            ConflictError::NotFound(what) => SyncError::NotFound(what),
            ConflictError::AlreadyResolved(_)
            | ConflictError::InvalidRequest(_)
            | ConflictError::Settled { .. } => SyncError::Validation(err.to_string()),
            ConflictError::Stale(_) => SyncError::Infrastructure(anyhow::anyhow!(err)),
            ConflictError::Storage(e) => SyncError::Infrastructure(e),
        }
    }
}
