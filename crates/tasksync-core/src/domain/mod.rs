//! Domain entities and business logic
//!
//! This module contains the core domain types for TaskSync:
//! - Newtypes for type-safe identifiers and the authoritative `Timestamp`
//! - Client operations and their persisted form
//! - Entity snapshots and the mutations the core requests on them
//! - Conflict records and resolution requests
//! - Sync session and batch run state
//! - Domain-specific error types

pub mod conflict;
pub mod entity;
pub mod errors;
pub mod newtypes;
pub mod operation;
pub mod session;

// Re-export commonly used types
pub use conflict::{ConflictRecord, ConflictResolutionRequest, ResolutionChoice};
pub use entity::{ConflictStatus, EntityMutation, EntitySnapshot, MutationKind};
pub use errors::DomainError;
pub use newtypes::*;
pub use operation::{NewOperation, Operation, OperationDraft, OperationType, SyncStatus};
pub use session::{BatchProgress, BatchState, SessionKey, SyncSession};
