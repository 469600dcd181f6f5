//! Port definitions (hexagonal architecture interfaces)
//!
//! Ports are the traits the sync engine depends on; their implementations
//! live in adapter crates (`tasksync-cache` for SQLite) or in the host
//! application.
//!
//! ## Ports Overview
//!
//! - [`IEntityStore`] - Reads entity snapshots and deltas
//! - [`IOperationStore`] - Durable operation log, conflict records, and the
//!   atomic commit that settles an operation with its entity write
//! - [`IChangeNotifier`] - One-way "entity changed" notification sink

pub mod entity_store;
pub mod notification;
pub mod operation_store;

pub use entity_store::IEntityStore;
pub use notification::{EntityChange, IChangeNotifier};
pub use operation_store::{
    CommitOutcome, EntityWrite, IOperationStore, InsertOutcome, OperationCommit,
};
