//! Operation store port (driven/secondary port)
//!
//! Durable backing for the operation log and for persisted conflict
//! records awaiting manual resolution. It is also the only write path for
//! entities: [`IOperationStore::commit`] settles an operation and writes
//! the entity change it caused as one atomic step, so a failed commit
//! leaves the operation replayable and a successful one can never be
//! applied again.

use crate::domain::{
    ConflictRecord, ConflictStatus, EntityId, EntityMutation, EntitySnapshot, Operation,
    OperationDraft, OperationId, SyncStatus, UserId,
};

/// Result of an idempotent insert
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// The draft was stored under a freshly assigned ID
    Inserted(Operation),
    /// An operation with the same sequence ID already existed; returned unchanged
    Existing(Operation),
}

impl InsertOutcome {
    pub fn operation(&self) -> &Operation {
        match self {
            InsertOutcome::Inserted(op) | InsertOutcome::Existing(op) => op,
        }
    }

    pub fn into_operation(self) -> Operation {
        match self {
            InsertOutcome::Inserted(op) | InsertOutcome::Existing(op) => op,
        }
    }

    pub fn is_existing(&self) -> bool {
        matches!(self, InsertOutcome::Existing(_))
    }
}

/// Entity side of an [`OperationCommit`]
#[derive(Debug, Clone, PartialEq)]
pub enum EntityWrite {
    /// Commit a mutation; a rejected mutation aborts the whole commit
    Mutate(EntityMutation),
    /// Only set the conflict marker, when the entity is visible to the owner
    MarkConflict(EntityId, ConflictStatus),
}

/// Everything that changes when one logged operation is settled
#[derive(Debug, Clone, PartialEq)]
pub struct OperationCommit {
    pub operation_id: OperationId,
    pub owner: UserId,
    /// Status the caller read; the commit is refused once it has changed
    pub expected_status: SyncStatus,
    /// Version of the owner's entity the decision was based on (`None`: absent)
    pub expected_version: Option<u64>,
    pub write: EntityWrite,
    /// Status the operation moves to
    pub status: SyncStatus,
    /// Conflict record stored with the commit
    pub conflict: Option<ConflictRecord>,
}

/// Result of [`IOperationStore::commit`]
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    /// Entity written, status moved, conflict stored; carries the mutated
    /// snapshot (`None` for a marker-only write)
    Committed(Option<EntitySnapshot>),
    /// The entity rejected the mutation (missing, foreign owner, UPDATE on a
    /// tombstone); nothing was written
    Rejected,
    /// The entity moved past `expected_version`; nothing was written
    Stale,
    /// The operation already left `expected_status`; nothing was written
    Settled(SyncStatus),
}

impl OperationCommit {
    /// Decides the commit against what the store currently holds
    ///
    /// `Ok` carries the entity row to write (`None`: leave entities alone);
    /// `Err` is the outcome to report without writing anything. Store
    /// adapters call this inside their transaction so every backend settles
    /// operations identically.
    pub fn evaluate(
        &self,
        stored_status: SyncStatus,
        current: Option<&EntitySnapshot>,
    ) -> Result<Option<EntitySnapshot>, CommitOutcome> {
        if stored_status != self.expected_status {
            return Err(CommitOutcome::Settled(stored_status));
        }

        let visible = current.filter(|entity| entity.owner_id == self.owner);
        if visible.map(|entity| entity.version) != self.expected_version {
            return Err(CommitOutcome::Stale);
        }

        match &self.write {
            EntityWrite::Mutate(mutation) => {
                EntitySnapshot::apply_mutation(current, self.owner, mutation)
                    .map(Some)
                    .ok_or(CommitOutcome::Rejected)
            }
            EntityWrite::MarkConflict(_, status) => Ok(visible.map(|entity| {
                let mut marked = entity.clone();
                marked.conflict_status = *status;
                marked
            })),
        }
    }

    /// Outcome reported once `row` has been written
    pub fn committed(&self, row: Option<EntitySnapshot>) -> CommitOutcome {
        match self.write {
            EntityWrite::Mutate(_) => CommitOutcome::Committed(row),
            EntityWrite::MarkConflict(..) => CommitOutcome::Committed(None),
        }
    }

    /// Entity the write targets
    pub fn entity_id(&self) -> EntityId {
        match &self.write {
            EntityWrite::Mutate(mutation) => mutation.entity_id,
            EntityWrite::MarkConflict(id, _) => *id,
        }
    }
}

/// Port trait for operation and conflict persistence
///
/// ## Implementation Notes
///
/// - `insert_if_absent` must be atomic with respect to the sequence ID:
///   two concurrent inserts of the same sequence ID yield exactly one
///   `Inserted`.
/// - `commit` must be all-or-nothing: the status check, the entity write,
///   the status change and the conflict record land together or not at all.
/// - Listing methods return records ordered by server timestamp (oldest first).
#[async_trait::async_trait]
pub trait IOperationStore: Send + Sync {
    /// Stores the draft unless its sequence ID is already known
    async fn insert_if_absent(&self, draft: &OperationDraft) -> anyhow::Result<InsertOutcome>;

    /// Retrieves an operation by ID
    async fn get_operation(&self, id: OperationId) -> anyhow::Result<Option<Operation>>;

    /// Settles an operation together with its entity write
    ///
    /// Fails only on storage errors; refused commits are reported as a
    /// [`CommitOutcome`]. An unknown `operation_id` is an error.
    async fn commit(&self, commit: &OperationCommit) -> anyhow::Result<CommitOutcome>;

    /// Operations of `user` still in `pending` status
    async fn pending_operations(&self, user: UserId) -> anyhow::Result<Vec<Operation>>;

    /// Retrieves the conflict recorded for an operation
    async fn get_conflict(&self, operation_id: OperationId)
        -> anyhow::Result<Option<ConflictRecord>>;

    /// Conflicts of `user` whose operation is still `conflicted`
    async fn unresolved_conflicts(&self, user: UserId) -> anyhow::Result<Vec<ConflictRecord>>;
}
