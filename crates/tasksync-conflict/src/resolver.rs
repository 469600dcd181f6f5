//! Conflict resolution executor
//!
//! Turns a [`ResolutionPolicy`] into an [`OperationCommit`] and hands it to
//! the operation store, which writes the entity and settles the operation
//! in one step:
//! - `AutoLww`: write the operation's value, record any conflict
//! - `ManualAcceptClient`: force-write the operation's value
//! - `ManualAcceptServer`: keep the entity's data, clear its conflict marker
//! - `ManualMerge`: write the supplied field map as a single version bump
//!
//! `updated_at` never moves backwards: a stamp that would not be newer than
//! the snapshot is replaced by a fresh clock reading.

use std::sync::Arc;

use tracing::{debug, info};

use tasksync_core::{
    clock::HybridClock,
    domain::{
        ConflictRecord, ConflictStatus, EntityMutation, EntitySnapshot, MutationKind, Operation,
        OperationType, SyncStatus, Timestamp,
    },
    ports::{CommitOutcome, EntityWrite, IOperationStore, OperationCommit},
};

use crate::{detector::DetectionOutcome, error::ConflictError, policy::ResolutionPolicy};

/// Commits refused as stale before a caller gives up
pub const MAX_COMMIT_ATTEMPTS: usize = 5;

/// What the resolver committed for one operation
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedResolution {
    /// The entity after the commit; `None` when the entity was not mutated
    pub snapshot: Option<EntitySnapshot>,
    /// Conflict surfaced by automatic resolution
    pub conflict: Option<ConflictRecord>,
    /// Status the operation moved to
    pub status: SyncStatus,
}

impl AppliedResolution {
    pub fn mutated(&self) -> bool {
        self.snapshot.is_some()
    }
}

/// Applies resolution policies through the operation store port
pub struct ConflictResolver {
    operation_store: Arc<dyn IOperationStore>,
    clock: Arc<HybridClock>,
    persist_conflicts: bool,
}

impl ConflictResolver {
    pub fn new(operation_store: Arc<dyn IOperationStore>, clock: Arc<HybridClock>) -> Self {
        Self {
            operation_store,
            clock,
            persist_conflicts: true,
        }
    }

    /// Whether automatic resolution stores its conflict records
    pub fn with_persist_conflicts(mut self, persist: bool) -> Self {
        self.persist_conflicts = persist;
        self
    }

    /// Applies `policy` to `op` and settles it
    ///
    /// `op` is the operation as last read from the store and `current` the
    /// snapshot the decision is based on. Fails with
    /// [`ConflictError::NotFound`] when the entity rejects the mutation,
    /// [`ConflictError::Stale`] when `current` is outdated, and
    /// [`ConflictError::Settled`] when `op` was settled in the meantime. In
    /// all three cases nothing was written.
    #[tracing::instrument(
        skip(self, op, current, outcome, policy),
        fields(sequence_id = %op.sequence_id, entity_id = %op.entity_id, policy = %policy)
    )]
    pub async fn apply(
        &self,
        op: &Operation,
        current: Option<&EntitySnapshot>,
        outcome: DetectionOutcome,
        policy: &ResolutionPolicy,
    ) -> Result<AppliedResolution, ConflictError> {
        let current = current.filter(|entity| entity.owner_id == op.user_id);

        let (write, conflict, status) = match policy {
            ResolutionPolicy::AutoLww => {
                let conflict = outcome.into_record();
                let updated_at = match current {
                    Some(snapshot) if op.server_timestamp <= snapshot.updated_at => {
                        self.fresh_timestamp(current)
                    }
                    _ => op.server_timestamp,
                };

                let mut mutation = EntityMutation::new(op.entity_id, mutation_kind(op), updated_at)
                    .with_fields(op.mutation_fields());
                if conflict.is_some() {
                    mutation = mutation.with_conflict_status(ConflictStatus::Detected);
                }
                let status = if conflict.is_some() {
                    SyncStatus::Conflicted
                } else {
                    SyncStatus::Synced
                };
                (EntityWrite::Mutate(mutation), conflict, status)
            }

            ResolutionPolicy::ManualAcceptClient => {
                let mutation = EntityMutation::new(
                    op.entity_id,
                    mutation_kind(op),
                    self.fresh_timestamp(current),
                )
                .with_fields(op.mutation_fields())
                .with_conflict_status(ConflictStatus::Resolved);
                (EntityWrite::Mutate(mutation), None, SyncStatus::Resolved)
            }

            ResolutionPolicy::ManualAcceptServer => (
                EntityWrite::MarkConflict(op.entity_id, ConflictStatus::Resolved),
                None,
                SyncStatus::Resolved,
            ),

            ResolutionPolicy::ManualMerge(fields) => {
                let mutation = EntityMutation::new(
                    op.entity_id,
                    MutationKind::Update,
                    self.fresh_timestamp(current),
                )
                .with_fields(fields.clone())
                .with_conflict_status(ConflictStatus::Resolved);
                (EntityWrite::Mutate(mutation), None, SyncStatus::Resolved)
            }
        };

        let commit = OperationCommit {
            operation_id: op.id,
            owner: op.user_id,
            expected_status: op.sync_status,
            expected_version: current.map(|entity| entity.version),
            write,
            status,
            conflict: conflict.clone().filter(|_| self.persist_conflicts),
        };

        let snapshot = match self.operation_store.commit(&commit).await? {
            CommitOutcome::Committed(snapshot) => snapshot,
            CommitOutcome::Rejected => {
                return Err(ConflictError::NotFound(format!("entity {}", op.entity_id)));
            }
            CommitOutcome::Stale => {
                return Err(ConflictError::Stale(format!("entity {}", op.entity_id)));
            }
            CommitOutcome::Settled(status) => {
                return Err(ConflictError::Settled {
                    operation: op.id.to_string(),
                    status,
                });
            }
        };

        let version = snapshot.as_ref().map(|snapshot| snapshot.version);
        match policy {
            ResolutionPolicy::AutoLww => {
                debug!(version = ?version, status = %status, "Operation committed");
            }
            ResolutionPolicy::ManualAcceptClient => {
                info!(version = ?version, "Client value accepted");
            }
            ResolutionPolicy::ManualAcceptServer => {
                info!("Server value kept, operation discarded");
            }
            ResolutionPolicy::ManualMerge(fields) => {
                info!(
                    version = ?version,
                    merged_fields = fields.len(),
                    "Merged value applied"
                );
            }
        }

        Ok(AppliedResolution {
            snapshot,
            conflict,
            status,
        })
    }

    /// A clock reading strictly newer than the snapshot
    fn fresh_timestamp(&self, current: Option<&EntitySnapshot>) -> Timestamp {
        let now = self.clock.now();
        match current {
            Some(snapshot) if now <= snapshot.updated_at => snapshot.updated_at.successor(),
            _ => now,
        }
    }
}

fn mutation_kind(op: &Operation) -> MutationKind {
    match op.operation_type {
        OperationType::Create => MutationKind::Create,
        OperationType::Update => MutationKind::Update,
        OperationType::Delete => MutationKind::Delete,
    }
}
