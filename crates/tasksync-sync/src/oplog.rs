//! Operation log
//!
//! Durable, append-only, idempotent record of client operations keyed by
//! sequence ID. Appending an already known sequence ID returns the stored
//! record unchanged; otherwise the operation is stamped by the
//! [`HybridClock`] and persisted as `pending`.

use std::sync::Arc;

use tracing::{debug, trace};

use tasksync_core::{
    clock::HybridClock,
    domain::{DeviceId, NewOperation, Operation, OperationDraft, SequenceId, UserId},
    ports::{IOperationStore, InsertOutcome},
};

use crate::SyncError;

/// Idempotent operation log over an [`IOperationStore`]
pub struct OperationLog {
    store: Arc<dyn IOperationStore>,
    clock: Arc<HybridClock>,
}

impl OperationLog {
    pub fn new(store: Arc<dyn IOperationStore>, clock: Arc<HybridClock>) -> Self {
        Self { store, clock }
    }

    /// Validates, stamps and persists an operation
    ///
    /// `device_id` is the submitting device; an operation may name a
    /// different one. A sequence ID already owned by another user is a
    /// validation failure.
    #[tracing::instrument(
        skip(self, op),
        fields(entity_id = %op.entity_id, operation_type = %op.operation_type)
    )]
    pub async fn append(
        &self,
        user_id: UserId,
        device_id: &DeviceId,
        op: NewOperation,
    ) -> Result<Operation, SyncError> {
        op.validate()?;

        // Stamped before the insert, which is where duplicates are detected;
        // a duplicate discards its stamp and keeps the stored one
        let stamp = self.clock.stamp();
        let draft = OperationDraft {
            sequence_id: op.sequence_id.unwrap_or_else(SequenceId::generate),
            user_id,
            entity_id: op.entity_id,
            operation_type: op.operation_type,
            field_name: op.field_name,
            old_value: op.old_value,
            new_value: op.new_value,
            client_timestamp: op.client_timestamp,
            server_timestamp: stamp.timestamp,
            logical_counter: stamp.logical,
            device_id: op.device_id.unwrap_or_else(|| device_id.clone()),
        };

        match self.store.insert_if_absent(&draft).await? {
            InsertOutcome::Inserted(stored) => {
                trace!(
                    sequence_id = %stored.sequence_id,
                    server_timestamp = %stored.server_timestamp,
                    "Operation logged"
                );
                Ok(stored)
            }
            InsertOutcome::Existing(stored) if stored.user_id != user_id => {
                Err(SyncError::Validation(format!(
                    "sequence ID {} is already in use",
                    stored.sequence_id
                )))
            }
            InsertOutcome::Existing(stored) => {
                debug!(
                    sequence_id = %stored.sequence_id,
                    status = %stored.sync_status,
                    "Duplicate sequence ID, returning stored operation"
                );
                Ok(stored)
            }
        }
    }

    /// Operations of `user_id` not yet applied, oldest first
    pub async fn pending(&self, user_id: UserId) -> Result<Vec<Operation>, SyncError> {
        Ok(self.store.pending_operations(user_id).await?)
    }

    pub fn clock(&self) -> &Arc<HybridClock> {
        &self.clock
    }
}
