//! Conflict use cases
//!
//! Manual resolution of operations that automatic last-writer-wins flagged
//! as conflicted.

use std::sync::Arc;

use tracing::{debug, info};

use tasksync_core::{
    domain::{ConflictRecord, ConflictResolutionRequest, SyncStatus, UserId},
    ports::{IEntityStore, IOperationStore},
};

use crate::{
    detector::DetectionOutcome,
    error::ConflictError,
    policy::ResolutionPolicy,
    resolver::{AppliedResolution, ConflictResolver, MAX_COMMIT_ATTEMPTS},
};

/// Orchestrates manual conflict resolution
pub struct ResolveConflictUseCase {
    operation_store: Arc<dyn IOperationStore>,
    entity_store: Arc<dyn IEntityStore>,
    resolver: Arc<ConflictResolver>,
}

impl ResolveConflictUseCase {
    pub fn new(
        operation_store: Arc<dyn IOperationStore>,
        entity_store: Arc<dyn IEntityStore>,
        resolver: Arc<ConflictResolver>,
    ) -> Self {
        Self {
            operation_store,
            entity_store,
            resolver,
        }
    }

    /// Resolves one operation on behalf of `user_id`
    ///
    /// The operation must belong to the caller and must already have been
    /// applied; the request is validated before anything is loaded. The
    /// decision is re-made on a fresh read whenever another writer moves the
    /// entity first, so the entity's `updated_at` only ever advances.
    #[tracing::instrument(
        skip(self, request),
        fields(operation_id = %request.operation_id, resolution = %request.resolution)
    )]
    pub async fn resolve(
        &self,
        user_id: UserId,
        request: &ConflictResolutionRequest,
    ) -> Result<AppliedResolution, ConflictError> {
        let policy = ResolutionPolicy::from_request(request)?;

        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let op = self
                .operation_store
                .get_operation(request.operation_id)
                .await?
                .filter(|op| op.user_id == user_id)
                .ok_or_else(|| {
                    ConflictError::NotFound(format!("operation {}", request.operation_id))
                })?;

            match op.sync_status {
                SyncStatus::Resolved => {
                    return Err(ConflictError::AlreadyResolved(op.id.to_string()));
                }
                SyncStatus::Pending => {
                    return Err(ConflictError::InvalidRequest(format!(
                        "operation {} has not been applied yet",
                        op.id
                    )));
                }
                SyncStatus::Synced | SyncStatus::Conflicted => {}
            }

            let current = self.entity_store.get_entity(op.entity_id).await?;
            match self
                .resolver
                .apply(&op, current.as_ref(), DetectionOutcome::Clean, &policy)
                .await
            {
                Ok(applied) => {
                    info!(
                        entity_id = %op.entity_id,
                        mutated = applied.mutated(),
                        "Conflict resolved"
                    );
                    return Ok(applied);
                }
                // Re-read: the operation's new status decides what happens next
                Err(ConflictError::Stale(_)) | Err(ConflictError::Settled { .. }) => {
                    debug!(attempt, "Operation or entity changed during resolution, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(ConflictError::Stale(format!(
            "gave up resolving operation {} after {} attempts",
            request.operation_id, MAX_COMMIT_ATTEMPTS
        )))
    }

    /// Conflicts of `user_id` still awaiting resolution
    pub async fn unresolved(&self, user_id: UserId) -> Result<Vec<ConflictRecord>, ConflictError> {
        Ok(self.operation_store.unresolved_conflicts(user_id).await?)
    }
}


#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;
    use tasksync_core::{
        clock::HybridClock,
        domain::{ConflictStatus, Operation, OperationId, ResolutionChoice, Timestamp},
    };

    use super::*;
    use crate::resolver::tests::{snapshot, update_op, MapStore, OWNER};

    struct Fixture {
        store: Arc<MapStore>,
        use_case: ResolveConflictUseCase,
        op: Operation,
    }

    /// Entity "C" with a detected conflict, and the conflicted operation A -> C
    fn fixture() -> Fixture {
        let mut entity = snapshot("C", 300);
        entity.version = 3;
        entity.conflict_status = ConflictStatus::Detected;
        let store = MapStore::with(entity);

        let mut op = update_op("A", "C", 200);
        op.sync_status = SyncStatus::Conflicted;
        let op = store.log(op);
        store
            .conflicts
            .lock()
            .unwrap()
            .insert(op.id, ConflictRecord::new(&op, Some(json!("B")), op.server_timestamp));

        let resolver = Arc::new(ConflictResolver::new(
            store.clone(),
            Arc::new(HybridClock::new()),
        ));
        let use_case = ResolveConflictUseCase::new(store.clone(), store.clone(), resolver);
        Fixture {
            store,
            use_case,
            op,
        }
    }

    #[tokio::test]
    async fn test_merge_resolution_marks_operation_and_entity() {
        let fx = fixture();
        let mut merged = BTreeMap::new();
        merged.insert("title".to_string(), json!("B / C"));
        let request = ConflictResolutionRequest::new(fx.op.id, ResolutionChoice::Merge)
            .with_merged_data(merged);

        assert_eq!(fx.use_case.unresolved(OWNER).await.unwrap().len(), 1);
        let applied = fx.use_case.resolve(OWNER, &request).await.unwrap();

        assert_eq!(applied.status, SyncStatus::Resolved);
        let entity = fx.store.get(fx.op.entity_id).unwrap();
        assert_eq!(entity.field("title"), Some(&json!("B / C")));
        assert_eq!(entity.version, 4);
        assert_eq!(entity.conflict_status, ConflictStatus::Resolved);

        assert_eq!(fx.store.status(fx.op.id), SyncStatus::Resolved);
        assert!(fx.use_case.unresolved(OWNER).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_resolution_is_rejected() {
        let fx = fixture();
        let request = ConflictResolutionRequest::new(fx.op.id, ResolutionChoice::AcceptServer);

        fx.use_case.resolve(OWNER, &request).await.unwrap();
        let err = fx.use_case.resolve(OWNER, &request).await.unwrap_err();
        assert!(matches!(err, ConflictError::AlreadyResolved(_)));

        // Accepting the server value never touched the data
        assert_eq!(fx.store.get(fx.op.entity_id).unwrap().version, 3);
    }

    #[tokio::test]
    async fn test_concurrent_write_is_never_overtaken() {
        let fx = fixture();
        let later = Timestamp::from_micros(4_000_000_000_000_000);

        // Another writer commits after the resolution read the entity
        *fx.store.interleave.lock().unwrap() = Some(Box::new(move |entities| {
            let mut moved = snapshot("D", 0);
            moved.version = 4;
            moved.updated_at = later;
            entities.insert(moved.id, moved);
        }));

        let request = ConflictResolutionRequest::new(fx.op.id, ResolutionChoice::AcceptClient);
        let applied = fx.use_case.resolve(OWNER, &request).await.unwrap();

        let entity = applied.snapshot.unwrap();
        assert_eq!(entity.version, 5);
        assert_eq!(entity.field("title"), Some(&json!("C")));
        assert!(entity.updated_at > later);
        assert_eq!(fx.store.status(fx.op.id), SyncStatus::Resolved);
    }

    #[tokio::test]
    async fn test_foreign_operation_is_not_found() {
        let fx = fixture();
        let request = ConflictResolutionRequest::new(fx.op.id, ResolutionChoice::AcceptClient);

        let err = fx.use_case.resolve(UserId::new(99), &request).await.unwrap_err();
        assert!(matches!(err, ConflictError::NotFound(_)));

        let missing = ConflictResolutionRequest::new(OperationId::new(404), ResolutionChoice::AcceptClient);
        let err = fx.use_case.resolve(OWNER, &missing).await.unwrap_err();
        assert!(matches!(err, ConflictError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_merge_without_data_fails_before_loading() {
        let fx = fixture();
        let request = ConflictResolutionRequest::new(fx.op.id, ResolutionChoice::Merge);

        let err = fx.use_case.resolve(OWNER, &request).await.unwrap_err();
        assert!(matches!(err, ConflictError::InvalidRequest(_)));
        assert_eq!(fx.store.status(fx.op.id), SyncStatus::Conflicted);
    }

    #[tokio::test]
    async fn test_pending_operation_cannot_be_resolved() {
        let fx = fixture();
        let mut pending = fx.op.clone();
        pending.sync_status = SyncStatus::Pending;
        fx.store.log(pending);
        let request = ConflictResolutionRequest::new(fx.op.id, ResolutionChoice::AcceptClient);

        let err = fx.use_case.resolve(OWNER, &request).await.unwrap_err();
        assert!(matches!(err, ConflictError::InvalidRequest(_)));
    }
}
