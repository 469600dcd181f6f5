//! Operation processor
//!
//! Runs one logged operation through detection and automatic resolution:
//!
//! ```text
//! Operation (pending) ─► ConflictDetector ─► ConflictResolver(AutoLww)
//!                              ▲                     │ one commit: entity,
//!                              └──── stale: re-read ◄┤ status, conflict
//!                                                    └─► notify change
//! ```
//!
//! Operations for the same entity are processed one at a time. The entity
//! write and the status change are committed together and only while the
//! stored status is still `pending`, so a retried sync, a backlog replay or
//! a failed commit never applies an operation twice.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use tasksync_conflict::{
    AppliedResolution, ConflictDetector, ConflictError, ConflictResolver, ResolutionPolicy,
    MAX_COMMIT_ATTEMPTS,
};
use tasksync_core::{
    clock::HybridClock,
    domain::{ConflictRecord, EntityId, EntitySnapshot, Operation, SyncStatus},
    ports::{EntityChange, IChangeNotifier, IEntityStore, IOperationStore},
};
use tasksync_telemetry::MetricsRegistry;

use crate::SyncError;

/// Result of processing one operation
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// The operation's mutation was committed
    Applied {
        snapshot: EntitySnapshot,
        conflict: Option<ConflictRecord>,
        status: SyncStatus,
    },
    /// The operation had already been applied; nothing changed
    Skipped(SyncStatus),
}

impl ProcessOutcome {
    pub fn conflict(&self) -> Option<&ConflictRecord> {
        match self {
            ProcessOutcome::Applied { conflict, .. } => conflict.as_ref(),
            ProcessOutcome::Skipped(_) => None,
        }
    }
}

/// Applies logged operations with last-writer-wins
pub struct OperationProcessor {
    entities: Arc<dyn IEntityStore>,
    operations: Arc<dyn IOperationStore>,
    resolver: ConflictResolver,
    notifier: Option<Arc<dyn IChangeNotifier>>,
    metrics: Option<Arc<MetricsRegistry>>,
    entity_locks: DashMap<EntityId, Arc<Mutex<()>>>,
}

impl OperationProcessor {
    pub fn new(
        entities: Arc<dyn IEntityStore>,
        operations: Arc<dyn IOperationStore>,
        clock: Arc<HybridClock>,
    ) -> Self {
        Self {
            resolver: ConflictResolver::new(Arc::clone(&operations), clock),
            entities,
            operations,
            notifier: None,
            metrics: None,
            entity_locks: DashMap::new(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn IChangeNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_persist_conflicts(mut self, persist: bool) -> Self {
        self.resolver = self.resolver.with_persist_conflicts(persist);
        self
    }

    /// Detects and resolves `op`, committing its new status with the write
    ///
    /// Missing or foreign entities fail with [`SyncError::NotFound`] and
    /// leave the operation `pending`.
    #[tracing::instrument(
        skip(self, op),
        fields(sequence_id = %op.sequence_id, entity_id = %op.entity_id)
    )]
    pub async fn process(&self, op: &Operation) -> Result<ProcessOutcome, SyncError> {
        let lock = self.entity_lock(op.entity_id);
        let result = {
            let _held = lock.lock().await;
            self.process_locked(op).await
        };
        drop(lock);
        self.release_entity_lock(op.entity_id);
        result
    }

    async fn process_locked(&self, op: &Operation) -> Result<ProcessOutcome, SyncError> {
        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let stored = self
                .operations
                .get_operation(op.id)
                .await?
                .ok_or_else(|| SyncError::NotFound(format!("operation {}", op.id)))?;
            if stored.sync_status.is_settled() {
                debug!(status = %stored.sync_status, "Operation already applied, skipping");
                return Ok(ProcessOutcome::Skipped(stored.sync_status));
            }

            // Another user's entity is treated as missing
            let current = self
                .entities
                .get_entity(stored.entity_id)
                .await?
                .filter(|entity| entity.owner_id == stored.user_id);
            let outcome = ConflictDetector::evaluate(&stored, current.as_ref());

            match self
                .resolver
                .apply(&stored, current.as_ref(), outcome, &ResolutionPolicy::AutoLww)
                .await
            {
                Ok(applied) => return self.committed(&stored, applied).await,
                // A writer outside this process got there first; decide again
                Err(ConflictError::Stale(_)) | Err(ConflictError::Settled { .. }) => {
                    debug!(attempt, "Commit raced a concurrent write, re-evaluating");
                }
                Err(e) => {
                    let err = SyncError::from(e);
                    self.record(&stored, err.kind());
                    return Err(err);
                }
            }
        }

        Err(SyncError::Infrastructure(anyhow::anyhow!(
            "entity {} kept changing; gave up after {} attempts",
            op.entity_id,
            MAX_COMMIT_ATTEMPTS
        )))
    }

    async fn committed(
        &self,
        op: &Operation,
        applied: AppliedResolution,
    ) -> Result<ProcessOutcome, SyncError> {
        let AppliedResolution {
            snapshot,
            conflict,
            status,
        } = applied;
        let Some(snapshot) = snapshot else {
            return Err(SyncError::Infrastructure(anyhow::anyhow!(
                "automatic resolution committed no snapshot"
            )));
        };

        if conflict.is_some() {
            if let Some(metrics) = &self.metrics {
                metrics.record_conflict(ResolutionPolicy::AutoLww.label());
            }
        }
        self.record(op, status.as_str());

        self.notify(EntityChange::from_snapshot(&snapshot, Some(op.device_id.clone())))
            .await;

        Ok(ProcessOutcome::Applied {
            snapshot,
            conflict,
            status,
        })
    }

    async fn notify(&self, change: EntityChange) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        if let Err(e) = notifier.notify(&change).await {
            warn!(
                entity_id = %change.entity_id,
                error = %e,
                "Change notification failed"
            );
        }
    }

    fn record(&self, op: &Operation, status: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_operation(op.operation_type.as_str(), status);
        }
    }

    fn entity_lock(&self, entity_id: EntityId) -> Arc<Mutex<()>> {
        Arc::clone(self.entity_locks.entry(entity_id).or_default().value())
    }

    // Drops the map entry once no other caller holds or awaits the lock
    fn release_entity_lock(&self, entity_id: EntityId) {
        self.entity_locks
            .remove_if(&entity_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}
