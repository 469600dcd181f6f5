//! Sync coordinator
//!
//! Runs one sync transaction per (user, device):
//!
//! ```text
//! claim session ─► for each op: append ─► detect ─► resolve(AutoLww)
//!                                   │
//!                                   └─► per-op failure (validation, not found)
//!              ─► delta since lastSyncTime (paged) ─► release session
//! ```
//!
//! A second sync for the same client fails fast with
//! [`SyncError::SyncInProgress`]. Infrastructure errors abort the
//! transaction; the session is released on every path.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use tasksync_core::{
    clock::HybridClock,
    config::SyncConfig,
    domain::{
        ConflictRecord, DeviceId, EntityId, EntitySnapshot, NewOperation, Operation, SequenceId,
        SessionKey, SyncSession, Timestamp, UserId,
    },
    ports::{IEntityStore, IOperationStore},
};
use tasksync_telemetry::MetricsRegistry;

use crate::{
    oplog::OperationLog,
    processor::{OperationProcessor, ProcessOutcome},
    registry::SessionRegistry,
    SyncError,
};

// ============================================================================
// Wire types
// ============================================================================

/// Sync request as submitted by a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub device_id: DeviceId,
    #[serde(default)]
    pub last_sync_time: Option<Timestamp>,
    #[serde(default)]
    pub pending_operations: Vec<NewOperation>,
}

/// Result of a sync transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    /// Entities changed since `lastSyncTime`, tombstones included
    pub server_updates: Vec<EntitySnapshot>,
    pub conflicts: Vec<ConflictRecord>,
    /// Pass back as `lastSyncTime` on the next sync
    pub sync_timestamp: Timestamp,
    /// The delta was capped; sync again to fetch the rest
    pub has_more: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<OperationFailure>,
}

/// Why a single operation was not applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    NotFound,
}

/// Non-fatal, per-operation failure reported alongside the response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationFailure {
    #[serde(default)]
    pub sequence_id: Option<SequenceId>,
    #[serde(rename = "todoId")]
    pub entity_id: EntityId,
    pub kind: FailureKind,
    pub message: String,
}

impl OperationFailure {
    /// Classifies `err`, handing fatal errors back to the caller
    fn from_error(
        sequence_id: Option<SequenceId>,
        entity_id: EntityId,
        err: SyncError,
    ) -> Result<Self, SyncError> {
        let (kind, message) = match err {
            SyncError::Validation(message) => (FailureKind::Validation, message),
            SyncError::NotFound(what) => (FailureKind::NotFound, format!("{what} not found")),
            fatal => return Err(fatal),
        };
        warn!(entity_id = %entity_id, kind = ?kind, message = %message, "Operation rejected");
        Ok(Self {
            sequence_id,
            entity_id,
            kind,
            message,
        })
    }
}

// ============================================================================
// SyncCoordinator
// ============================================================================

/// Orchestrates sync transactions
pub struct SyncCoordinator {
    log: OperationLog,
    processor: Arc<OperationProcessor>,
    entities: Arc<dyn IEntityStore>,
    clock: Arc<HybridClock>,
    sessions: SessionRegistry<SessionKey, ()>,
    page_size: usize,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl SyncCoordinator {
    pub fn new(
        entities: Arc<dyn IEntityStore>,
        operations: Arc<dyn IOperationStore>,
        clock: Arc<HybridClock>,
        config: &SyncConfig,
    ) -> Self {
        let processor = OperationProcessor::new(
            Arc::clone(&entities),
            Arc::clone(&operations),
            Arc::clone(&clock),
        )
        .with_persist_conflicts(config.persist_conflicts);

        Self {
            log: OperationLog::new(operations, Arc::clone(&clock)),
            processor: Arc::new(processor),
            entities,
            clock,
            sessions: SessionRegistry::new("sync"),
            page_size: config.page_size.max(1),
            metrics: None,
        }
    }

    /// Replaces the processor, e.g. one configured with a notifier
    ///
    /// Share the same processor with backlog replay so both paths
    /// serialize on the same entity locks.
    pub fn with_processor(mut self, processor: Arc<OperationProcessor>) -> Self {
        self.processor = processor;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.sessions = self.sessions.with_metrics(Arc::clone(&metrics));
        self.metrics = Some(metrics);
        self
    }

    pub fn processor(&self) -> Arc<OperationProcessor> {
        Arc::clone(&self.processor)
    }

    /// Handles a deserialized [`SyncRequest`]
    pub async fn handle_request(
        &self,
        user_id: UserId,
        request: SyncRequest,
    ) -> Result<SyncResponse, SyncError> {
        self.handle_sync(
            user_id,
            request.device_id,
            request.last_sync_time,
            request.pending_operations,
        )
        .await
    }

    /// Runs one sync transaction for (`user_id`, `device_id`)
    ///
    /// Operations are applied in submission order. Conflicts are returned
    /// as data; malformed operations and missing entities are reported in
    /// [`SyncResponse::errors`] without stopping the loop.
    #[tracing::instrument(
        skip_all,
        fields(user_id = %user_id, device_id = %device_id, operations = operations.len())
    )]
    pub async fn handle_sync(
        &self,
        user_id: UserId,
        device_id: DeviceId,
        last_sync_time: Option<Timestamp>,
        operations: Vec<NewOperation>,
    ) -> Result<SyncResponse, SyncError> {
        let started = Instant::now();
        let key = SessionKey::new(user_id, device_id.clone());
        let Some(session) = self.sessions.try_start(key, ()) else {
            warn!("Sync already in progress, rejecting");
            self.record_outcome("rejected");
            return Err(SyncError::SyncInProgress { user_id, device_id });
        };

        info!(last_sync_time = ?last_sync_time, "Sync started");
        let result = self
            .transact(user_id, &device_id, last_sync_time, operations)
            .await;

        match &result {
            Ok(response) => {
                session.finish(self.clock.now());
                info!(
                    updates = response.server_updates.len(),
                    conflicts = response.conflicts.len(),
                    errors = response.errors.len(),
                    has_more = response.has_more,
                    "Sync finished"
                );
                self.record_outcome("ok");
            }
            Err(e) => {
                drop(session);
                error!(error = %e, "Sync aborted");
                self.record_outcome("failed");
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.observe_sync_duration(started.elapsed().as_secs_f64());
        }

        result
    }

    async fn transact(
        &self,
        user_id: UserId,
        device_id: &DeviceId,
        last_sync_time: Option<Timestamp>,
        operations: Vec<NewOperation>,
    ) -> Result<SyncResponse, SyncError> {
        let mut conflicts = Vec::new();
        let mut errors = Vec::new();

        for new_op in operations {
            let sequence_id = new_op.sequence_id.clone();
            let entity_id = new_op.entity_id;

            let op = match self.log.append(user_id, device_id, new_op).await {
                Ok(op) => op,
                Err(e) => {
                    errors.push(OperationFailure::from_error(sequence_id, entity_id, e)?);
                    continue;
                }
            };

            match self.apply(&op).await {
                Ok(Some(record)) => conflicts.push(record),
                Ok(None) => {}
                Err(e) => errors.push(OperationFailure::from_error(
                    Some(op.sequence_id),
                    op.entity_id,
                    e,
                )?),
            }
        }

        let (server_updates, sync_timestamp, has_more) =
            self.delta(user_id, last_sync_time).await?;

        Ok(SyncResponse {
            server_updates,
            conflicts,
            sync_timestamp,
            has_more,
            errors,
        })
    }

    async fn apply(&self, op: &Operation) -> Result<Option<ConflictRecord>, SyncError> {
        match self.processor.process(op).await? {
            ProcessOutcome::Applied { conflict, .. } => Ok(conflict),
            ProcessOutcome::Skipped(_) => Ok(None),
        }
    }

    /// Entities changed since `since`, capped at the page size
    ///
    /// When capped, the returned timestamp is the last entity's `updated_at`
    /// so the next sync resumes right after it.
    async fn delta(
        &self,
        user_id: UserId,
        since: Option<Timestamp>,
    ) -> Result<(Vec<EntitySnapshot>, Timestamp, bool), SyncError> {
        let now = self.clock.now();
        let mut updates = self
            .entities
            .list_changed_since(user_id, since, self.page_size.saturating_add(1))
            .await?;

        let has_more = updates.len() > self.page_size;
        if has_more {
            updates.truncate(self.page_size);
        }
        let sync_timestamp = match updates.last() {
            Some(last) if has_more => last.updated_at,
            _ => now,
        };

        Ok((updates, sync_timestamp, has_more))
    }

    /// Observable state of a client's session
    pub fn session(&self, key: &SessionKey) -> SyncSession {
        SyncSession {
            key: key.clone(),
            is_running: self.sessions.is_running(key),
            last_sync_time: self.sessions.last_completed(key),
        }
    }

    /// Operations of `user_id` logged but not yet applied
    pub async fn pending(&self, user_id: UserId) -> Result<Vec<Operation>, SyncError> {
        self.log.pending(user_id).await
    }

    fn record_outcome(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_sync_request(outcome);
        }
    }
}
