//! Bulk transfers on top of the batch scheduler
//!
//! - Backlog replay: drain a user's pending operations through the same
//!   detect/resolve pipeline as a sync transaction.
//! - Dataset export: stream every live entity of a user into a sink.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use tasksync_core::{
    domain::{EntitySnapshot, UserId},
    ports::IEntityStore,
};

use crate::{
    batch::{BatchOptions, BatchScheduler, ItemError, RunResult},
    oplog::OperationLog,
    processor::OperationProcessor,
    SyncError,
};

/// Destination of a dataset export
#[async_trait::async_trait]
pub trait IExportSink: Send + Sync {
    /// Writes one entity; an error fails only this item
    async fn write(&self, entity: &EntitySnapshot) -> anyhow::Result<()>;
}

/// Starts replay and export runs
pub struct TransferService {
    scheduler: BatchScheduler,
    processor: Arc<OperationProcessor>,
    log: Arc<OperationLog>,
    entities: Arc<dyn IEntityStore>,
}

impl TransferService {
    pub fn new(
        scheduler: BatchScheduler,
        processor: Arc<OperationProcessor>,
        log: Arc<OperationLog>,
        entities: Arc<dyn IEntityStore>,
    ) -> Self {
        Self {
            scheduler,
            processor,
            log,
            entities,
        }
    }

    /// The scheduler, for status polls and cancellation
    pub fn scheduler(&self) -> &BatchScheduler {
        &self.scheduler
    }

    /// Replays the user's pending operations in the background
    ///
    /// Missing entities and malformed operations fail their item only; an
    /// unavailable store fails the run.
    #[tracing::instrument(skip(self, options))]
    pub async fn start_replay(
        &self,
        user_id: UserId,
        options: Option<BatchOptions>,
    ) -> Result<JoinHandle<RunResult>, SyncError> {
        let pending = self.log.pending(user_id).await?;
        info!(operations = pending.len(), "Replaying pending operations");

        let processor = Arc::clone(&self.processor);
        self.scheduler.start(
            user_id,
            pending,
            options.unwrap_or_else(|| self.scheduler.defaults()),
            move |op| {
                let processor = Arc::clone(&processor);
                async move {
                    match processor.process(&op).await {
                        Ok(_) => Ok(()),
                        Err(e) if e.is_fatal() => Err(ItemError::Fatal(e.into())),
                        Err(e) => Err(ItemError::Recoverable(e.into())),
                    }
                }
            },
        )
    }

    /// Exports every live entity of the user into `sink` in the background
    #[tracing::instrument(skip(self, sink, options))]
    pub async fn start_export(
        &self,
        user_id: UserId,
        sink: Arc<dyn IExportSink>,
        options: Option<BatchOptions>,
    ) -> Result<JoinHandle<RunResult>, SyncError> {
        let entities: Vec<EntitySnapshot> = self
            .entities
            .list_changed_since(user_id, None, usize::MAX)
            .await?
            .into_iter()
            .filter(|entity| !entity.deleted)
            .collect();
        info!(entities = entities.len(), "Exporting entities");

        self.scheduler.start(
            user_id,
            entities,
            options.unwrap_or_else(|| self.scheduler.defaults()),
            move |entity| {
                let sink = Arc::clone(&sink);
                async move { sink.write(&entity).await.map_err(ItemError::Recoverable) }
            },
        )
    }
}
